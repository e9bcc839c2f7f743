//! Assignment record and its state machine (spec.md §3, §4.E).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tmux::AgentType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentStatus {
    Assigned,
    Working,
    Completed,
    Failed,
    Reassigned,
}

impl AssignmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentStatus::Assigned => "assigned",
            AssignmentStatus::Working => "working",
            AssignmentStatus::Completed => "completed",
            AssignmentStatus::Failed => "failed",
            AssignmentStatus::Reassigned => "reassigned",
        }
    }

    /// The state machine from spec.md §4.E:
    ///
    /// ```text
    ///         Assigned --> Working --> Completed
    ///            |            |           (terminal)
    ///            |            +--> Failed --> Assigned (retry)
    ///            |            |
    ///            +------------+--> Reassigned (terminal for this record)
    /// ```
    ///
    /// `Failed -> Reassigned` is explicitly forbidden. `Reassigned` is part
    /// of the declared status set, but `Store::reassign` itself relocates a
    /// record in place (new pane/agent_type, ending in `Working`) rather
    /// than parking it here — a second record can't live under the same
    /// `{session, work_id}` key to receive it.
    pub fn can_transition_to(&self, next: AssignmentStatus) -> bool {
        use AssignmentStatus::*;
        matches!(
            (self, next),
            (Assigned, Working)
                | (Working, Completed)
                | (Working, Failed)
                | (Failed, Assigned)
                | (Assigned, Reassigned)
                | (Working, Reassigned)
        )
    }
}

impl std::fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work routed to a pane (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub session: String,
    pub work_id: String,
    pub title: String,
    pub pane: u32,
    pub agent_type: AgentType,
    pub model: Option<String>,
    pub initial_prompt: String,
    pub status: AssignmentStatus,
    pub created_at: DateTime<Utc>,
    pub working_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub reassigned_at: Option<DateTime<Utc>>,
    /// `pane:agent_type` this record most recently moved *from*. Set by
    /// `Reassign`, which relocates a record in place rather than retiring it
    /// to a second record under the same key.
    pub reassigned_from: Option<String>,
    /// `pane:agent_type` this record most recently moved *to* (mirrors
    /// `pane`/`agent_type` at the time of that move). Set by `Reassign`.
    pub reassigned_to: Option<String>,
    pub denial_reason: Option<String>,
    /// Set when a reservation attempt failed for this pair (spec.md §4.E:
    /// "a warning is recorded on each Assignment").
    pub reservation_warning: Option<String>,
    pub file_reservations_transferred: Option<bool>,
}

impl Assignment {
    pub fn new(
        session: impl Into<String>,
        work_id: impl Into<String>,
        title: impl Into<String>,
        pane: u32,
        agent_type: AgentType,
        model: Option<String>,
        initial_prompt: impl Into<String>,
    ) -> Self {
        Self {
            session: session.into(),
            work_id: work_id.into(),
            title: title.into(),
            pane,
            agent_type,
            model,
            initial_prompt: initial_prompt.into(),
            status: AssignmentStatus::Assigned,
            created_at: Utc::now(),
            working_at: None,
            completed_at: None,
            failed_at: None,
            reassigned_at: None,
            reassigned_from: None,
            reassigned_to: None,
            denial_reason: None,
            reservation_warning: None,
            file_reservations_transferred: None,
        }
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.session, self.work_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions() {
        assert!(AssignmentStatus::Assigned.can_transition_to(AssignmentStatus::Working));
        assert!(AssignmentStatus::Working.can_transition_to(AssignmentStatus::Completed));
        assert!(AssignmentStatus::Working.can_transition_to(AssignmentStatus::Failed));
        assert!(AssignmentStatus::Failed.can_transition_to(AssignmentStatus::Assigned));
        assert!(AssignmentStatus::Assigned.can_transition_to(AssignmentStatus::Reassigned));
        assert!(AssignmentStatus::Working.can_transition_to(AssignmentStatus::Reassigned));
    }

    #[test]
    fn failed_to_reassigned_is_forbidden() {
        assert!(!AssignmentStatus::Failed.can_transition_to(AssignmentStatus::Reassigned));
    }

    #[test]
    fn terminal_states_reject_all_transitions() {
        for next in [
            AssignmentStatus::Assigned,
            AssignmentStatus::Working,
            AssignmentStatus::Completed,
            AssignmentStatus::Failed,
            AssignmentStatus::Reassigned,
        ] {
            assert!(!AssignmentStatus::Completed.can_transition_to(next));
            assert!(!AssignmentStatus::Reassigned.can_transition_to(next));
        }
    }
}
