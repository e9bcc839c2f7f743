//! Work-Assignment Engine (spec.md §4.E): pulls candidates, ranks by
//! strategy, reserves files via the Coordination Client, records via the
//! State Store, and delivers prompts via the Session & Pane Orchestrator.
//! Grounded on the teacher's `AgentPool` (`src/agent/pool.rs`) generalized
//! from "pool of live agent handles" to "pool of idle panes."

pub mod strategy;
pub mod triage;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use glob::Pattern;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub use strategy::{AgentStats, IdlePane, RoundRobinCursor, Strategy};
pub use triage::{Candidate, FixtureTriageSource, TriageSource};

use crate::coordination::Coordination;
use crate::session::{Orchestrator, SendTargets};
use crate::store::{Assignment, AssignmentStatus, Store};
use crate::tmux::{AgentType, Multiplexer, Pane};

#[derive(Debug, thiserror::Error)]
pub enum AssignmentError {
    #[error("work item is not assigned (current status: {current_status})")]
    NotAssigned { current_status: String },
    #[error("work item already in a terminal state")]
    AlreadyAssigned,
    #[error("pane '{0}' not found")]
    PaneNotFound(String),
    #[error("no idle agent of type '{0}'")]
    NoIdleAgent(String),
    #[error("pane '{0}' is busy")]
    TargetBusy(String),
    #[error("{0}")]
    ReassignError(String),
    #[error("reassignment of a '{current_status}' assignment is not permitted")]
    ReassignNotAllowed { current_status: String },
    #[error("{0}")]
    Validation(String),
    #[error("operation cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Default)]
pub struct AssignmentFilters {
    pub agent_type: Option<AgentType>,
    pub work_ids: Option<HashSet<String>>,
    pub ignore_deps: bool,
}

#[derive(Debug, Clone)]
pub enum PromptTemplate {
    Impl,
    Review,
    Custom(PathBuf),
}

impl PromptTemplate {
    const IMPL: &'static str =
        "Implement {work_id}: {title}\n\n{description}\n\nAgent: {agent_type}";
    const REVIEW: &'static str =
        "Review {work_id}: {title}\n\n{description}\n\nAgent: {agent_type}";

    async fn load(&self) -> anyhow::Result<String> {
        match self {
            PromptTemplate::Impl => Ok(Self::IMPL.to_string()),
            PromptTemplate::Review => Ok(Self::REVIEW.to_string()),
            PromptTemplate::Custom(path) => Ok(tokio::fs::read_to_string(path).await?),
        }
    }

    pub async fn render(&self, candidate: &Candidate) -> anyhow::Result<String> {
        let template = self.load().await?;
        Ok(template
            .replace("{work_id}", &candidate.work_id)
            .replace("{title}", &candidate.title)
            .replace("{description}", &candidate.description)
            .replace("{agent_type}", candidate.agent_type.as_str()))
    }
}

/// Target for `Reassign` (spec.md §4.E).
#[derive(Debug, Clone, Copy)]
pub enum ReassignTarget {
    Pane(u32),
    AgentType(AgentType),
}

pub struct Engine<M: Multiplexer> {
    orchestrator: std::sync::Arc<Orchestrator<M>>,
    store: std::sync::Arc<dyn Store>,
    coordination: std::sync::Arc<dyn Coordination>,
    project: String,
}

impl<M: Multiplexer> Engine<M> {
    pub fn new(
        orchestrator: std::sync::Arc<Orchestrator<M>>,
        store: std::sync::Arc<dyn Store>,
        coordination: std::sync::Arc<dyn Coordination>,
        project: impl Into<String>,
    ) -> Self {
        Self {
            orchestrator,
            store,
            coordination,
            project: project.into(),
        }
    }

    /// True when two glob patterns could claim an overlapping set of
    /// concrete paths: either matches the other's literal text, which is
    /// a conservative but sound approximation for the fixed patterns this
    /// system deals with (directory globs and exact paths).
    fn patterns_overlap(a: &str, b: &str) -> bool {
        if a == b {
            return true;
        }
        match (Pattern::new(a), Pattern::new(b)) {
            (Ok(pa), Ok(pb)) => pa.matches(b) || pb.matches(a),
            _ => false,
        }
    }

    async fn is_eligible(
        &self,
        candidate: &Candidate,
        session: &str,
        ignore_deps: bool,
        active_reservations: &[crate::coordination::FileReservation],
    ) -> bool {
        if !ignore_deps {
            for dep in &candidate.dependencies {
                match self.store.get(session, dep).await {
                    Ok(record) if record.status == AssignmentStatus::Completed => {}
                    _ => return false,
                }
            }
        }
        for pattern in &candidate.file_patterns {
            let blocked = active_reservations.iter().any(|r| {
                r.exclusive && Self::patterns_overlap(&r.path_pattern, pattern)
            });
            if blocked {
                return false;
            }
        }
        true
    }

    /// Candidate selection + agent selection + pairing + reservation +
    /// commit, in one pass (spec.md §4.E).
    pub async fn plan_and_commit(
        &self,
        session: &str,
        triage: &dyn TriageSource,
        strategy: Strategy,
        limit: usize,
        filters: AssignmentFilters,
        prompt_template: PromptTemplate,
        reserve_files: bool,
        token: &CancellationToken,
    ) -> anyhow::Result<Vec<Assignment>> {
        let candidates = triage.fetch_candidates(None).await?;
        let candidates: Vec<Candidate> = candidates
            .into_iter()
            .filter(|c| filters.agent_type.map(|t| t == c.agent_type).unwrap_or(true))
            .filter(|c| {
                filters
                    .work_ids
                    .as_ref()
                    .map(|ids| ids.contains(&c.work_id))
                    .unwrap_or(true)
            })
            .collect();

        let active_reservations = self
            .coordination
            .list_reservations(&self.project, None, false)
            .await
            .unwrap_or_default();

        let panes = self.orchestrator.get_panes(session, token).await?;
        let existing = self.store.load_store(session).await.unwrap_or_default();
        let busy_panes: HashSet<u32> = existing
            .iter()
            .filter(|a| matches!(a.status, AssignmentStatus::Assigned | AssignmentStatus::Working))
            .map(|a| a.pane)
            .collect();

        let mut idle_by_type: HashMap<AgentType, Vec<IdlePane>> = HashMap::new();
        for pane in panes.iter().filter(|p| p.agent_type != Some(AgentType::User)) {
            if let Some(agent_type) = pane.agent_type {
                if !busy_panes.contains(&pane.index) {
                    idle_by_type
                        .entry(agent_type)
                        .or_default()
                        .push(IdlePane { pane_index: pane.index });
                }
            }
        }

        let stats = compute_stats(&existing);
        let mut cursor = RoundRobinCursor::default();
        let mut committed = Vec::new();

        for candidate in &candidates {
            if token.is_cancelled() {
                break;
            }
            if limit != 0 && committed.len() >= limit {
                break;
            }
            if !self
                .is_eligible(candidate, session, filters.ignore_deps, &active_reservations)
                .await
            {
                continue;
            }
            let idle = idle_by_type.entry(candidate.agent_type).or_default();
            let Some(chosen) = strategy::select_agent(strategy, idle, &stats, &mut cursor) else {
                continue;
            };
            idle.retain(|p| p.pane_index != chosen.pane_index);

            let pane = panes
                .iter()
                .find(|p| p.index == chosen.pane_index)
                .expect("chosen pane came from panes list");

            let mut assignment = Assignment::new(
                session,
                candidate.work_id.clone(),
                candidate.title.clone(),
                pane.index,
                candidate.agent_type,
                pane.variant.clone(),
                "",
            );

            if reserve_files && !candidate.file_patterns.is_empty() {
                match self
                    .coordination
                    .reserve_files(
                        &format!("pane-{}", pane.index),
                        &candidate.file_patterns,
                        &candidate.work_id,
                        Duration::from_secs(3600),
                    )
                    .await
                {
                    Ok(_) => {}
                    Err(crate::coordination::CoordinationError::Unavailable(msg)) => {
                        assignment.reservation_warning = Some(format!("coordination unavailable: {msg}"));
                    }
                    Err(e) => {
                        warn!(work_id = %candidate.work_id, error = %e, "reservation failed, skipping pair");
                        continue;
                    }
                }
            }

            let prompt = prompt_template.render(candidate).await?;
            assignment.initial_prompt = prompt.clone();

            let assignment = self.store.assign(assignment).await?;
            self.orchestrator
                .send(
                    session,
                    &prompt,
                    SendTargets {
                        pane_index: Some(pane.index),
                        ..Default::default()
                    },
                    false,
                    true,
                    token,
                )
                .await?;
            let assignment = self.store.mark_working(session, &assignment.work_id).await?;
            committed.push(assignment);
        }

        Ok(committed)
    }

    /// **Reassign(work_id, to_pane | to_type, force, prompt)** (spec.md
    /// §4.E).
    pub async fn reassign(
        &self,
        session: &str,
        work_id: &str,
        target: ReassignTarget,
        force: bool,
        prompt: &str,
        token: &CancellationToken,
    ) -> Result<Assignment, AssignmentError> {
        let source = self
            .store
            .get(session, work_id)
            .await
            .map_err(|_| AssignmentError::NotAssigned {
                current_status: "unknown".to_string(),
            })?;

        match source.status {
            AssignmentStatus::Assigned | AssignmentStatus::Working => {}
            AssignmentStatus::Failed => {
                return Err(AssignmentError::ReassignNotAllowed {
                    current_status: source.status.as_str().to_string(),
                })
            }
            AssignmentStatus::Completed | AssignmentStatus::Reassigned => {
                return Err(AssignmentError::AlreadyAssigned)
            }
        }

        let panes = self
            .orchestrator
            .get_panes(session, token)
            .await
            .map_err(|e| AssignmentError::ReassignError(e.to_string()))?;

        let existing = self.store.load_store(session).await.unwrap_or_default();
        let busy: HashSet<u32> = existing
            .iter()
            .filter(|a| {
                a.work_id != work_id
                    && matches!(a.status, AssignmentStatus::Assigned | AssignmentStatus::Working)
            })
            .map(|a| a.pane)
            .collect();

        let target_pane = match target {
            ReassignTarget::Pane(index) => panes
                .iter()
                .find(|p| p.index == index)
                .ok_or_else(|| AssignmentError::PaneNotFound(index.to_string()))?
                .clone(),
            ReassignTarget::AgentType(agent_type) => {
                let mut candidates: Vec<&Pane> = panes
                    .iter()
                    .filter(|p| p.agent_type == Some(agent_type) && !busy.contains(&p.index))
                    .collect();
                candidates.sort_by_key(|p| p.index);
                candidates
                    .first()
                    .map(|p| (*p).clone())
                    .ok_or_else(|| AssignmentError::NoIdleAgent(agent_type.to_string()))?
            }
        };

        if busy.contains(&target_pane.index) && !force {
            return Err(AssignmentError::TargetBusy(target_pane.index.to_string()));
        }

        let transferred = self
            .coordination
            .transfer_reservations(
                &format!("pane-{}", source.pane),
                &format!("pane-{}", target_pane.index),
                work_id,
            )
            .await;

        // Relocates the single `{session, work_id}` record in place: same
        // key, new pane/agent_type, ends Working. The key has no room for a
        // separate `Reassigned` source record plus an `Assigned` target one.
        let relocated = self
            .store
            .reassign(
                session,
                work_id,
                target_pane.index,
                target_pane.agent_type.unwrap_or(source.agent_type),
                target_pane.variant.clone(),
                prompt,
                transferred,
            )
            .await
            .map_err(|e| AssignmentError::ReassignError(e.to_string()))?;

        self.orchestrator
            .send(
                session,
                prompt,
                SendTargets {
                    pane_index: Some(target_pane.index),
                    ..Default::default()
                },
                false,
                true,
                token,
            )
            .await
            .map_err(|e| AssignmentError::ReassignError(e.to_string()))?;

        Ok(relocated)
    }
}

fn compute_stats(existing: &[Assignment]) -> HashMap<u32, AgentStats> {
    let mut stats: HashMap<u32, AgentStats> = HashMap::new();
    for assignment in existing {
        let entry = stats.entry(assignment.pane).or_default();
        match assignment.status {
            AssignmentStatus::Completed => {
                entry.completed_count += 1;
                if let (Some(working_at), Some(completed_at)) =
                    (assignment.working_at, assignment.completed_at)
                {
                    let secs = (completed_at - working_at).num_seconds().max(0) as f64;
                    entry.avg_working_to_completed_secs = Some(
                        match entry.avg_working_to_completed_secs {
                            Some(existing_avg) => (existing_avg + secs) / 2.0,
                            None => secs,
                        },
                    );
                }
            }
            AssignmentStatus::Failed => {
                entry.recent_failed_ratio = (entry.recent_failed_ratio + 1.0).min(1.0);
            }
            _ => {}
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MultiplexerConfig;
    use crate::session::{AgentSpec, Orchestrator};
    use crate::store::JsonFileStore;
    use crate::tmux::fakes::RecordingMultiplexer;
    use std::sync::Arc;

    struct NullCoordination;

    #[async_trait::async_trait]
    impl Coordination for NullCoordination {
        async fn read_resource(&self, _uri: &str) -> Result<serde_json::Value, crate::coordination::CoordinationError> {
            Err(crate::coordination::CoordinationError::Unavailable("no server".into()))
        }
        async fn call_tool(&self, _name: &str, _params: serde_json::Value) -> Result<serde_json::Value, crate::coordination::CoordinationError> {
            Err(crate::coordination::CoordinationError::Unavailable("no server".into()))
        }
        async fn list_reservations(
            &self,
            _project: &str,
            _filter_agent: Option<&str>,
            _include_inactive: bool,
        ) -> Result<Vec<crate::coordination::FileReservation>, crate::coordination::CoordinationError> {
            Ok(vec![])
        }
        async fn reserve_files(
            &self,
            _agent: &str,
            _patterns: &[String],
            _reason: &str,
            _ttl: Duration,
        ) -> Result<Vec<crate::coordination::FileReservation>, crate::coordination::CoordinationError> {
            Ok(vec![])
        }
        async fn transfer_reservations(&self, _from: &str, _to: &str, _work_id: &str) -> bool {
            true
        }
        async fn is_available(&self) -> bool {
            false
        }
    }

    async fn setup() -> (Engine<RecordingMultiplexer>, CancellationToken, tempfile::TempDir) {
        let mux = RecordingMultiplexer::new();
        let orchestrator = Arc::new(Orchestrator::new(mux, MultiplexerConfig::default()));
        let token = CancellationToken::new();
        orchestrator
            .spawn(
                "alpha",
                &[AgentSpec {
                    agent_type: AgentType::Claude,
                    count: Some(2),
                    model: None,
                    variants: None,
                }],
                false,
                "/tmp",
                &token,
            )
            .await
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonFileStore::new(
            dir.path().join("assignments"),
            dir.path().join("approvals.json"),
        ));
        let coordination = Arc::new(NullCoordination);
        let engine = Engine::new(orchestrator, store, coordination, "proj");
        (engine, token, dir)
    }

    #[tokio::test]
    async fn commits_assignment_for_eligible_candidate() {
        let (engine, token, _dir) = setup().await;
        let triage = FixtureTriageSource::new(vec![Candidate {
            work_id: "bd-1".to_string(),
            title: "Fix".to_string(),
            agent_type: AgentType::Claude,
            description: "desc".to_string(),
            file_patterns: vec![],
            dependencies: vec![],
        }]);
        let committed = engine
            .plan_and_commit(
                "alpha",
                &triage,
                Strategy::Balanced,
                0,
                AssignmentFilters::default(),
                PromptTemplate::Impl,
                false,
                &token,
            )
            .await
            .unwrap();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].status, AssignmentStatus::Working);
    }

    #[tokio::test]
    async fn dependency_gates_assignment() {
        let (engine, token, _dir) = setup().await;
        let triage = FixtureTriageSource::new(vec![
            Candidate {
                work_id: "bd-200".to_string(),
                title: "needs dep".to_string(),
                agent_type: AgentType::Claude,
                description: String::new(),
                file_patterns: vec![],
                dependencies: vec!["bd-199".to_string()],
            },
            Candidate {
                work_id: "bd-201".to_string(),
                title: "free".to_string(),
                agent_type: AgentType::Claude,
                description: String::new(),
                file_patterns: vec![],
                dependencies: vec![],
            },
        ]);
        let committed = engine
            .plan_and_commit(
                "alpha",
                &triage,
                Strategy::Balanced,
                0,
                AssignmentFilters::default(),
                PromptTemplate::Impl,
                false,
                &token,
            )
            .await
            .unwrap();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].work_id, "bd-201");
    }

    #[tokio::test]
    async fn reassign_of_failed_assignment_is_rejected() {
        let (engine, token, _dir) = setup().await;
        engine
            .store
            .assign(crate::store::Assignment::new(
                "alpha",
                "bd-1",
                "Fix",
                0,
                AgentType::Claude,
                None,
                "do it",
            ))
            .await
            .unwrap();
        engine.store.mark_working("alpha", "bd-1").await.unwrap();
        engine
            .store
            .mark_failed("alpha", "bd-1", "agent crashed")
            .await
            .unwrap();

        let err = engine
            .reassign(
                "alpha",
                "bd-1",
                ReassignTarget::Pane(1),
                false,
                "continue",
                &token,
            )
            .await
            .unwrap_err();

        match err {
            AssignmentError::ReassignNotAllowed { current_status } => {
                assert_eq!(current_status, "failed");
            }
            other => panic!("expected ReassignNotAllowed, got {other:?}"),
        }
    }
}
