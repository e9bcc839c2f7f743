//! Coordinator Loop (spec.md §4.G): a per-session long-lived background
//! task that ticks on an interval, classifies pane activity, raises
//! digests, flags file-reservation conflicts (and optionally attempts one
//! automated renegotiation each), and triggers the Work-Assignment Engine
//! when idle agents are available.
//!
//! Grounded on `src/session/coordinator.rs`'s `start_efficiency_monitoring`
//! / `start_coordination_processing` pair: both spawn a `tokio::spawn`
//! task around a `tokio::time::interval` and tick forever until shut down.
//! This module generalizes that shape onto the cooperative-cancellation
//! contract of spec.md §5 via `tokio_util::sync::CancellationToken`
//! (listed as a teacher dependency but, per `src/session/coordinator.rs`,
//! never actually used there for shutdown — this is the first module in
//! this crate to put it to its intended use).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use glob::Pattern;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::assignment::{
    AssignmentFilters, Engine as AssignmentEngine, PromptTemplate, Strategy, TriageSource,
};
use crate::config::{AssignmentConfig, CoordinatorConfig};
use crate::coordination::{Coordination, FileReservation};
use crate::session::{Orchestrator, SessionError};
use crate::store::{Assignment, Store, StoreError};
use crate::tmux::{AgentType, Multiplexer};

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0}")]
    Assignment(String),
}

/// Activity classification for a single agent pane, derived from recent
/// scrollback (spec.md §4.G).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaneState {
    Generating,
    Thinking,
    Waiting,
    Error,
    Unknown,
}

impl PaneState {
    fn label(&self) -> &'static str {
        match self {
            PaneState::Generating => "generating",
            PaneState::Thinking => "thinking",
            PaneState::Waiting => "waiting",
            PaneState::Error => "error",
            PaneState::Unknown => "unknown",
        }
    }
}

/// A pair of overlapping exclusive reservations held by different agents.
#[derive(Debug, Clone)]
pub struct Conflict {
    pub agent_a: String,
    pub agent_b: String,
    pub pattern_a: String,
    pub pattern_b: String,
}

/// Per-tick digest summary (spec.md §4.G: "counts by status, ... alerts").
#[derive(Debug, Clone)]
pub struct Digest {
    pub generated_at: DateTime<Utc>,
    pub pane_state_counts: HashMap<String, usize>,
    pub assignment_status_counts: HashMap<String, usize>,
    pub alerts: Vec<String>,
}

/// Outcome of a single [`Coordinator::tick`] call.
#[derive(Debug)]
pub struct TickReport {
    pub pane_states: HashMap<u32, PaneState>,
    pub digest: Option<Digest>,
    pub conflicts: Vec<Conflict>,
    pub negotiated: usize,
    pub auto_assigned: Vec<Assignment>,
}

/// Recent scrollback plus the time it last changed, used to tell a pane
/// that's merely quiet apart from `idle_threshold_secs` from one still
/// actively producing output.
struct PaneActivity {
    last_output: String,
    last_changed_at: DateTime<Utc>,
}

/// Best-effort, conservative overlap check between two glob path patterns
/// (duplicated from the Work-Assignment Engine's private helper rather
/// than widening that module's visibility for one caller).
fn patterns_overlap(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    match (Pattern::new(a), Pattern::new(b)) {
        (Ok(pa), Ok(pb)) => pa.matches(b) || pb.matches(a),
        _ => false,
    }
}

fn classify_output(output: &str) -> PaneState {
    let tail: String = output
        .lines()
        .rev()
        .take(5)
        .collect::<Vec<_>>()
        .join("\n")
        .to_lowercase();
    if tail.trim().is_empty() {
        PaneState::Unknown
    } else if tail.contains("error") || tail.contains("panic") || tail.contains("traceback") {
        PaneState::Error
    } else if tail.contains("thinking") || tail.contains("reasoning") || tail.contains("planning") {
        PaneState::Thinking
    } else if tail.contains("generating")
        || tail.contains("writing")
        || tail.contains("running")
        || tail.contains("applying")
    {
        PaneState::Generating
    } else {
        PaneState::Waiting
    }
}

fn detect_conflicts(reservations: &[FileReservation]) -> Vec<Conflict> {
    let mut conflicts = Vec::new();
    for i in 0..reservations.len() {
        for j in (i + 1)..reservations.len() {
            let a = &reservations[i];
            let b = &reservations[j];
            if a.agent_name == b.agent_name {
                continue;
            }
            if !(a.exclusive && b.exclusive) {
                continue;
            }
            if patterns_overlap(&a.path_pattern, &b.path_pattern) {
                conflicts.push(Conflict {
                    agent_a: a.agent_name.clone(),
                    agent_b: b.agent_name.clone(),
                    pattern_a: a.path_pattern.clone(),
                    pattern_b: b.path_pattern.clone(),
                });
            }
        }
    }
    conflicts
}

/// Per-session long-lived supervisor (spec.md §4.G). One instance is
/// shared (via [`Arc`]) across every session it supervises; per-pane
/// activity state is keyed by `"{session}:{pane_index}"`.
pub struct Coordinator<M: Multiplexer> {
    orchestrator: Arc<Orchestrator<M>>,
    store: Arc<dyn Store>,
    coordination: Arc<dyn Coordination>,
    assignment_engine: Arc<AssignmentEngine<M>>,
    config: CoordinatorConfig,
    assignment_config: AssignmentConfig,
    project: String,
    pane_activity: DashMap<String, PaneActivity>,
    last_digest_at: DashMap<String, DateTime<Utc>>,
}

impl<M: Multiplexer> Coordinator<M> {
    pub fn new(
        orchestrator: Arc<Orchestrator<M>>,
        store: Arc<dyn Store>,
        coordination: Arc<dyn Coordination>,
        assignment_engine: Arc<AssignmentEngine<M>>,
        config: CoordinatorConfig,
        assignment_config: AssignmentConfig,
        project: impl Into<String>,
    ) -> Self {
        Self {
            orchestrator,
            store,
            coordination,
            assignment_engine,
            config,
            assignment_config,
            project: project.into(),
            pane_activity: DashMap::new(),
            last_digest_at: DashMap::new(),
        }
    }

    fn activity_key(session: &str, pane_index: u32) -> String {
        format!("{session}:{pane_index}")
    }

    /// Classifies one pane, folding in idle detection: a pane reporting
    /// unchanged, blank-ish output for longer than `idle_threshold_secs`
    /// counts as `Waiting`; unchanged output observed more recently still
    /// counts as whatever its raw classification says (it may simply be
    /// between prompts).
    async fn classify_pane(
        &self,
        session: &str,
        pane_index: u32,
        output: &str,
        now: DateTime<Utc>,
    ) -> PaneState {
        let raw = classify_output(output);
        let key = Self::activity_key(session, pane_index);
        let mut entry = self.pane_activity.entry(key).or_insert_with(|| PaneActivity {
            last_output: String::new(),
            last_changed_at: now,
        });

        if entry.last_output != output {
            entry.last_output = output.to_string();
            entry.last_changed_at = now;
            return raw;
        }

        if raw == PaneState::Waiting || raw == PaneState::Unknown {
            let idle_secs = (now - entry.last_changed_at).num_seconds().max(0) as u64;
            if idle_secs >= self.config.idle_threshold_secs {
                return PaneState::Waiting;
            }
        }
        raw
    }

    fn due_for_digest(&self, session: &str, now: DateTime<Utc>) -> bool {
        if !self.config.send_digests {
            return false;
        }
        match self.last_digest_at.get(session) {
            Some(last) => {
                (now - *last).num_seconds().max(0) as u64 >= self.config.digest_interval_secs
            }
            None => true,
        }
    }

    async fn build_digest(
        &self,
        session: &str,
        pane_states: &HashMap<u32, PaneState>,
        now: DateTime<Utc>,
    ) -> Digest {
        let mut pane_state_counts: HashMap<String, usize> = HashMap::new();
        for state in pane_states.values() {
            *pane_state_counts.entry(state.label().to_string()).or_insert(0) += 1;
        }

        let mut assignment_status_counts: HashMap<String, usize> = HashMap::new();
        if let Ok(assignments) = self.store.load_store(session).await {
            for assignment in &assignments {
                *assignment_status_counts
                    .entry(assignment.status.to_string())
                    .or_insert(0) += 1;
            }
        }

        let mut alerts = Vec::new();
        let error_count = pane_state_counts.get("error").copied().unwrap_or(0);
        if error_count > 0 {
            alerts.push(format!("{error_count} pane(s) reporting an error state"));
        }

        self.last_digest_at.insert(session.to_string(), now);

        Digest {
            generated_at: now,
            pane_state_counts,
            assignment_status_counts,
            alerts,
        }
    }

    /// Runs one polling cycle for `session` (spec.md §4.G). `triage` is
    /// only consulted when `auto_assign` is enabled and idle agent panes
    /// exist — the Work-Assignment Engine's external collaborator, passed
    /// through rather than owned by the Coordinator.
    pub async fn tick(
        &self,
        session: &str,
        triage: Option<&dyn TriageSource>,
        token: &CancellationToken,
    ) -> Result<TickReport, CoordinatorError> {
        let now = Utc::now();
        let panes = self.orchestrator.get_panes(session, token).await?;

        let mut pane_states = HashMap::new();
        let mut idle_by_type: HashMap<AgentType, usize> = HashMap::new();

        for pane in panes.iter().filter(|p| p.agent_type != Some(AgentType::User)) {
            if token.is_cancelled() {
                return Err(CoordinatorError::Session(SessionError::Cancelled));
            }
            let output = self
                .orchestrator
                .capture_pane_output(session, pane.index, 50, token)
                .await?;
            let state = self.classify_pane(session, pane.index, &output, now).await;
            if state == PaneState::Waiting {
                if let Some(agent_type) = pane.agent_type {
                    *idle_by_type.entry(agent_type).or_insert(0) += 1;
                }
            }
            pane_states.insert(pane.index, state);
        }

        let digest = if self.due_for_digest(session, now) {
            Some(self.build_digest(session, &pane_states, now).await)
        } else {
            None
        };

        let mut conflicts = Vec::new();
        let mut negotiated = 0;
        if self.config.conflict_notify {
            let reservations = self
                .coordination
                .list_reservations(&self.project, None, false)
                .await
                .unwrap_or_default();
            conflicts = detect_conflicts(&reservations);
            if self.config.conflict_negotiate {
                for conflict in &conflicts {
                    let result = self
                        .coordination
                        .call_tool(
                            "negotiate_reservation",
                            serde_json::json!({
                                "agent_a": conflict.agent_a,
                                "agent_b": conflict.agent_b,
                                "pattern_a": conflict.pattern_a,
                                "pattern_b": conflict.pattern_b,
                            }),
                        )
                        .await;
                    match result {
                        Ok(_) => negotiated += 1,
                        Err(err) => warn!(session, error = %err, "reservation renegotiation failed"),
                    }
                }
            }
        }

        let mut auto_assigned = Vec::new();
        if self.config.auto_assign && idle_by_type.values().any(|&n| n > 0) {
            if let Some(triage) = triage {
                let strategy = self
                    .assignment_config
                    .strategy
                    .parse::<Strategy>()
                    .unwrap_or(Strategy::Balanced);
                let prompt_template = match self.assignment_config.prompt_template.as_str() {
                    "review" => PromptTemplate::Review,
                    _ => PromptTemplate::Impl,
                };
                auto_assigned = self
                    .assignment_engine
                    .plan_and_commit(
                        session,
                        triage,
                        strategy,
                        self.assignment_config.limit,
                        AssignmentFilters::default(),
                        prompt_template,
                        self.assignment_config.reserve_files,
                        token,
                    )
                    .await
                    .map_err(|e| CoordinatorError::Assignment(e.to_string()))?;
            }
        }

        Ok(TickReport {
            pane_states,
            digest,
            conflicts,
            negotiated,
            auto_assigned,
        })
    }

    /// Ticks `session` on `config.poll_interval_secs` until `token` is
    /// cancelled, mirroring the teacher's `start_efficiency_monitoring`
    /// `tokio::spawn` + `tokio::time::interval` loop. Callers `tokio::spawn`
    /// this themselves; it never spawns its own task so the caller keeps
    /// the `JoinHandle`.
    pub async fn run(
        self: Arc<Self>,
        session: String,
        triage: Option<Arc<dyn TriageSource>>,
        token: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(Duration::from_secs(
            self.config.poll_interval_secs.max(1),
        ));
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(session, "coordinator loop stopping");
                    return;
                }
                _ = interval.tick() => {
                    let report = self.tick(&session, triage.as_deref(), &token).await;
                    match report {
                        Ok(report) => {
                            debug!(
                                session,
                                panes = report.pane_states.len(),
                                conflicts = report.conflicts.len(),
                                auto_assigned = report.auto_assigned.len(),
                                "coordinator tick complete"
                            );
                        }
                        Err(err) => warn!(session, error = %err, "coordinator tick failed"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assignment::{Candidate, FixtureTriageSource};
    use crate::config::MultiplexerConfig;
    use crate::session::{AgentSpec, Orchestrator};
    use crate::store::JsonFileStore;
    use crate::tmux::fakes::RecordingMultiplexer;
    use std::time::Duration as StdDuration;

    struct NullCoordination;

    #[async_trait::async_trait]
    impl Coordination for NullCoordination {
        async fn read_resource(&self, _uri: &str) -> Result<serde_json::Value, crate::coordination::CoordinationError> {
            Err(crate::coordination::CoordinationError::Unavailable("no server".into()))
        }
        async fn call_tool(&self, _name: &str, _params: serde_json::Value) -> Result<serde_json::Value, crate::coordination::CoordinationError> {
            Ok(serde_json::json!({}))
        }
        async fn list_reservations(
            &self,
            _project: &str,
            _filter_agent: Option<&str>,
            _include_inactive: bool,
        ) -> Result<Vec<FileReservation>, crate::coordination::CoordinationError> {
            Ok(vec![])
        }
        async fn reserve_files(
            &self,
            _agent: &str,
            _patterns: &[String],
            _reason: &str,
            _ttl: StdDuration,
        ) -> Result<Vec<FileReservation>, crate::coordination::CoordinationError> {
            Ok(vec![])
        }
        async fn transfer_reservations(&self, _from: &str, _to: &str, _work_id: &str) -> bool {
            true
        }
        async fn is_available(&self) -> bool {
            true
        }
    }

    async fn setup() -> (Coordinator<RecordingMultiplexer>, CancellationToken, tempfile::TempDir) {
        let mux = RecordingMultiplexer::new();
        let orchestrator = Arc::new(Orchestrator::new(mux, MultiplexerConfig::default()));
        let token = CancellationToken::new();
        orchestrator
            .spawn(
                "alpha",
                &[AgentSpec {
                    agent_type: AgentType::Claude,
                    count: Some(1),
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
        let store: Arc<dyn Store> = Arc::new(JsonFileStore::new(
            dir.path().join("assignments"),
            dir.path().join("approvals.json"),
        ));
        let coordination: Arc<dyn Coordination> = Arc::new(NullCoordination);
        let engine = Arc::new(AssignmentEngine::new(
            orchestrator.clone(),
            store.clone(),
            coordination.clone(),
            "proj",
        ));
        let coordinator = Coordinator::new(
            orchestrator,
            store,
            coordination,
            engine,
            CoordinatorConfig {
                auto_assign: true,
                conflict_notify: true,
                send_digests: true,
                digest_interval_secs: 0,
                idle_threshold_secs: 0,
                ..CoordinatorConfig::default()
            },
            AssignmentConfig::default(),
            "proj",
        );
        (coordinator, token, dir)
    }

    #[tokio::test]
    async fn tick_classifies_untouched_pane_as_waiting() {
        let (coordinator, token, _dir) = setup().await;
        let report = coordinator.tick("alpha", None, &token).await.unwrap();
        assert_eq!(report.pane_states.get(&0), Some(&PaneState::Waiting));
    }

    #[tokio::test]
    async fn tick_auto_assigns_when_idle_panes_and_triage_present() {
        let (coordinator, token, _dir) = setup().await;
        let triage = FixtureTriageSource::new(vec![Candidate {
            work_id: "bd-1".to_string(),
            title: "Fix".to_string(),
            agent_type: AgentType::Claude,
            description: "desc".to_string(),
            file_patterns: vec![],
            dependencies: vec![],
        }]);
        let report = coordinator.tick("alpha", Some(&triage), &token).await.unwrap();
        assert_eq!(report.auto_assigned.len(), 1);
    }

    #[test]
    fn overlapping_exclusive_reservations_from_different_agents_conflict() {
        let reservations = vec![
            FileReservation {
                id: "r1".to_string(),
                agent_name: "BlueLake".to_string(),
                path_pattern: "src/**".to_string(),
                exclusive: true,
                reason: "bd-1".to_string(),
                created_ts: 0,
                expires_ts: None,
            },
            FileReservation {
                id: "r2".to_string(),
                agent_name: "RedPine".to_string(),
                path_pattern: "src/**".to_string(),
                exclusive: true,
                reason: "bd-2".to_string(),
                created_ts: 0,
                expires_ts: None,
            },
        ];
        let conflicts = detect_conflicts(&reservations);
        assert_eq!(conflicts.len(), 1);
    }

    #[test]
    fn same_agent_overlap_is_not_a_conflict() {
        let reservations = vec![
            FileReservation {
                id: "r1".to_string(),
                agent_name: "BlueLake".to_string(),
                path_pattern: "src/**".to_string(),
                exclusive: true,
                reason: "bd-1".to_string(),
                created_ts: 0,
                expires_ts: None,
            },
            FileReservation {
                id: "r2".to_string(),
                agent_name: "BlueLake".to_string(),
                path_pattern: "src/lib.rs".to_string(),
                exclusive: true,
                reason: "bd-2".to_string(),
                created_ts: 0,
                expires_ts: None,
            },
        ];
        assert!(detect_conflicts(&reservations).is_empty());
    }
}
