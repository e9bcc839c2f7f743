//! Ensemble Controller (spec.md §4.F): plans a multi-mode reasoning
//! exploration, drives the Session & Pane Orchestrator to spawn panes
//! representing modes, tracks each mode's lifecycle toward synthesis.
//! Grounded on the teacher's `MasterClaude` orchestration shape
//! (`src/orchestrator/mod.rs`) for the plan/spawn/poll structure,
//! generalized from "coordinate worker agents toward task completion" to
//! "coordinate mode panes toward synthesis," and on
//! `src/monitoring/mod.rs`'s buffered-polling pattern for watching pane
//! output for a terminator.

pub mod budget;
pub mod catalog;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use budget::{Budget, ResolvedBudget};
pub use catalog::{EnsemblePreset, ReasoningMode};

use crate::config::EnsembleConfig;
use crate::store::atomic_write;
use crate::tmux::{with_cancellation, AgentType, Multiplexer, TmuxError};

#[derive(Debug, thiserror::Error)]
pub enum EnsembleError {
    #[error("unknown mode '{0}'")]
    UnknownMode(String),
    #[error("unknown preset '{0}'")]
    UnknownPreset(String),
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Mux(#[from] TmuxError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("failed to persist ensemble session: {0}")]
    Persistence(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModeStatus {
    Pending,
    Injecting,
    Active,
    Done,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnsembleStatus {
    Planning,
    Active,
    Synthesizing,
    Done,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeAssignment {
    pub mode_id: String,
    pub agent_type: AgentType,
    pub pane_name: String,
    pub status: ModeStatus,
    #[serde(skip)]
    pub pane_index: u32,
    pub activated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleSession {
    pub session_name: String,
    pub question: String,
    pub preset_used: Option<String>,
    pub assignments: Vec<ModeAssignment>,
    pub synthesis_strategy: String,
    pub budget: Budget,
    pub created_at: DateTime<Utc>,
    pub status: EnsembleStatus,
}

/// Strategy for pairing a mode with an agent type (spec.md §4.F).
#[derive(Debug, Clone)]
pub enum AssignmentStrategy {
    /// The mode's `preferred_agent_type` wins.
    Affinity,
    /// Cycle through `mix`.
    RoundRobin { mix: Vec<AgentType> },
    /// One mode per category before repeating `mix`.
    Category { mix: Vec<AgentType> },
    /// Explicit `mode_code -> agent_type` pairs.
    Explicit { pairs: HashMap<String, AgentType> },
}

fn assign_agent(
    strategy: &AssignmentStrategy,
    mode: &ReasoningMode,
    seen_categories: &mut Vec<String>,
    cursor: &mut usize,
) -> AgentType {
    match strategy {
        AssignmentStrategy::Affinity => mode.preferred_agent_type,
        AssignmentStrategy::RoundRobin { mix } => {
            if mix.is_empty() {
                return mode.preferred_agent_type;
            }
            let chosen = mix[*cursor % mix.len()];
            *cursor += 1;
            chosen
        }
        AssignmentStrategy::Category { mix } => {
            if mix.is_empty() {
                return mode.preferred_agent_type;
            }
            if !seen_categories.contains(&mode.category) {
                seen_categories.push(mode.category.clone());
            }
            let position = seen_categories.len() - 1;
            mix[position % mix.len()]
        }
        AssignmentStrategy::Explicit { pairs } => pairs
            .get(&mode.code)
            .copied()
            .unwrap_or(mode.preferred_agent_type),
    }
}

#[derive(Debug, Clone)]
pub struct PlannedMode {
    pub pane_index: u32,
    pub mode: ReasoningMode,
    pub agent_type: AgentType,
    pub budget_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct AnalysisResult {
    pub plan: Vec<PlannedMode>,
    pub total_estimate: u64,
    pub resolved_budget: ResolvedBudget,
    pub warnings: Vec<String>,
    pub suggested_replacements: Vec<(String, String)>,
}

/// Input to `DryRun`/`Spawn`/`Estimate` (spec.md §4.F).
#[derive(Debug, Clone)]
pub struct EnsembleConfigInput {
    pub question: String,
    pub preset: Option<String>,
    pub explicit_modes: Option<Vec<String>>,
    pub strategy: AssignmentStrategy,
    pub synthesis_strategy: Option<String>,
    pub budget_override: Budget,
    pub skip_inject: bool,
    pub context_pack: Option<String>,
}

fn resolve_modes(cfg: &EnsembleConfigInput) -> Result<(Vec<ReasoningMode>, Option<String>, String), EnsembleError> {
    if let Some(codes) = &cfg.explicit_modes {
        let modes = codes
            .iter()
            .map(|c| catalog::resolve_mode(c).ok_or_else(|| EnsembleError::UnknownMode(c.clone())))
            .collect::<Result<Vec<_>, _>>()?;
        let synthesis = cfg.synthesis_strategy.clone().unwrap_or_else(|| "majority".to_string());
        return Ok((modes, None, synthesis));
    }
    if let Some(name) = &cfg.preset {
        let preset = catalog::preset_by_name(name)
            .ok_or_else(|| EnsembleError::UnknownPreset(name.clone()))?;
        let modes = preset
            .mode_codes
            .iter()
            .map(|c| catalog::resolve_mode(c).expect("preset references a cataloged mode code"))
            .collect();
        return Ok((modes, Some(preset.name.clone()), preset.synthesis_strategy));
    }
    Err(EnsembleError::Validation(
        "either preset or explicit modes must be given".to_string(),
    ))
}

/// Shared `DryRun`/`Estimate` analysis: resolves modes, expands the agent
/// mix, computes per-mode and total token estimates, and warns when the
/// estimate exceeds 85% of the total budget, suggesting a cheaper
/// same-category replacement for any mode that exceeds its per-mode cap.
pub fn analyze(
    cfg: &EnsembleConfigInput,
    ensemble_config: &EnsembleConfig,
) -> Result<(AnalysisResult, Option<String>, String), EnsembleError> {
    let (modes, preset_used, synthesis_strategy) = resolve_modes(cfg)?;
    let resolved_budget = cfg.budget_override.resolve(ensemble_config);

    let mut seen_categories = Vec::new();
    let mut cursor = 0usize;
    let mut plan = Vec::new();
    let mut total_estimate = 0u64;
    let mut warnings = Vec::new();
    let mut suggested_replacements = Vec::new();

    let catalog_modes = catalog::modes();

    for (index, mode) in modes.iter().enumerate() {
        let agent_type = assign_agent(&cfg.strategy, mode, &mut seen_categories, &mut cursor);
        let cost = mode.typical_cost();
        total_estimate += cost;

        if cost > resolved_budget.max_tokens_per_mode {
            if let Some(replacement) = catalog_modes
                .iter()
                .filter(|candidate| {
                    candidate.category == mode.category
                        && candidate.code != mode.code
                        && candidate.typical_cost() <= resolved_budget.max_tokens_per_mode
                })
                .min_by_key(|candidate| candidate.typical_cost())
            {
                suggested_replacements.push((mode.code.clone(), replacement.code.clone()));
            }
        }

        plan.push(PlannedMode {
            pane_index: index as u32,
            mode: mode.clone(),
            agent_type,
            budget_tokens: cost,
        });
    }

    if total_estimate as f64 > 0.85 * resolved_budget.max_total_tokens as f64 {
        warnings.push(format!(
            "estimated usage {total_estimate} tokens is projected to exceed budget ({} tokens available)",
            resolved_budget.max_total_tokens
        ));
    }

    Ok((
        AnalysisResult {
            plan,
            total_estimate,
            resolved_budget,
            warnings,
            suggested_replacements,
        },
        preset_used,
        synthesis_strategy,
    ))
}

/// `DryRun(cfg)` (spec.md §4.F): analysis only, no side effects.
pub fn dry_run(
    cfg: &EnsembleConfigInput,
    ensemble_config: &EnsembleConfig,
) -> Result<AnalysisResult, EnsembleError> {
    analyze(cfg, ensemble_config).map(|(result, _, _)| result)
}

/// `Estimate(preset or explicit modes, budget_override)` (spec.md §4.F):
/// identical analysis to `DryRun`, without a session.
pub fn estimate(
    cfg: &EnsembleConfigInput,
    ensemble_config: &EnsembleConfig,
) -> Result<AnalysisResult, EnsembleError> {
    dry_run(cfg, ensemble_config)
}

#[derive(Debug, Clone)]
pub struct PresetSuggestion {
    pub name: String,
    pub score: usize,
    pub matched_keywords: Vec<String>,
}

/// `Suggest(question)` (spec.md §4.F): pure function over the preset
/// registry, ranking by keyword overlap with `question`.
pub fn suggest(question: &str) -> Vec<PresetSuggestion> {
    let lowered = question.to_lowercase();
    let words: Vec<&str> = lowered.split_whitespace().collect();
    let mut suggestions: Vec<PresetSuggestion> = catalog::presets()
        .into_iter()
        .map(|preset| {
            let matched: Vec<String> = preset
                .keywords
                .iter()
                .filter(|kw| words.iter().any(|w| w.contains(kw.as_str())))
                .cloned()
                .collect();
            PresetSuggestion {
                name: preset.name,
                score: matched.len(),
                matched_keywords: matched,
            }
        })
        .collect();
    suggestions.sort_by(|a, b| b.score.cmp(&a.score).then(a.name.cmp(&b.name)));
    suggestions
}

/// `Suggest(question)`'s `id_only` variant: just the top preset name.
pub fn suggest_top_name(question: &str) -> Option<String> {
    suggest(question).into_iter().next().map(|s| s.name)
}

pub fn spawn_command(preset_name: &str, question: &str) -> String {
    format!("ntm ensemble spawn --preset {preset_name} --question \"{question}\"")
}

fn format_mode_pane_name(session: &str, mode_code: &str, index: u32) -> String {
    format!("{session}__{mode_code}_{index}")
}

fn compose_prompt(question: &str, mode: &ReasoningMode, context_pack: Option<&str>) -> String {
    let mut prompt = format!("{}\n\n{}", mode.preamble, question);
    if let Some(pack) = context_pack {
        prompt.push_str("\n\n");
        prompt.push_str(pack);
    }
    prompt
}

pub struct Controller<M: Multiplexer> {
    mux: M,
    config: crate::config::MultiplexerConfig,
    ensemble_config: EnsembleConfig,
}

impl<M: Multiplexer> Controller<M> {
    pub fn new(
        mux: M,
        config: crate::config::MultiplexerConfig,
        ensemble_config: EnsembleConfig,
    ) -> Self {
        Self {
            mux,
            config,
            ensemble_config,
        }
    }

    fn launch_command(&self, agent_type: AgentType) -> String {
        self.config
            .agent_commands
            .get(agent_type.as_str())
            .cloned()
            .unwrap_or_else(|| agent_type.as_str().to_string())
    }

    async fn unique_session_name(&self, base: &str) -> String {
        if !self.mux.session_exists(base).await {
            return base.to_string();
        }
        let mut n = 1;
        loop {
            let candidate = format!("{base}-{n}");
            if !self.mux.session_exists(&candidate).await {
                return candidate;
            }
            n += 1;
        }
    }

    /// `Spawn(cfg)` (spec.md §4.F): runs `DryRun` first, creates a
    /// uniquely-named session, opens one pane per mode, names and
    /// launches each, injects the composed prompt unless `skip_inject`,
    /// and persists the `EnsembleSession` record under
    /// `<project_dir>/.ntm/ensembles/<session>/`.
    pub async fn spawn(
        &self,
        cfg: &EnsembleConfigInput,
        base_session_name: &str,
        dir: &str,
        project_dir: &Path,
        token: &CancellationToken,
    ) -> Result<EnsembleSession, EnsembleError> {
        let (analysis, preset_used, synthesis_strategy) = analyze(cfg, &self.ensemble_config)?;

        let session_name = self.unique_session_name(base_session_name).await;
        self.mux.validate_session_name(&session_name)?;
        with_cancellation(token, self.mux.create_session(&session_name, dir)).await?;

        let mut assignments = Vec::with_capacity(analysis.plan.len());

        for (i, planned) in analysis.plan.iter().enumerate() {
            if token.is_cancelled() {
                return Err(TmuxError::Cancelled.into());
            }
            let pane_id = if i == 0 {
                let panes = with_cancellation(token, self.mux.get_panes(&session_name)).await?;
                panes
                    .into_iter()
                    .find(|p| p.index == 0)
                    .map(|p| p.id)
                    .ok_or_else(|| TmuxError::PaneNotFound("0".to_string()))?
            } else {
                with_cancellation(token, self.mux.split_window(&session_name, dir)).await?
            };

            let pane_name = format_mode_pane_name(&session_name, &planned.mode.code, planned.pane_index);
            with_cancellation(token, self.mux.set_pane_title(&pane_id, &pane_name)).await?;

            let command = self.launch_command(planned.agent_type);
            with_cancellation(token, self.mux.send_keys(&pane_id, &command, true)).await?;

            let mut assignment = ModeAssignment {
                mode_id: planned.mode.id.clone(),
                agent_type: planned.agent_type,
                pane_name,
                status: ModeStatus::Pending,
                pane_index: planned.pane_index,
                activated_at: None,
            };

            if !cfg.skip_inject {
                assignment.status = ModeStatus::Injecting;
                let prompt = compose_prompt(&cfg.question, &planned.mode, cfg.context_pack.as_deref());
                with_cancellation(token, self.mux.send_keys(&pane_id, &prompt, true)).await?;
                assignment.status = ModeStatus::Active;
                assignment.activated_at = Some(Utc::now());
            }

            assignments.push(assignment);
        }

        with_cancellation(token, self.mux.apply_tiled_layout(&session_name)).await?;

        let status = if assignments.iter().all(|a| a.status == ModeStatus::Active) {
            EnsembleStatus::Active
        } else {
            EnsembleStatus::Planning
        };

        let session = EnsembleSession {
            session_name: session_name.clone(),
            question: cfg.question.clone(),
            preset_used,
            assignments,
            synthesis_strategy: cfg.synthesis_strategy.clone().unwrap_or(synthesis_strategy),
            budget: cfg.budget_override.clone(),
            created_at: Utc::now(),
            status,
        };

        self.persist(project_dir, &session).await?;
        Ok(session)
    }

    async fn persist(&self, project_dir: &Path, session: &EnsembleSession) -> Result<(), EnsembleError> {
        let path = crate::config::ensemble_session_dir(project_dir, &session.session_name)
            .join("session.json");
        let bytes = serde_json::to_vec_pretty(session)
            .map_err(|e| EnsembleError::Persistence(e.to_string()))?;
        atomic_write(&path, &bytes)
            .await
            .map_err(|e| EnsembleError::Persistence(e.to_string()))
    }

    fn session_dir_for(&self, project_dir: &Path, session_name: &str) -> PathBuf {
        crate::config::ensemble_session_dir(project_dir, session_name)
    }

    pub async fn load(
        &self,
        project_dir: &Path,
        session_name: &str,
    ) -> Result<EnsembleSession, EnsembleError> {
        let path = self.session_dir_for(project_dir, session_name).join("session.json");
        let bytes = tokio::fs::read(&path).await?;
        serde_json::from_slice(&bytes).map_err(|e| EnsembleError::Persistence(e.to_string()))
    }

    /// Polls each `Active` mode's pane for its terminator or per-mode
    /// timeout and advances status to `Done` accordingly (spec.md §4.F).
    pub async fn poll(
        &self,
        mut session: EnsembleSession,
        token: &CancellationToken,
    ) -> Result<EnsembleSession, EnsembleError> {
        let resolved_budget = session.budget.resolve(&self.ensemble_config);
        for assignment in session.assignments.iter_mut() {
            if assignment.status != ModeStatus::Active {
                continue;
            }
            let mode = catalog::mode_by_id(&assignment.mode_id)
                .ok_or_else(|| EnsembleError::UnknownMode(assignment.mode_id.clone()))?;
            let panes = with_cancellation(token, self.mux.get_panes(&session.session_name)).await?;
            let Some(pane) = panes.iter().find(|p| p.title == assignment.pane_name) else {
                continue;
            };
            let output = with_cancellation(token, self.mux.capture_pane_output(&pane.id, 200)).await?;
            if output.contains(&mode.terminator) {
                assignment.status = ModeStatus::Done;
                debug!(mode = %mode.code, "mode reached its terminator");
                continue;
            }
            if let Some(activated_at) = assignment.activated_at {
                let elapsed = (Utc::now() - activated_at).num_seconds().max(0) as u64;
                if elapsed > resolved_budget.timeout_per_mode_secs {
                    assignment.status = ModeStatus::Done;
                }
            }
        }

        if session.assignments.iter().all(|a| matches!(a.status, ModeStatus::Done | ModeStatus::Error)) {
            session.status = EnsembleStatus::Synthesizing;
        }
        Ok(session)
    }
}
