//! Reasoning-mode and preset catalog (spec.md §3, §4.F). Data, not an
//! external collaborator — a fixed const-ish table the way the teacher's
//! `default_frontend_role()`/`default_backend_role()` build fixed
//! `AgentRole` data in `src/identity/mod.rs`.

use serde::{Deserialize, Serialize};

use crate::ensemble::budget::Budget;
use crate::tmux::AgentType;

/// Default token cost when a mode's catalog entry omits one (spec.md §4.F).
pub const DEFAULT_TYPICAL_COST: u64 = 2000;

/// A named reasoning approach (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasoningMode {
    pub id: String,
    pub code: String,
    pub name: String,
    pub category: String,
    pub tier: u8,
    pub typical_cost: Option<u64>,
    pub preferred_agent_type: AgentType,
    /// Prose prepended to the question when composing the pane prompt.
    pub preamble: String,
    /// Literal string the controller watches for in scrollback to mark
    /// this mode's pane Done.
    pub terminator: String,
}

impl ReasoningMode {
    pub fn typical_cost(&self) -> u64 {
        self.typical_cost.unwrap_or(DEFAULT_TYPICAL_COST)
    }
}

/// A named bundle of modes plus a budget envelope and synthesis config
/// (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnsemblePreset {
    pub name: String,
    pub mode_codes: Vec<String>,
    pub synthesis_strategy: String,
    pub keywords: Vec<String>,
}

/// The fixed catalog of reasoning modes this build ships.
pub fn modes() -> Vec<ReasoningMode> {
    vec![
        ReasoningMode {
            id: "mode-first-principles".to_string(),
            code: "fp".to_string(),
            name: "First Principles".to_string(),
            category: "analytical".to_string(),
            tier: 1,
            typical_cost: Some(2500),
            preferred_agent_type: AgentType::Claude,
            preamble: "Reason from first principles, questioning every assumption.".to_string(),
            terminator: "[[FP-DONE]]".to_string(),
        },
        ReasoningMode {
            id: "mode-devils-advocate".to_string(),
            code: "da".to_string(),
            name: "Devil's Advocate".to_string(),
            category: "critical".to_string(),
            tier: 1,
            typical_cost: Some(2000),
            preferred_agent_type: AgentType::Codex,
            preamble: "Argue against the most likely answer and surface its weaknesses."
                .to_string(),
            terminator: "[[DA-DONE]]".to_string(),
        },
        ReasoningMode {
            id: "mode-systems-thinking".to_string(),
            code: "sys".to_string(),
            name: "Systems Thinking".to_string(),
            category: "analytical".to_string(),
            tier: 2,
            typical_cost: Some(3500),
            preferred_agent_type: AgentType::Gemini,
            preamble: "Map the feedback loops and second-order effects at play.".to_string(),
            terminator: "[[SYS-DONE]]".to_string(),
        },
        ReasoningMode {
            id: "mode-quick-take".to_string(),
            code: "qt".to_string(),
            name: "Quick Take".to_string(),
            category: "critical".to_string(),
            tier: 1,
            typical_cost: Some(1000),
            preferred_agent_type: AgentType::Claude,
            preamble: "Give a fast, low-cost initial take without deep research.".to_string(),
            terminator: "[[QT-DONE]]".to_string(),
        },
        ReasoningMode {
            id: "mode-red-team".to_string(),
            code: "red".to_string(),
            name: "Red Team".to_string(),
            category: "critical".to_string(),
            tier: 2,
            typical_cost: Some(3000),
            preferred_agent_type: AgentType::Codex,
            preamble: "Attack the proposal as an adversary looking for failure modes."
                .to_string(),
            terminator: "[[RED-DONE]]".to_string(),
        },
    ]
}

pub fn mode_by_code(code: &str) -> Option<ReasoningMode> {
    modes().into_iter().find(|m| m.code == code)
}

pub fn mode_by_id(id: &str) -> Option<ReasoningMode> {
    modes().into_iter().find(|m| m.id == id)
}

/// Resolves a mode ID or code against the catalog.
pub fn resolve_mode(id_or_code: &str) -> Option<ReasoningMode> {
    mode_by_code(id_or_code).or_else(|| mode_by_id(id_or_code))
}

pub fn presets() -> Vec<EnsemblePreset> {
    vec![
        EnsemblePreset {
            name: "balanced-review".to_string(),
            mode_codes: vec!["fp".to_string(), "da".to_string(), "sys".to_string()],
            synthesis_strategy: "majority".to_string(),
            keywords: vec![
                "review".to_string(),
                "decision".to_string(),
                "tradeoff".to_string(),
            ],
        },
        EnsemblePreset {
            name: "fast-triage".to_string(),
            mode_codes: vec!["qt".to_string(), "da".to_string()],
            synthesis_strategy: "first".to_string(),
            keywords: vec!["quick".to_string(), "triage".to_string(), "bug".to_string()],
        },
        EnsemblePreset {
            name: "adversarial".to_string(),
            mode_codes: vec!["red".to_string(), "da".to_string(), "fp".to_string()],
            synthesis_strategy: "weighted".to_string(),
            keywords: vec![
                "security".to_string(),
                "risk".to_string(),
                "attack".to_string(),
            ],
        },
    ]
}

pub fn preset_by_name(name: &str) -> Option<EnsemblePreset> {
    presets().into_iter().find(|p| p.name == name)
}

/// The preset's nominal budget envelope (spec.md §3: "references a set of
/// modes plus a budget envelope"); callers override via `budget_override`.
pub fn preset_default_budget(_preset: &EnsemblePreset) -> Budget {
    Budget::default()
}
