//! Budget envelope (spec.md §3): every field optional, inheriting from
//! `EnsembleConfig` defaults when absent.

use serde::{Deserialize, Serialize};

use crate::config::EnsembleConfig;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Budget {
    pub max_tokens_per_mode: Option<u64>,
    pub max_total_tokens: Option<u64>,
    pub synthesis_reserve_tokens: Option<u64>,
    pub context_reserve_tokens: Option<u64>,
    pub timeout_per_mode_secs: Option<u64>,
    pub total_timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
}

/// Every field resolved against defaults; no more `Option`s past this
/// point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedBudget {
    pub max_tokens_per_mode: u64,
    pub max_total_tokens: u64,
    pub synthesis_reserve_tokens: u64,
    pub context_reserve_tokens: u64,
    pub timeout_per_mode_secs: u64,
    pub total_timeout_secs: u64,
    pub max_retries: u32,
}

const DEFAULT_MAX_TOKENS_PER_MODE: u64 = 4000;
const DEFAULT_SYNTHESIS_RESERVE_TOKENS: u64 = 1000;
const DEFAULT_CONTEXT_RESERVE_TOKENS: u64 = 1000;
const DEFAULT_MAX_RETRIES: u32 = 1;

impl Budget {
    /// Resolves every missing field against `EnsembleConfig` (for the two
    /// timeout fields) or this module's built-in defaults.
    pub fn resolve(&self, config: &EnsembleConfig) -> ResolvedBudget {
        let max_tokens_per_mode = self.max_tokens_per_mode.unwrap_or(DEFAULT_MAX_TOKENS_PER_MODE);
        ResolvedBudget {
            max_tokens_per_mode,
            max_total_tokens: self
                .max_total_tokens
                .unwrap_or(max_tokens_per_mode.saturating_mul(4)),
            synthesis_reserve_tokens: self
                .synthesis_reserve_tokens
                .unwrap_or(DEFAULT_SYNTHESIS_RESERVE_TOKENS),
            context_reserve_tokens: self
                .context_reserve_tokens
                .unwrap_or(DEFAULT_CONTEXT_RESERVE_TOKENS),
            timeout_per_mode_secs: self
                .timeout_per_mode_secs
                .unwrap_or(config.timeout_per_mode_secs),
            total_timeout_secs: self.total_timeout_secs.unwrap_or(config.total_timeout_secs),
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_inherit_defaults() {
        let budget = Budget::default();
        let resolved = budget.resolve(&EnsembleConfig::default());
        assert_eq!(resolved.max_tokens_per_mode, DEFAULT_MAX_TOKENS_PER_MODE);
        assert_eq!(resolved.timeout_per_mode_secs, 300);
    }

    #[test]
    fn explicit_fields_are_kept() {
        let budget = Budget {
            max_tokens_per_mode: Some(1000),
            ..Default::default()
        };
        let resolved = budget.resolve(&EnsembleConfig::default());
        assert_eq!(resolved.max_tokens_per_mode, 1000);
        assert_eq!(resolved.max_total_tokens, 4000);
    }
}
