//! Assignment pairing strategies (spec.md §4.E). Reuses the
//! strategy-enum dispatch shape the teacher's `MasterDelegationEngine`
//! (referenced from `src/cli/mod.rs`, `src/orchestrator/master_delegation.rs`)
//! uses for `DelegationStrategy`, generalized from "pick an agent for a
//! task" to "pick an idle pane for a candidate."

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    Balanced,
    Speed,
    Quality,
    Dependency,
    RoundRobin,
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "balanced" => Ok(Strategy::Balanced),
            "speed" => Ok(Strategy::Speed),
            "quality" => Ok(Strategy::Quality),
            "dependency" => Ok(Strategy::Dependency),
            "round-robin" | "round_robin" => Ok(Strategy::RoundRobin),
            other => Err(format!("unknown strategy: {other}")),
        }
    }
}

/// An idle pane available for pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdlePane {
    pub pane_index: u32,
}

/// Per-pane history the strategies rank against, derived from the State
/// Store's completed/failed Assignment records for this session.
#[derive(Debug, Clone, Default)]
pub struct AgentStats {
    pub completed_count: u64,
    pub avg_working_to_completed_secs: Option<f64>,
    pub recent_failed_ratio: f64,
    pub last_assigned_seq: Option<u64>,
    pub most_recent_dependency_completed_by: bool,
}

/// Mutable cursor the `round-robin` strategy advances across calls within
/// one planning pass.
#[derive(Debug, Default)]
pub struct RoundRobinCursor {
    pub next_seq: u64,
}

/// Picks an idle pane for the next candidate under `strategy`. Returns
/// `None` when `idle` is empty.
pub fn select_agent(
    strategy: Strategy,
    idle: &[IdlePane],
    stats: &HashMap<u32, AgentStats>,
    cursor: &mut RoundRobinCursor,
) -> Option<IdlePane> {
    if idle.is_empty() {
        return None;
    }

    let default_stats = AgentStats::default();
    let stats_for = |pane: u32| stats.get(&pane).unwrap_or(&default_stats);

    let chosen = match strategy {
        Strategy::Balanced => idle
            .iter()
            .min_by_key(|p| (stats_for(p.pane_index).completed_count, p.pane_index))
            .copied(),
        Strategy::Speed => idle
            .iter()
            .min_by(|a, b| {
                let a_latency = stats_for(a.pane_index)
                    .avg_working_to_completed_secs
                    .unwrap_or(0.0);
                let b_latency = stats_for(b.pane_index)
                    .avg_working_to_completed_secs
                    .unwrap_or(0.0);
                a_latency
                    .partial_cmp(&b_latency)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.pane_index.cmp(&b.pane_index))
            })
            .copied(),
        Strategy::Quality => idle
            .iter()
            .min_by(|a, b| {
                let a_ratio = stats_for(a.pane_index).recent_failed_ratio;
                let b_ratio = stats_for(b.pane_index).recent_failed_ratio;
                a_ratio
                    .partial_cmp(&b_ratio)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.pane_index.cmp(&b.pane_index))
            })
            .copied(),
        Strategy::Dependency => {
            let preferred = idle
                .iter()
                .find(|p| stats_for(p.pane_index).most_recent_dependency_completed_by)
                .copied();
            preferred.or_else(|| {
                idle.iter()
                    .min_by_key(|p| (stats_for(p.pane_index).completed_count, p.pane_index))
                    .copied()
            })
        }
        Strategy::RoundRobin => {
            let next = idle
                .iter()
                .min_by_key(|p| {
                    (
                        stats_for(p.pane_index)
                            .last_assigned_seq
                            .unwrap_or(0),
                        p.pane_index,
                    )
                })
                .copied();
            cursor.next_seq += 1;
            next
        }
    };
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balanced_prefers_fewest_completed_then_lowest_index() {
        let idle = vec![IdlePane { pane_index: 2 }, IdlePane { pane_index: 1 }];
        let mut stats = HashMap::new();
        stats.insert(
            1,
            AgentStats {
                completed_count: 3,
                ..Default::default()
            },
        );
        stats.insert(
            2,
            AgentStats {
                completed_count: 3,
                ..Default::default()
            },
        );
        let mut cursor = RoundRobinCursor::default();
        let chosen = select_agent(Strategy::Balanced, &idle, &stats, &mut cursor).unwrap();
        assert_eq!(chosen.pane_index, 1);
    }

    #[test]
    fn speed_prefers_lowest_latency_cold_agent_wins_tie() {
        let idle = vec![IdlePane { pane_index: 1 }, IdlePane { pane_index: 2 }];
        let stats = HashMap::new();
        let mut cursor = RoundRobinCursor::default();
        let chosen = select_agent(Strategy::Speed, &idle, &stats, &mut cursor).unwrap();
        assert_eq!(chosen.pane_index, 1);
    }

    #[test]
    fn empty_pool_returns_none() {
        let idle: Vec<IdlePane> = vec![];
        let stats = HashMap::new();
        let mut cursor = RoundRobinCursor::default();
        assert!(select_agent(Strategy::Balanced, &idle, &stats, &mut cursor).is_none());
    }

    #[test]
    fn strategy_parses_round_robin_hyphen() {
        assert_eq!(Strategy::from_str("round-robin").unwrap(), Strategy::RoundRobin);
        assert!(Strategy::from_str("bogus").is_err());
    }
}
