//! Collaborator seam for the external triage tool (spec.md §4.E).
//! Production wiring to a real triage CLI is a Non-goal; the trait and
//! its fixture-backed test double are not.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::tmux::AgentType;

/// A candidate unit of work as reported by the triage tool, already
/// ranked by priority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub work_id: String,
    pub title: String,
    pub agent_type: AgentType,
    pub description: String,
    pub file_patterns: Vec<String>,
    pub dependencies: Vec<String>,
}

#[async_trait]
pub trait TriageSource: Send + Sync {
    async fn fetch_candidates(&self, limit: Option<usize>) -> anyhow::Result<Vec<Candidate>>;
}

/// JSON-fixture-backed double used by tests and by `--triage-fixture` in
/// development builds.
pub struct FixtureTriageSource {
    candidates: Vec<Candidate>,
}

impl FixtureTriageSource {
    pub fn new(candidates: Vec<Candidate>) -> Self {
        Self { candidates }
    }

    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        let candidates: Vec<Candidate> = serde_json::from_str(text)?;
        Ok(Self { candidates })
    }
}

#[async_trait]
impl TriageSource for FixtureTriageSource {
    async fn fetch_candidates(&self, limit: Option<usize>) -> anyhow::Result<Vec<Candidate>> {
        let candidates = self.candidates.clone();
        Ok(match limit {
            Some(n) => candidates.into_iter().take(n).collect(),
            None => candidates,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixture_respects_limit() {
        let source = FixtureTriageSource::new(vec![
            Candidate {
                work_id: "bd-1".to_string(),
                title: "a".to_string(),
                agent_type: AgentType::Claude,
                description: String::new(),
                file_patterns: vec![],
                dependencies: vec![],
            },
            Candidate {
                work_id: "bd-2".to_string(),
                title: "b".to_string(),
                agent_type: AgentType::Claude,
                description: String::new(),
                file_patterns: vec![],
                dependencies: vec![],
            },
        ]);
        let fetched = source.fetch_candidates(Some(1)).await.unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].work_id, "bd-1");
    }
}
