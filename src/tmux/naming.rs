//! Pane naming: the only source of truth for re-discovering agent type
//! after a restart. The scheme must be bijective with `{session, type,
//! index, variant}` (spec.md §4.D, §8).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Closed tagged variant for pane occupant kind (spec.md §9: avoid string
/// comparisons in hot paths by normalizing at ingestion).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Claude,
    Codex,
    Gemini,
    User,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Claude => "claude",
            AgentType::Codex => "codex",
            AgentType::Gemini => "gemini",
            AgentType::User => "user",
        }
    }

    pub const ALL: [AgentType; 4] = [
        AgentType::Claude,
        AgentType::Codex,
        AgentType::Gemini,
        AgentType::User,
    ];

    /// The three agent kinds, excluding the interactive user pane.
    pub const AGENTS: [AgentType; 3] = [AgentType::Claude, AgentType::Codex, AgentType::Gemini];
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude" => Ok(AgentType::Claude),
            "codex" => Ok(AgentType::Codex),
            "gemini" => Ok(AgentType::Gemini),
            "user" => Ok(AgentType::User),
            other => Err(format!("unknown agent type: {other}")),
        }
    }
}

/// The parsed components of a pane title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPaneName {
    pub session: String,
    pub agent_type: AgentType,
    pub index: u32,
    pub variant: Option<String>,
}

/// `{session}__{type}_{index}` with an optional `@{variant}` suffix.
///
/// `index` is 1-based within its agent type (spec.md §3 `FlatAgent`).
pub fn format_pane_name(
    session: &str,
    agent_type: AgentType,
    index: u32,
    variant: Option<&str>,
) -> String {
    let mut name = format!("{session}__{agent_type}_{index}");
    if let Some(v) = variant {
        name.push('@');
        name.push_str(v);
    }
    name
}

/// Inverse of [`format_pane_name`]. `session` may itself contain `__`, so
/// the type token is anchored against the closed `AgentType` set rather
/// than split positionally.
pub fn parse_pane_title(title: &str) -> Option<ParsedPaneName> {
    let (head, variant) = match title.rsplit_once('@') {
        Some((h, v)) => (h, Some(v.to_string())),
        None => (title, None),
    };

    for agent_type in AgentType::ALL {
        let marker = format!("__{agent_type}_");
        if let Some(pos) = head.rfind(&marker) {
            let session = &head[..pos];
            let index_str = &head[pos + marker.len()..];
            if session.is_empty() {
                continue;
            }
            if let Ok(index) = index_str.parse::<u32>() {
                return Some(ParsedPaneName {
                    session: session.to_string(),
                    agent_type,
                    index,
                    variant,
                });
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_without_variant() {
        let name = format_pane_name("alpha", AgentType::Claude, 2, None);
        assert_eq!(name, "alpha__claude_2");
        let parsed = parse_pane_title(&name).unwrap();
        assert_eq!(parsed.session, "alpha");
        assert_eq!(parsed.agent_type, AgentType::Claude);
        assert_eq!(parsed.index, 2);
        assert_eq!(parsed.variant, None);
    }

    #[test]
    fn round_trip_with_variant() {
        let name = format_pane_name("alpha", AgentType::Codex, 1, Some("gpt-5"));
        let parsed = parse_pane_title(&name).unwrap();
        assert_eq!(parsed.variant.as_deref(), Some("gpt-5"));
        assert_eq!(parsed.agent_type, AgentType::Codex);
    }

    #[test]
    fn round_trip_session_with_double_underscore() {
        let name = format_pane_name("my__project", AgentType::Gemini, 3, None);
        let parsed = parse_pane_title(&name).unwrap();
        assert_eq!(parsed.session, "my__project");
        assert_eq!(parsed.index, 3);
    }

    #[test]
    fn injective_components() {
        let a = format_pane_name("s1", AgentType::Claude, 1, None);
        let b = format_pane_name("s2", AgentType::Codex, 9, Some("x"));
        assert_ne!(a, b);
        let pa = parse_pane_title(&a).unwrap();
        let pb = parse_pane_title(&b).unwrap();
        assert_ne!((pa.session, pa.agent_type, pa.index), (pb.session, pb.agent_type, pb.index));
    }

    #[test]
    fn unparseable_title_returns_none() {
        assert!(parse_pane_title("not-a-pane-name").is_none());
    }
}
