//! Integration coverage for pane-name format/parse round trips and for
//! `Multiplexer::validate_session_name`, exercised through the public
//! crate surface rather than `tmux::naming`'s own unit tests.

use ntm::tmux::{format_pane_name, parse_pane_title, validate_session_name, AgentType};

#[test]
fn round_trips_plain_name() {
    let name = format_pane_name("alpha", AgentType::Claude, 1, None);
    assert_eq!(name, "alpha__claude_1");
    let parsed = parse_pane_title(&name).unwrap();
    assert_eq!(parsed.session, "alpha");
    assert_eq!(parsed.agent_type, AgentType::Claude);
    assert_eq!(parsed.index, 1);
    assert_eq!(parsed.variant, None);
}

#[test]
fn round_trips_name_with_variant() {
    let name = format_pane_name("release-9", AgentType::Codex, 3, Some("gpt-5-mini"));
    let parsed = parse_pane_title(&name).unwrap();
    assert_eq!(parsed.session, "release-9");
    assert_eq!(parsed.index, 3);
    assert_eq!(parsed.variant.as_deref(), Some("gpt-5-mini"));
}

#[test]
fn round_trips_session_name_containing_double_underscore() {
    let name = format_pane_name("team__blue", AgentType::Gemini, 2, None);
    let parsed = parse_pane_title(&name).unwrap();
    assert_eq!(parsed.session, "team__blue");
    assert_eq!(parsed.agent_type, AgentType::Gemini);
}

#[test]
fn unparseable_titles_report_none() {
    assert!(parse_pane_title("not-a-pane-title").is_none());
    assert!(parse_pane_title("").is_none());
}

#[test]
fn session_name_validation_rejects_colons_and_empty() {
    assert!(validate_session_name("fine-name_1").is_ok());
    assert!(validate_session_name("").is_err());
    assert!(validate_session_name("has:colon").is_err());
    assert!(validate_session_name("has space").is_err());
}
