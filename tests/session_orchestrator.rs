//! Integration coverage for the Session & Pane Orchestrator (spec.md
//! §4.D), exercised end to end through the in-memory `RecordingMultiplexer`
//! fake rather than a real `tmux` server.

use std::collections::HashMap;

use ntm::config::MultiplexerConfig;
use ntm::session::{AgentSpec, Orchestrator, SendTargets, SessionError, Variant, ZoomSelector};
use ntm::tmux::fakes::RecordingMultiplexer;
use ntm::tmux::AgentType;
use tokio_util::sync::CancellationToken;

fn orchestrator() -> Orchestrator<RecordingMultiplexer> {
    Orchestrator::new(RecordingMultiplexer::new(), MultiplexerConfig::default())
}

#[tokio::test]
async fn spawn_opens_a_leading_user_pane_and_one_pane_per_agent() {
    let orchestrator = orchestrator();
    let token = CancellationToken::new();
    let mapping = orchestrator
        .spawn(
            "alpha",
            &[
                AgentSpec {
                    agent_type: AgentType::Claude,
                    count: Some(2),
                    model: None,
                    variants: None,
                },
                AgentSpec {
                    agent_type: AgentType::Codex,
                    count: Some(1),
                    model: None,
                    variants: None,
                },
            ],
            true,
            "/tmp",
            &token,
        )
        .await
        .unwrap();

    assert_eq!(mapping.len(), 4);
    assert_eq!(mapping[&0].agent_type, AgentType::User);
    assert_eq!(mapping[&1].agent_type, AgentType::Claude);
    assert_eq!(mapping[&2].agent_type, AgentType::Claude);
    assert_eq!(mapping[&3].agent_type, AgentType::Codex);
}

#[tokio::test]
async fn spawn_rejects_counts_over_the_configured_maximum() {
    let orchestrator = Orchestrator::new(
        RecordingMultiplexer::new(),
        MultiplexerConfig {
            max_agents: 1,
            ..MultiplexerConfig::default()
        },
    );
    let token = CancellationToken::new();
    let err = orchestrator
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
        .unwrap_err();
    assert!(matches!(err, SessionError::MaxAgentsExceeded(1)));
}

#[tokio::test]
async fn spawn_expands_variants_and_preserves_per_variant_model() {
    let orchestrator = orchestrator();
    let token = CancellationToken::new();
    let mapping = orchestrator
        .spawn(
            "alpha",
            &[AgentSpec {
                agent_type: AgentType::Codex,
                count: None,
                model: None,
                variants: Some(vec![
                    Variant {
                        count: 1,
                        model: "gpt-5".to_string(),
                    },
                    Variant {
                        count: 1,
                        model: "gpt-5-mini".to_string(),
                    },
                ]),
            }],
            false,
            "/tmp",
            &token,
        )
        .await
        .unwrap();

    let models: HashMap<Option<String>, usize> =
        mapping.values().fold(HashMap::new(), |mut acc, p| {
            *acc.entry(p.model.clone()).or_insert(0) += 1;
            acc
        });
    assert_eq!(models.get(&Some("gpt-5".to_string())), Some(&1));
    assert_eq!(models.get(&Some("gpt-5-mini".to_string())), Some(&1));
}

#[tokio::test]
async fn send_with_explicit_pane_index_bypasses_type_filters() {
    let orchestrator = orchestrator();
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

    let delivered = orchestrator
        .send(
            "alpha",
            "do the thing",
            SendTargets {
                pane_index: Some(1),
                ..SendTargets::default()
            },
            false,
            true,
            &token,
        )
        .await
        .unwrap();
    assert_eq!(delivered, 1);
}

#[tokio::test]
async fn send_reroutes_shell_commands_to_the_user_pane_when_smart_routing() {
    let orchestrator = orchestrator();
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
            true,
            "/tmp",
            &token,
        )
        .await
        .unwrap();

    let delivered = orchestrator
        .send(
            "alpha",
            "git status",
            SendTargets::default_skip_first(),
            true,
            false,
            &token,
        )
        .await
        .unwrap();
    assert_eq!(delivered, 1);
}

#[tokio::test]
async fn interrupt_never_targets_the_user_pane() {
    let orchestrator = orchestrator();
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
            true,
            "/tmp",
            &token,
        )
        .await
        .unwrap();
    let interrupted = orchestrator.interrupt("alpha", &token).await.unwrap();
    assert_eq!(interrupted, 2);
}

#[tokio::test]
async fn kill_without_force_requires_confirmation() {
    let orchestrator = orchestrator();
    let token = CancellationToken::new();
    orchestrator.create("alpha", 1, "/tmp", &token).await.unwrap();
    let err = orchestrator.kill("alpha", false, &token).await.unwrap_err();
    assert!(matches!(err, SessionError::ConfirmationRequired));
    orchestrator.kill("alpha", true, &token).await.unwrap();
}

#[tokio::test]
async fn zoom_by_agent_type_resolves_the_lowest_index() {
    let orchestrator = orchestrator();
    let token = CancellationToken::new();
    orchestrator
        .spawn(
            "alpha",
            &[AgentSpec {
                agent_type: AgentType::Gemini,
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
    let zoomed = orchestrator
        .zoom("alpha", ZoomSelector::AgentType(AgentType::Gemini), &token)
        .await
        .unwrap();
    assert_eq!(zoomed, 0);
}

#[tokio::test]
async fn create_rejects_a_duplicate_session_name() {
    let orchestrator = orchestrator();
    let token = CancellationToken::new();
    orchestrator.create("dup", 1, "/tmp", &token).await.unwrap();
    let err = orchestrator.create("dup", 1, "/tmp", &token).await.unwrap_err();
    assert!(matches!(err, SessionError::SessionAlreadyExists(_)));
}
