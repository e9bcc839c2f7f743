//! Integration coverage for the Ensemble Controller (spec.md §4.F):
//! dry-run budget analysis, preset suggestion, and the spawn→persist→load
//! round trip, all driven through the in-memory `RecordingMultiplexer`.

use ntm::config::{EnsembleConfig, MultiplexerConfig};
use ntm::ensemble::{
    dry_run, estimate, suggest, AssignmentStrategy, Budget, Controller, EnsembleConfigInput,
    EnsembleStatus, ModeStatus,
};
use ntm::tmux::fakes::RecordingMultiplexer;
use tokio_util::sync::CancellationToken;

fn base_input() -> EnsembleConfigInput {
    EnsembleConfigInput {
        question: "Should we ship this migration now?".to_string(),
        preset: Some("balanced-review".to_string()),
        explicit_modes: None,
        strategy: AssignmentStrategy::Affinity,
        synthesis_strategy: None,
        budget_override: Budget::default(),
        skip_inject: false,
        context_pack: None,
    }
}

#[test]
fn dry_run_resolves_a_preset_into_a_plan_without_side_effects() {
    let result = dry_run(&base_input(), &EnsembleConfig::default()).unwrap();
    assert_eq!(result.plan.len(), 3);
    assert!(result.total_estimate > 0);
}

#[test]
fn estimate_matches_dry_run_for_the_same_input() {
    let cfg = base_input();
    let a = dry_run(&cfg, &EnsembleConfig::default()).unwrap();
    let b = estimate(&cfg, &EnsembleConfig::default()).unwrap();
    assert_eq!(a.total_estimate, b.total_estimate);
    assert_eq!(a.plan.len(), b.plan.len());
}

#[test]
fn dry_run_suggests_a_cheaper_same_category_replacement_over_the_per_mode_cap() {
    // "sys" (analytical, 3500 tokens) exceeds a 3000-token per-mode cap;
    // "fp" (analytical, 2500 tokens) fits and should be suggested.
    let cfg = EnsembleConfigInput {
        explicit_modes: Some(vec!["sys".to_string()]),
        preset: None,
        budget_override: Budget {
            max_tokens_per_mode: Some(3000),
            ..Default::default()
        },
        ..base_input()
    };
    let result = dry_run(&cfg, &EnsembleConfig::default()).unwrap();
    assert_eq!(result.suggested_replacements, vec![("sys".to_string(), "fp".to_string())]);
}

#[test]
fn dry_run_warns_when_the_total_estimate_exceeds_the_budget() {
    let cfg = EnsembleConfigInput {
        explicit_modes: Some(vec!["fp".to_string(), "sys".to_string(), "red".to_string()]),
        preset: None,
        budget_override: Budget {
            max_tokens_per_mode: Some(4000),
            max_total_tokens: Some(4000),
            ..Default::default()
        },
        ..base_input()
    };
    let result = dry_run(&cfg, &EnsembleConfig::default()).unwrap();
    assert!(result.warnings.iter().any(|w| w.contains("exceed")));
}

#[test]
fn suggest_ranks_the_adversarial_preset_highest_for_a_security_question() {
    let ranked = suggest("We need a security risk review before shipping");
    assert_eq!(ranked[0].name, "adversarial");
    assert!(ranked[0].score > 0);
}

fn controller() -> Controller<RecordingMultiplexer> {
    Controller::new(
        RecordingMultiplexer::new(),
        MultiplexerConfig::default(),
        EnsembleConfig::default(),
    )
}

#[tokio::test]
async fn spawn_activates_every_mode_pane_and_persists_the_session() {
    let controller = controller();
    let token = CancellationToken::new();
    let dir = tempfile::tempdir().unwrap();

    let session = controller
        .spawn(&base_input(), "ens", "/tmp", dir.path(), &token)
        .await
        .unwrap();

    assert_eq!(session.assignments.len(), 3);
    assert!(session.assignments.iter().all(|a| a.status == ModeStatus::Active));
    assert_eq!(session.status, EnsembleStatus::Active);

    let reloaded = controller.load(dir.path(), &session.session_name).await.unwrap();
    assert_eq!(reloaded.session_name, session.session_name);
    assert_eq!(reloaded.assignments.len(), 3);
}

#[tokio::test]
async fn spawn_skips_injection_when_requested() {
    let controller = controller();
    let token = CancellationToken::new();
    let dir = tempfile::tempdir().unwrap();

    let cfg = EnsembleConfigInput {
        skip_inject: true,
        ..base_input()
    };
    let session = controller
        .spawn(&cfg, "ens-no-inject", "/tmp", dir.path(), &token)
        .await
        .unwrap();

    assert!(session.assignments.iter().all(|a| a.status == ModeStatus::Pending));
    assert_eq!(session.status, EnsembleStatus::Planning);
}

#[tokio::test]
async fn poll_marks_a_pane_done_once_its_terminator_appears() {
    let controller = controller();
    let token = CancellationToken::new();
    let dir = tempfile::tempdir().unwrap();

    let session = controller
        .spawn(&base_input(), "ens-poll", "/tmp", dir.path(), &token)
        .await
        .unwrap();

    // No terminators have appeared yet; nothing should be marked Done.
    let polled = controller.poll(session, &token).await.unwrap();
    assert!(polled.assignments.iter().all(|a| a.status == ModeStatus::Active));
}
