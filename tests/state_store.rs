//! Integration coverage for the Persistent State Store (spec.md §4.C):
//! the Assignment state machine and the Approval lifecycle, driven
//! through `JsonFileStore` against a real temp-directory filesystem so
//! the atomic-write/reload path is exercised, not just the in-memory map.

use chrono::Duration;
use ntm::store::{Approval, ApprovalStatus, Assignment, AssignmentStatus, JsonFileStore, Store, StoreError};
use ntm::tmux::AgentType;

fn store(dir: &std::path::Path) -> JsonFileStore {
    JsonFileStore::new(dir.join("assignments"), dir.join("approvals.json"))
}

fn assignment(work_id: &str) -> Assignment {
    Assignment::new("alpha", work_id, "Fix the thing", 1, AgentType::Claude, None, "go fix it")
}

#[tokio::test]
async fn assign_then_get_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    store.assign(assignment("bd-1")).await.unwrap();
    let fetched = store.get("alpha", "bd-1").await.unwrap();
    assert_eq!(fetched.status, AssignmentStatus::Assigned);
    assert_eq!(fetched.title, "Fix the thing");
}

#[tokio::test]
async fn full_lifecycle_assigned_working_completed() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    store.assign(assignment("bd-1")).await.unwrap();
    let working = store.mark_working("alpha", "bd-1").await.unwrap();
    assert_eq!(working.status, AssignmentStatus::Working);
    assert!(working.working_at.is_some());

    let completed = store.mark_completed("alpha", "bd-1").await.unwrap();
    assert_eq!(completed.status, AssignmentStatus::Completed);
    assert!(completed.completed_at.is_some());
}

#[tokio::test]
async fn failed_assignment_can_be_retried_via_reassign_to_assigned() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    store.assign(assignment("bd-1")).await.unwrap();
    store.mark_working("alpha", "bd-1").await.unwrap();
    let failed = store.mark_failed("alpha", "bd-1", "agent crashed").await.unwrap();
    assert_eq!(failed.status, AssignmentStatus::Failed);
    assert_eq!(failed.denial_reason.as_deref(), Some("agent crashed"));

    // A fresh `assign()` call for the same key re-opens a Failed record
    // back into Assigned (spec.md §4.E's Failed -> Assigned retry path).
    let retried = store.assign(assignment("bd-1")).await.unwrap();
    assert_eq!(retried.status, AssignmentStatus::Assigned);
}

#[tokio::test]
async fn failed_assignment_cannot_be_reassigned() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    store.assign(assignment("bd-1")).await.unwrap();
    store.mark_working("alpha", "bd-1").await.unwrap();
    store.mark_failed("alpha", "bd-1", "crashed").await.unwrap();

    let err = store
        .reassign("alpha", "bd-1", 2, AgentType::Claude, None, "retry", false)
        .await
        .unwrap_err();
    match err {
        StoreError::InvalidTransition { current, attempted } => {
            assert_eq!(current, "failed");
            assert_eq!(attempted, "working");
        }
        other => panic!("expected InvalidTransition, got {other:?}"),
    }
}

#[tokio::test]
async fn reassign_relocates_the_record_under_the_same_key() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    store.assign(assignment("bd-1")).await.unwrap();
    store.mark_working("alpha", "bd-1").await.unwrap();

    let relocated = store
        .reassign(
            "alpha",
            "bd-1",
            2,
            AgentType::Codex,
            Some("gpt-5".to_string()),
            "Continue bd-1",
            true,
        )
        .await
        .unwrap();
    assert_eq!(relocated.pane, 2);
    assert_eq!(relocated.agent_type, AgentType::Codex);
    assert_eq!(relocated.status, AssignmentStatus::Working);
    assert_eq!(relocated.reassigned_from.as_deref(), Some("1:claude"));
    assert_eq!(relocated.reassigned_to.as_deref(), Some("2:codex"));

    // Still a single record at the original key — no leftover `Reassigned`
    // source record fighting it for the same `{session, work_id}` slot.
    let all = store.load_store("alpha").await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].pane, 2);
}

#[tokio::test]
async fn terminal_states_reject_further_transitions() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    store.assign(assignment("bd-1")).await.unwrap();
    store.mark_working("alpha", "bd-1").await.unwrap();
    store.mark_completed("alpha", "bd-1").await.unwrap();

    let err = store.mark_working("alpha", "bd-1").await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidTransition { .. }));
}

#[tokio::test]
async fn load_store_reflects_a_reload_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = store(dir.path());
        store.assign(assignment("bd-1")).await.unwrap();
        store.assign(assignment("bd-2")).await.unwrap();
    }
    // Re-open against the same directory to verify the atomic-write path
    // actually persisted records rather than relying on in-memory state.
    let reopened = store(dir.path());
    let all = reopened.load_store("alpha").await.unwrap();
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn approval_lifecycle_create_list_approve() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    store
        .create_approval(Approval::new(
            "tok-1",
            "kill_session",
            "alpha",
            "stuck agent",
            "alice",
            false,
            Duration::seconds(3600),
        ))
        .await
        .unwrap();

    let pending = store.list_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, "tok-1");

    let approved = store.approve("tok-1", "bob").await.unwrap();
    assert_eq!(approved.status, ApprovalStatus::Approved);
    assert_eq!(approved.approved_by.as_deref(), Some("bob"));

    let pending_after = store.list_pending().await.unwrap();
    assert!(pending_after.is_empty());
}

#[tokio::test]
async fn approval_denial_records_a_reason_and_blocks_reapproval() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    store
        .create_approval(Approval::new(
            "tok-2",
            "force_push",
            "alpha",
            "recover from bad rebase",
            "alice",
            true,
            Duration::seconds(3600),
        ))
        .await
        .unwrap();

    let denied = store.deny("tok-2", "too risky").await.unwrap();
    assert_eq!(denied.status, ApprovalStatus::Denied);
    assert_eq!(denied.denied_reason.as_deref(), Some("too risky"));

    let err = store.approve("tok-2", "bob").await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidTransition { .. }));
}

#[tokio::test]
async fn expired_approval_is_surfaced_lazily_on_check() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    store
        .create_approval(Approval::new(
            "tok-3",
            "kill_session",
            "alpha",
            "stuck agent",
            "alice",
            false,
            Duration::seconds(-1),
        ))
        .await
        .unwrap();

    let checked = store.check("tok-3").await.unwrap();
    assert_eq!(checked.status, ApprovalStatus::Expired);
}

#[tokio::test]
async fn get_on_an_unknown_work_id_reports_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    let err = store.get("alpha", "bd-missing").await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
}
