//! Persistent State Store (spec.md §4.C): key-value records for
//! Assignments (`{session, work_id}`) and Approvals (`{token}`), atomic
//! writes, and the single choke point for Assignment status transitions
//! (spec.md §9: "place transition rules in the State Store, not in
//! callers").
//!
//! Grounded on the teacher's `CcswarmConfig::to_file`/`from_file`
//! persistence convention, generalized into a shared `atomic_write`
//! helper (write-temp-then-rename), and on the teacher's sibling examples'
//! use of `rusqlite` for an embedded, migrated backend.

pub mod approval;
pub mod assignment;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;

pub use approval::{Approval, ApprovalStatus};
pub use assignment::{Assignment, AssignmentStatus};

use crate::tmux::AgentType;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no record for {0}")]
    NotFound(String),
    #[error("invalid transition from {current} to {attempted}")]
    InvalidTransition { current: String, attempted: String },
    #[error("concurrent write conflict for {0}")]
    Conflict(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Atomically replaces `path`'s contents: write to a sibling temp file,
/// then rename over the target. Never leaves a half-written file visible
/// to a concurrent reader.
pub async fn atomic_write(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(dir).await?;
    let tmp_path = dir.join(format!(
        ".{}.tmp-{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("store"),
        uuid::Uuid::new_v4()
    ));
    tokio::fs::write(&tmp_path, contents).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

/// Contract shared by every backend. Every status-changing method is the
/// single choke point; callers never mutate records directly.
#[async_trait]
pub trait Store: Send + Sync {
    async fn assign(&self, assignment: Assignment) -> Result<Assignment, StoreError>;
    async fn get(&self, session: &str, work_id: &str) -> Result<Assignment, StoreError>;
    async fn mark_working(&self, session: &str, work_id: &str) -> Result<Assignment, StoreError>;
    async fn mark_completed(&self, session: &str, work_id: &str) -> Result<Assignment, StoreError>;
    async fn mark_failed(
        &self,
        session: &str,
        work_id: &str,
        reason: &str,
    ) -> Result<Assignment, StoreError>;
    /// Relocates a live Assignment to a new pane in place: the record stays
    /// under the same `{session, work_id}` key, ending in `Working` there,
    /// rather than being retired to `Reassigned` and replaced by a second
    /// record under the same key (the store has no room for two records at
    /// one key). `reassigned_from`/`reassigned_to` record the most recent
    /// hop for audit purposes.
    #[allow(clippy::too_many_arguments)]
    async fn reassign(
        &self,
        session: &str,
        work_id: &str,
        new_pane: u32,
        new_agent_type: AgentType,
        new_model: Option<String>,
        new_prompt: &str,
        reservations_transferred: bool,
    ) -> Result<Assignment, StoreError>;
    async fn load_store(&self, session: &str) -> Result<Vec<Assignment>, StoreError>;

    async fn create_approval(&self, approval: Approval) -> Result<Approval, StoreError>;
    async fn list_pending(&self) -> Result<Vec<Approval>, StoreError>;
    async fn approve(&self, token: &str, approved_by: &str) -> Result<Approval, StoreError>;
    async fn deny(&self, token: &str, reason: &str) -> Result<Approval, StoreError>;
    async fn check(&self, token: &str) -> Result<Approval, StoreError>;
}

type AssignmentMap = HashMap<String, Assignment>;

/// Default backend: one JSON document per session under
/// `$XDG_DATA_HOME/ntm/assignments/<session>.json`, plus a single
/// `approvals.json` document, both written atomically. A `DashMap` of
/// per-key `tokio::sync::Mutex` guards serializes writes without holding
/// a lock across unrelated sessions (spec.md §5).
pub struct JsonFileStore {
    assignments_dir: PathBuf,
    approvals_path: PathBuf,
    session_locks: DashMap<String, Arc<Mutex<()>>>,
    approvals_lock: Arc<Mutex<()>>,
}

impl JsonFileStore {
    pub fn new(assignments_dir: PathBuf, approvals_path: PathBuf) -> Self {
        Self {
            assignments_dir,
            approvals_path,
            session_locks: DashMap::new(),
            approvals_lock: Arc::new(Mutex::new(())),
        }
    }

    fn session_path(&self, session: &str) -> PathBuf {
        self.assignments_dir.join(format!("{session}.json"))
    }

    fn lock_for(&self, session: &str) -> Arc<Mutex<()>> {
        self.session_locks
            .entry(session.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn read_session(&self, session: &str) -> Result<AssignmentMap, StoreError> {
        let path = self.session_path(session);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| StoreError::Serialization(e.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_session(&self, session: &str, map: &AssignmentMap) -> Result<(), StoreError> {
        let bytes =
            serde_json::to_vec_pretty(map).map_err(|e| StoreError::Serialization(e.to_string()))?;
        atomic_write(&self.session_path(session), &bytes).await
    }

    async fn read_approvals(&self) -> Result<HashMap<String, Approval>, StoreError> {
        match tokio::fs::read(&self.approvals_path).await {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| StoreError::Serialization(e.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_approvals(&self, map: &HashMap<String, Approval>) -> Result<(), StoreError> {
        let bytes =
            serde_json::to_vec_pretty(map).map_err(|e| StoreError::Serialization(e.to_string()))?;
        atomic_write(&self.approvals_path, &bytes).await
    }

    fn transition(
        current: &Assignment,
        next: AssignmentStatus,
    ) -> Result<(), StoreError> {
        if !current.status.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                current: current.status.to_string(),
                attempted: next.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Store for JsonFileStore {
    async fn assign(&self, assignment: Assignment) -> Result<Assignment, StoreError> {
        let lock = self.lock_for(&assignment.session);
        let _guard = lock.lock().await;
        let mut map = self.read_session(&assignment.session).await?;
        if let Some(existing) = map.get(&assignment.work_id) {
            if !existing.status.can_transition_to(AssignmentStatus::Assigned) {
                return Err(StoreError::Conflict(assignment.key()));
            }
        }
        map.insert(assignment.work_id.clone(), assignment.clone());
        self.write_session(&assignment.session, &map).await?;
        Ok(assignment)
    }

    async fn get(&self, session: &str, work_id: &str) -> Result<Assignment, StoreError> {
        let map = self.read_session(session).await?;
        map.get(work_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{session}:{work_id}")))
    }

    async fn mark_working(&self, session: &str, work_id: &str) -> Result<Assignment, StoreError> {
        let lock = self.lock_for(session);
        let _guard = lock.lock().await;
        let mut map = self.read_session(session).await?;
        let record = map
            .get_mut(work_id)
            .ok_or_else(|| StoreError::NotFound(format!("{session}:{work_id}")))?;
        Self::transition(record, AssignmentStatus::Working)?;
        record.status = AssignmentStatus::Working;
        record.working_at = Some(chrono::Utc::now());
        let updated = record.clone();
        self.write_session(session, &map).await?;
        Ok(updated)
    }

    async fn mark_completed(&self, session: &str, work_id: &str) -> Result<Assignment, StoreError> {
        let lock = self.lock_for(session);
        let _guard = lock.lock().await;
        let mut map = self.read_session(session).await?;
        let record = map
            .get_mut(work_id)
            .ok_or_else(|| StoreError::NotFound(format!("{session}:{work_id}")))?;
        Self::transition(record, AssignmentStatus::Completed)?;
        record.status = AssignmentStatus::Completed;
        record.completed_at = Some(chrono::Utc::now());
        let updated = record.clone();
        self.write_session(session, &map).await?;
        Ok(updated)
    }

    async fn mark_failed(
        &self,
        session: &str,
        work_id: &str,
        reason: &str,
    ) -> Result<Assignment, StoreError> {
        let lock = self.lock_for(session);
        let _guard = lock.lock().await;
        let mut map = self.read_session(session).await?;
        let record = map
            .get_mut(work_id)
            .ok_or_else(|| StoreError::NotFound(format!("{session}:{work_id}")))?;
        Self::transition(record, AssignmentStatus::Failed)?;
        record.status = AssignmentStatus::Failed;
        record.failed_at = Some(chrono::Utc::now());
        record.denial_reason = Some(reason.to_string());
        let updated = record.clone();
        self.write_session(session, &map).await?;
        Ok(updated)
    }

    async fn reassign(
        &self,
        session: &str,
        work_id: &str,
        new_pane: u32,
        new_agent_type: AgentType,
        new_model: Option<String>,
        new_prompt: &str,
        reservations_transferred: bool,
    ) -> Result<Assignment, StoreError> {
        let lock = self.lock_for(session);
        let _guard = lock.lock().await;
        let mut map = self.read_session(session).await?;
        let record = map
            .get_mut(work_id)
            .ok_or_else(|| StoreError::NotFound(format!("{session}:{work_id}")))?;
        if !matches!(record.status, AssignmentStatus::Assigned | AssignmentStatus::Working) {
            return Err(StoreError::InvalidTransition {
                current: record.status.to_string(),
                attempted: AssignmentStatus::Working.to_string(),
            });
        }
        record.reassigned_from = Some(format!("{}:{}", record.pane, record.agent_type));
        record.reassigned_to = Some(format!("{new_pane}:{new_agent_type}"));
        record.pane = new_pane;
        record.agent_type = new_agent_type;
        record.model = new_model;
        record.initial_prompt = new_prompt.to_string();
        record.status = AssignmentStatus::Working;
        record.working_at = Some(chrono::Utc::now());
        record.reassigned_at = Some(chrono::Utc::now());
        record.file_reservations_transferred = Some(reservations_transferred);
        let updated = record.clone();
        self.write_session(session, &map).await?;
        Ok(updated)
    }

    async fn load_store(&self, session: &str) -> Result<Vec<Assignment>, StoreError> {
        let map = self.read_session(session).await?;
        Ok(map.into_values().collect())
    }

    async fn create_approval(&self, approval: Approval) -> Result<Approval, StoreError> {
        let _guard = self.approvals_lock.lock().await;
        let mut map = self.read_approvals().await?;
        map.insert(approval.id.clone(), approval.clone());
        self.write_approvals(&map).await?;
        Ok(approval)
    }

    async fn list_pending(&self) -> Result<Vec<Approval>, StoreError> {
        let _guard = self.approvals_lock.lock().await;
        let mut map = self.read_approvals().await?;
        for approval in map.values_mut() {
            approval.refresh_expiry();
        }
        self.write_approvals(&map).await?;
        Ok(map
            .into_values()
            .filter(|a| a.status == ApprovalStatus::Pending)
            .collect())
    }

    async fn approve(&self, token: &str, approved_by: &str) -> Result<Approval, StoreError> {
        let _guard = self.approvals_lock.lock().await;
        let mut map = self.read_approvals().await?;
        let approval = map
            .get_mut(token)
            .ok_or_else(|| StoreError::NotFound(token.to_string()))?;
        approval.refresh_expiry();
        if approval.is_terminal() {
            return Err(StoreError::InvalidTransition {
                current: approval.status.to_string(),
                attempted: ApprovalStatus::Approved.to_string(),
            });
        }
        approval.status = ApprovalStatus::Approved;
        approval.approved_by = Some(approved_by.to_string());
        approval.approved_at = Some(chrono::Utc::now());
        let updated = approval.clone();
        self.write_approvals(&map).await?;
        Ok(updated)
    }

    async fn deny(&self, token: &str, reason: &str) -> Result<Approval, StoreError> {
        let _guard = self.approvals_lock.lock().await;
        let mut map = self.read_approvals().await?;
        let approval = map
            .get_mut(token)
            .ok_or_else(|| StoreError::NotFound(token.to_string()))?;
        approval.refresh_expiry();
        if approval.is_terminal() {
            return Err(StoreError::InvalidTransition {
                current: approval.status.to_string(),
                attempted: ApprovalStatus::Denied.to_string(),
            });
        }
        approval.status = ApprovalStatus::Denied;
        approval.denied_reason = Some(reason.to_string());
        let updated = approval.clone();
        self.write_approvals(&map).await?;
        Ok(updated)
    }

    async fn check(&self, token: &str) -> Result<Approval, StoreError> {
        let _guard = self.approvals_lock.lock().await;
        let mut map = self.read_approvals().await?;
        let approval = map
            .get_mut(token)
            .ok_or_else(|| StoreError::NotFound(token.to_string()))?;
        approval.refresh_expiry();
        let updated = approval.clone();
        self.write_approvals(&map).await?;
        Ok(updated)
    }
}

#[cfg(feature = "sqlite")]
pub mod sqlite {
    //! Feature-gated embedded backend (spec.md §6.3 names
    //! `~/.config/ntm/state.db` as a first-class persistent-layout entry).
    //! Runs idempotent `CREATE TABLE IF NOT EXISTS` migrations on open and
    //! stores both record kinds as JSON blobs keyed by their natural key,
    //! matching the `Store` trait's contract without duplicating the
    //! transition logic above.

    use super::*;
    use rusqlite::Connection;
    use std::sync::Mutex as StdMutex;

    pub struct SqliteStore {
        conn: StdMutex<Connection>,
    }

    impl SqliteStore {
        pub fn open(path: &Path) -> Result<Self, StoreError> {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let conn = Connection::open(path)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS assignments (
                    session TEXT NOT NULL,
                    work_id TEXT NOT NULL,
                    data TEXT NOT NULL,
                    PRIMARY KEY (session, work_id)
                );
                CREATE TABLE IF NOT EXISTS approvals (
                    token TEXT PRIMARY KEY,
                    data TEXT NOT NULL
                );",
            )
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
            Ok(Self {
                conn: StdMutex::new(conn),
            })
        }

        fn load_assignment(&self, session: &str, work_id: &str) -> Result<Assignment, StoreError> {
            let conn = self.conn.lock().unwrap();
            let data: String = conn
                .query_row(
                    "SELECT data FROM assignments WHERE session = ?1 AND work_id = ?2",
                    rusqlite::params![session, work_id],
                    |row| row.get(0),
                )
                .map_err(|_| StoreError::NotFound(format!("{session}:{work_id}")))?;
            serde_json::from_str(&data).map_err(|e| StoreError::Serialization(e.to_string()))
        }

        fn save_assignment(&self, assignment: &Assignment) -> Result<(), StoreError> {
            let data = serde_json::to_string(assignment)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO assignments (session, work_id, data) VALUES (?1, ?2, ?3)
                 ON CONFLICT(session, work_id) DO UPDATE SET data = excluded.data",
                rusqlite::params![assignment.session, assignment.work_id, data],
            )
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
            Ok(())
        }
    }

    #[async_trait]
    impl Store for SqliteStore {
        async fn assign(&self, assignment: Assignment) -> Result<Assignment, StoreError> {
            if let Ok(existing) = self.load_assignment(&assignment.session, &assignment.work_id) {
                if !existing.status.can_transition_to(AssignmentStatus::Assigned) {
                    return Err(StoreError::Conflict(assignment.key()));
                }
            }
            self.save_assignment(&assignment)?;
            Ok(assignment)
        }

        async fn get(&self, session: &str, work_id: &str) -> Result<Assignment, StoreError> {
            self.load_assignment(session, work_id)
        }

        async fn mark_working(&self, session: &str, work_id: &str) -> Result<Assignment, StoreError> {
            let mut record = self.load_assignment(session, work_id)?;
            if !record.status.can_transition_to(AssignmentStatus::Working) {
                return Err(StoreError::InvalidTransition {
                    current: record.status.to_string(),
                    attempted: AssignmentStatus::Working.to_string(),
                });
            }
            record.status = AssignmentStatus::Working;
            record.working_at = Some(chrono::Utc::now());
            self.save_assignment(&record)?;
            Ok(record)
        }

        async fn mark_completed(&self, session: &str, work_id: &str) -> Result<Assignment, StoreError> {
            let mut record = self.load_assignment(session, work_id)?;
            if !record.status.can_transition_to(AssignmentStatus::Completed) {
                return Err(StoreError::InvalidTransition {
                    current: record.status.to_string(),
                    attempted: AssignmentStatus::Completed.to_string(),
                });
            }
            record.status = AssignmentStatus::Completed;
            record.completed_at = Some(chrono::Utc::now());
            self.save_assignment(&record)?;
            Ok(record)
        }

        async fn mark_failed(
            &self,
            session: &str,
            work_id: &str,
            reason: &str,
        ) -> Result<Assignment, StoreError> {
            let mut record = self.load_assignment(session, work_id)?;
            if !record.status.can_transition_to(AssignmentStatus::Failed) {
                return Err(StoreError::InvalidTransition {
                    current: record.status.to_string(),
                    attempted: AssignmentStatus::Failed.to_string(),
                });
            }
            record.status = AssignmentStatus::Failed;
            record.failed_at = Some(chrono::Utc::now());
            record.denial_reason = Some(reason.to_string());
            self.save_assignment(&record)?;
            Ok(record)
        }

        async fn reassign(
            &self,
            session: &str,
            work_id: &str,
            new_pane: u32,
            new_agent_type: AgentType,
            new_model: Option<String>,
            new_prompt: &str,
            reservations_transferred: bool,
        ) -> Result<Assignment, StoreError> {
            let mut record = self.load_assignment(session, work_id)?;
            if !matches!(record.status, AssignmentStatus::Assigned | AssignmentStatus::Working) {
                return Err(StoreError::InvalidTransition {
                    current: record.status.to_string(),
                    attempted: AssignmentStatus::Working.to_string(),
                });
            }
            record.reassigned_from = Some(format!("{}:{}", record.pane, record.agent_type));
            record.reassigned_to = Some(format!("{new_pane}:{new_agent_type}"));
            record.pane = new_pane;
            record.agent_type = new_agent_type;
            record.model = new_model;
            record.initial_prompt = new_prompt.to_string();
            record.status = AssignmentStatus::Working;
            record.working_at = Some(chrono::Utc::now());
            record.reassigned_at = Some(chrono::Utc::now());
            record.file_reservations_transferred = Some(reservations_transferred);
            self.save_assignment(&record)?;
            Ok(record)
        }

        async fn load_store(&self, session: &str) -> Result<Vec<Assignment>, StoreError> {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn
                .prepare("SELECT data FROM assignments WHERE session = ?1")
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            let rows = stmt
                .query_map(rusqlite::params![session], |row| row.get::<_, String>(0))
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            let mut out = Vec::new();
            for row in rows {
                let data = row.map_err(|e| StoreError::Serialization(e.to_string()))?;
                out.push(
                    serde_json::from_str(&data)
                        .map_err(|e| StoreError::Serialization(e.to_string()))?,
                );
            }
            Ok(out)
        }

        async fn create_approval(&self, approval: Approval) -> Result<Approval, StoreError> {
            let data = serde_json::to_string(&approval)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO approvals (token, data) VALUES (?1, ?2)
                 ON CONFLICT(token) DO UPDATE SET data = excluded.data",
                rusqlite::params![approval.id, data],
            )
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
            Ok(approval)
        }

        async fn list_pending(&self) -> Result<Vec<Approval>, StoreError> {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn
                .prepare("SELECT data FROM approvals")
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            let mut out = Vec::new();
            for row in rows {
                let data = row.map_err(|e| StoreError::Serialization(e.to_string()))?;
                let mut approval: Approval = serde_json::from_str(&data)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                approval.refresh_expiry();
                if approval.status == ApprovalStatus::Pending {
                    out.push(approval);
                }
            }
            Ok(out)
        }

        async fn approve(&self, token: &str, approved_by: &str) -> Result<Approval, StoreError> {
            let conn_result = {
                let conn = self.conn.lock().unwrap();
                conn.query_row(
                    "SELECT data FROM approvals WHERE token = ?1",
                    rusqlite::params![token],
                    |row| row.get::<_, String>(0),
                )
            };
            let data = conn_result.map_err(|_| StoreError::NotFound(token.to_string()))?;
            let mut approval: Approval =
                serde_json::from_str(&data).map_err(|e| StoreError::Serialization(e.to_string()))?;
            approval.refresh_expiry();
            if approval.is_terminal() {
                return Err(StoreError::InvalidTransition {
                    current: approval.status.to_string(),
                    attempted: ApprovalStatus::Approved.to_string(),
                });
            }
            approval.status = ApprovalStatus::Approved;
            approval.approved_by = Some(approved_by.to_string());
            approval.approved_at = Some(chrono::Utc::now());
            self.create_approval(approval.clone()).await?;
            Ok(approval)
        }

        async fn deny(&self, token: &str, reason: &str) -> Result<Approval, StoreError> {
            let conn_result = {
                let conn = self.conn.lock().unwrap();
                conn.query_row(
                    "SELECT data FROM approvals WHERE token = ?1",
                    rusqlite::params![token],
                    |row| row.get::<_, String>(0),
                )
            };
            let data = conn_result.map_err(|_| StoreError::NotFound(token.to_string()))?;
            let mut approval: Approval =
                serde_json::from_str(&data).map_err(|e| StoreError::Serialization(e.to_string()))?;
            approval.refresh_expiry();
            if approval.is_terminal() {
                return Err(StoreError::InvalidTransition {
                    current: approval.status.to_string(),
                    attempted: ApprovalStatus::Denied.to_string(),
                });
            }
            approval.status = ApprovalStatus::Denied;
            approval.denied_reason = Some(reason.to_string());
            self.create_approval(approval.clone()).await?;
            Ok(approval)
        }

        async fn check(&self, token: &str) -> Result<Approval, StoreError> {
            let conn_result = {
                let conn = self.conn.lock().unwrap();
                conn.query_row(
                    "SELECT data FROM approvals WHERE token = ?1",
                    rusqlite::params![token],
                    |row| row.get::<_, String>(0),
                )
            };
            let data = conn_result.map_err(|_| StoreError::NotFound(token.to_string()))?;
            let mut approval: Approval =
                serde_json::from_str(&data).map_err(|e| StoreError::Serialization(e.to_string()))?;
            approval.refresh_expiry();
            self.create_approval(approval.clone()).await?;
            Ok(approval)
        }
    }
}
