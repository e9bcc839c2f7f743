//! Approval record and lifecycle (spec.md §3).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Denied => "denied",
            ApprovalStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// A record for a dangerous operation requiring sign-off (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub id: String,
    pub action: String,
    pub resource: String,
    pub reason: String,
    pub requested_by: String,
    pub requires_slb: bool,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub denied_reason: Option<String>,
    pub correlation_id: Option<String>,
}

impl Approval {
    pub fn new(
        id: impl Into<String>,
        action: impl Into<String>,
        resource: impl Into<String>,
        reason: impl Into<String>,
        requested_by: impl Into<String>,
        requires_slb: bool,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            action: action.into(),
            resource: resource.into(),
            reason: reason.into(),
            requested_by: requested_by.into(),
            requires_slb,
            status: ApprovalStatus::Pending,
            created_at: now,
            expires_at: now + ttl,
            approved_by: None,
            approved_at: None,
            denied_reason: None,
            correlation_id: None,
        }
    }

    /// Lazily transitions `Pending` to `Expired` when past `expires_at`.
    /// Applied on every read so callers never observe a stale Pending
    /// record past its TTL.
    pub fn refresh_expiry(&mut self) {
        if self.status == ApprovalStatus::Pending && Utc::now() >= self.expires_at {
            self.status = ApprovalStatus::Expired;
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.status, ApprovalStatus::Pending)
    }
}
