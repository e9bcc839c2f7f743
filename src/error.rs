//! Crate-wide error type and the `--json` error envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::assignment::AssignmentError;
use crate::coordination::CoordinationError;
use crate::coordinator::CoordinatorError;
use crate::ensemble::EnsembleError;
use crate::guards::GuardError;
use crate::session::SessionError;
use crate::store::StoreError;
use crate::tmux::TmuxError;

/// Stable machine-readable error codes, matching the taxonomy in §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Validation,
    SessionNotFound,
    PaneNotFound,
    NotAssigned,
    AlreadyExists,
    AlreadyAssigned,
    TargetBusy,
    NoIdleAgent,
    ReassignError,
    ExternalFail,
    CoordUnavailable,
    Cancelled,
}

/// Top-level error type returned by every public operation.
///
/// Lower layers (`TmuxError`, `CoordinationError`, `StoreError`,
/// `AssignmentError`, ...) surface raw, typed errors; this type is where
/// those get classified into the stable `code` taxonomy the CLI's
/// `--json` envelope and exit-code mapping depend on.
#[derive(Debug, thiserror::Error, Serialize)]
#[error("{message}")]
pub struct NtmError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl NtmError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Exit code per §6: 0 success (never constructed here), 1 generic
    /// failure, 2 validation error.
    pub fn exit_code(&self) -> i32 {
        match self.code {
            ErrorCode::Validation => 2,
            _ => 1,
        }
    }
}

impl From<TmuxError> for NtmError {
    fn from(err: TmuxError) -> Self {
        match err {
            TmuxError::InvalidSessionName(ref name) => NtmError::new(
                ErrorCode::Validation,
                format!("invalid session name: {name}"),
            ),
            TmuxError::SessionAlreadyExists(ref name) => NtmError::new(
                ErrorCode::AlreadyExists,
                format!("session '{name}' already exists"),
            ),
            TmuxError::SessionNotFound(ref name) => NtmError::new(
                ErrorCode::SessionNotFound,
                format!("session '{name}' not found"),
            ),
            TmuxError::PaneNotFound(ref pane) => {
                NtmError::new(ErrorCode::PaneNotFound, format!("pane '{pane}' not found"))
            }
            other => NtmError::new(ErrorCode::ExternalFail, other.to_string()),
        }
    }
}

impl From<CoordinationError> for NtmError {
    fn from(err: CoordinationError) -> Self {
        match err {
            CoordinationError::Unavailable(msg) => {
                NtmError::new(ErrorCode::CoordUnavailable, msg)
            }
            CoordinationError::Denied(msg) => NtmError::new(ErrorCode::Validation, msg),
            other => NtmError::new(ErrorCode::ExternalFail, other.to_string()),
        }
    }
}

impl From<StoreError> for NtmError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidTransition {
                ref current,
                ref attempted,
            } => NtmError::new(
                ErrorCode::ReassignError,
                format!("invalid transition from {current} to {attempted}"),
            )
            .with_details(serde_json::json!({ "current_status": current })),
            StoreError::NotFound(ref key) => {
                NtmError::new(ErrorCode::NotAssigned, format!("no record for {key}"))
            }
            other => NtmError::new(ErrorCode::ExternalFail, other.to_string()),
        }
    }
}

impl From<AssignmentError> for NtmError {
    fn from(err: AssignmentError) -> Self {
        match err {
            AssignmentError::NotAssigned { current_status } => {
                NtmError::new(ErrorCode::NotAssigned, "work item is not assigned")
                    .with_details(serde_json::json!({ "current_status": current_status }))
            }
            AssignmentError::AlreadyAssigned => {
                NtmError::new(ErrorCode::AlreadyAssigned, "work item already in a terminal state")
            }
            AssignmentError::PaneNotFound(pane) => {
                NtmError::new(ErrorCode::PaneNotFound, format!("pane '{pane}' not found"))
            }
            AssignmentError::NoIdleAgent(agent_type) => NtmError::new(
                ErrorCode::NoIdleAgent,
                format!("no idle agent of type '{agent_type}'"),
            ),
            AssignmentError::TargetBusy(pane) => {
                NtmError::new(ErrorCode::TargetBusy, format!("pane '{pane}' is busy"))
            }
            AssignmentError::ReassignError(msg) => {
                NtmError::new(ErrorCode::ReassignError, msg)
            }
            AssignmentError::ReassignNotAllowed { ref current_status } => {
                NtmError::new(ErrorCode::ReassignError, err.to_string())
                    .with_details(serde_json::json!({ "current_status": current_status }))
            }
            AssignmentError::Validation(msg) => NtmError::new(ErrorCode::Validation, msg),
            AssignmentError::Cancelled => {
                NtmError::new(ErrorCode::Cancelled, "operation cancelled")
            }
        }
    }
}

impl From<SessionError> for NtmError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::SessionAlreadyExists(name) => NtmError::new(
                ErrorCode::AlreadyExists,
                format!("session '{name}' already exists"),
            ),
            SessionError::SessionNotFound(name) => {
                NtmError::new(ErrorCode::SessionNotFound, format!("session '{name}' not found"))
            }
            SessionError::PaneNotFound(pane) => {
                NtmError::new(ErrorCode::PaneNotFound, format!("pane '{pane}' not found"))
            }
            SessionError::Validation(msg) => NtmError::new(ErrorCode::Validation, msg),
            SessionError::MaxAgentsExceeded(max) => NtmError::new(
                ErrorCode::Validation,
                format!("requested agent count exceeds configured maximum of {max}"),
            ),
            SessionError::ConfirmationRequired => NtmError::new(
                ErrorCode::Validation,
                "kill requires confirmation; pass --force",
            ),
            SessionError::Cancelled => NtmError::new(ErrorCode::Cancelled, "operation cancelled"),
            SessionError::Mux(mux) => mux.into(),
            SessionError::Spec(spec) => NtmError::new(ErrorCode::Validation, spec.to_string()),
        }
    }
}

impl From<EnsembleError> for NtmError {
    fn from(err: EnsembleError) -> Self {
        match err {
            EnsembleError::UnknownMode(code) => {
                NtmError::new(ErrorCode::Validation, format!("unknown mode '{code}'"))
            }
            EnsembleError::UnknownPreset(name) => {
                NtmError::new(ErrorCode::Validation, format!("unknown preset '{name}'"))
            }
            EnsembleError::Validation(msg) => NtmError::new(ErrorCode::Validation, msg),
            EnsembleError::Mux(mux) => mux.into(),
            EnsembleError::Io(io) => NtmError::new(ErrorCode::ExternalFail, io.to_string()),
            EnsembleError::Persistence(msg) => NtmError::new(ErrorCode::ExternalFail, msg),
        }
    }
}

impl From<CoordinatorError> for NtmError {
    fn from(err: CoordinatorError) -> Self {
        match err {
            CoordinatorError::Session(session) => session.into(),
            CoordinatorError::Store(store) => store.into(),
            CoordinatorError::Assignment(msg) => NtmError::new(ErrorCode::ExternalFail, msg),
        }
    }
}

impl From<GuardError> for NtmError {
    fn from(err: GuardError) -> Self {
        match err {
            GuardError::AlreadyInstalled => {
                NtmError::new(ErrorCode::AlreadyExists, "guard already installed")
            }
            GuardError::NotManagedByNtm => NtmError::new(
                ErrorCode::Validation,
                "refusing to remove a pre-commit hook not installed by ntm",
            ),
            GuardError::NotInstalled => {
                NtmError::new(ErrorCode::Validation, "no guard installed for this repository")
            }
            GuardError::Io(io) => NtmError::new(ErrorCode::ExternalFail, io.to_string()),
        }
    }
}

/// Extension trait mirroring the teacher's `ResultExt`, for `anyhow`-level
/// plumbing that never needs to reach the `NtmError` taxonomy.
pub trait ResultExt<T> {
    fn context_op(self, operation: &str) -> anyhow::Result<T>;
    fn context_path(self, operation: &str, path: &std::path::Path) -> anyhow::Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context_op(self, operation: &str) -> anyhow::Result<T> {
        use anyhow::Context;
        self.context(format!("failed to {operation}"))
    }

    fn context_path(self, operation: &str, path: &std::path::Path) -> anyhow::Result<T> {
        use anyhow::Context;
        self.context(format!("failed to {operation} at '{}'", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_mapping() {
        let validation = NtmError::new(ErrorCode::Validation, "bad name");
        assert_eq!(validation.exit_code(), 2);

        let not_found = NtmError::new(ErrorCode::SessionNotFound, "missing");
        assert_eq!(not_found.exit_code(), 1);
    }

    #[test]
    fn serializes_without_details_when_absent() {
        let err = NtmError::new(ErrorCode::Validation, "bad name");
        let value = serde_json::to_value(&err).unwrap();
        assert!(value.get("details").is_none());
    }
}
