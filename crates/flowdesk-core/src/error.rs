// Error types for the sync core
//
// One enum per concern. Only RemoteError::VersionConflict and SaveError::Conflict
// have a structured recovery path; everything else is reported as-is and
// leaves local state exactly as it was before the failed call.

use thiserror::Error;

use crate::graph::{LockVersion, WorkflowId};
use crate::save::SaveConflict;
use crate::validate::ValidationReport;

/// Errors returned by the remote workflow/execution store
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// The submitted lock version no longer matches the stored one
    #[error("version conflict: submitted lock_version {submitted}, store has {}", display_current(.current))]
    VersionConflict {
        submitted: LockVersion,
        current: Option<LockVersion>,
    },

    /// Workflow or task does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Transport failure (connection refused, timeout, malformed body)
    #[error("network error: {0}")]
    Network(String),

    /// Non-success status from the server
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// The server answered, but broke the protocol (e.g. a non-increasing version)
    #[error("protocol violation: {0}")]
    Protocol(String),
}

fn display_current(current: &Option<LockVersion>) -> String {
    current
        .map(|v| v.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

impl RemoteError {
    pub fn network(msg: impl Into<String>) -> Self {
        RemoteError::Network(msg.into())
    }

    pub fn server(status: u16, msg: impl Into<String>) -> Self {
        RemoteError::Server {
            status,
            message: msg.into(),
        }
    }

    pub fn workflow_not_found(id: WorkflowId) -> Self {
        RemoteError::NotFound(format!("workflow {id}"))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, RemoteError::VersionConflict { .. })
    }
}

/// Errors from the durable key-value store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Errors from the save path
#[derive(Debug, Error)]
pub enum SaveError {
    /// Structural validation failed; nothing was sent
    #[error("validation failed: {0}")]
    Validation(ValidationReport),

    /// The remote copy moved on; a conflict is now outstanding
    #[error("{}", .0.describe())]
    Conflict(Box<SaveConflict>),

    /// A previous conflict has not been resolved yet
    #[error("an unresolved save conflict must be resolved first")]
    ConflictUnresolved,

    /// resolve_conflict was called with nothing to resolve
    #[error("no save conflict is outstanding")]
    NoConflict,

    /// Another save is already in flight
    #[error("a save is already in progress")]
    SaveInProgress,

    /// Operation needs a stored document
    #[error("workflow has not been saved yet")]
    NoIdentity,

    /// Remote write failed; document remains dirty
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl SaveError {
    /// The outstanding conflict, if this error carries one
    pub fn conflict(&self) -> Option<&SaveConflict> {
        match self {
            SaveError::Conflict(conflict) => Some(conflict),
            _ => None,
        }
    }
}

/// Errors from the execution lifecycle
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// Run requested on a graph without nodes; nothing was sent
    #[error("cannot run a workflow without nodes")]
    EmptyGraph,

    /// Persisting the graph snapshot before the run failed
    #[error("saving workflow before run failed: {0}")]
    Save(#[from] SaveError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// The durable handle could not be written or cleared
    #[error("task handle storage failed: {0}")]
    Store(#[from] StoreError),
}

/// Errors from history browsing
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history request failed: {0}")]
    Remote(#[from] RemoteError),
}

/// Errors from reconciling execution state with history
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

/// Errors from opening a workflow in an editor session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("loading workflow failed: {0}")]
    Load(#[from] RemoteError),

    #[error("restoring active execution failed: {0}")]
    Restore(#[from] ExecutionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_display_with_unknown_current() {
        let err = RemoteError::VersionConflict {
            submitted: LockVersion(3),
            current: None,
        };
        assert_eq!(
            err.to_string(),
            "version conflict: submitted lock_version 3, store has unknown"
        );
        assert!(err.is_conflict());
        assert!(!RemoteError::network("reset").is_conflict());
    }
}
