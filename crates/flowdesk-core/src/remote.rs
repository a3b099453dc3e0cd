// Remote store interfaces
//
// The sync core never talks HTTP directly. These traits describe the
// workflow store (versioned documents) and the execution service (start,
// cancel, history). `memory` has in-process implementations; the CLI crate
// has the reqwest-backed one.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RemoteError;
use crate::graph::{LockVersion, WorkflowGraph, WorkflowId, WorkflowRecord};

/// Identifier of a remote execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub i64);

impl TaskId {
    /// Next id from a process-wide sequence (used by in-memory stores)
    pub fn new() -> Self {
        static NEXT: AtomicI64 = AtomicI64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<i64> for TaskId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl FromStr for TaskId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// Result of an accepted versioned write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedWorkflow {
    #[serde(alias = "configuration")]
    pub graph: WorkflowGraph,
    pub lock_version: LockVersion,
}

/// Status of a remote execution as recorded in history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[serde(alias = "queued")]
    Pending,
    #[serde(alias = "in_progress")]
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// The execution may still be doing work remotely
    pub fn is_in_flight(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A past (or in-flight) execution of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskHistoryEntry {
    pub id: TaskId,
    pub status: TaskStatus,
    #[serde(deserialize_with = "server_time::deserialize")]
    pub created_at: DateTime<Utc>,
    #[serde(default, deserialize_with = "server_time::deserialize_option")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Prompt or directive the run was started with
    #[serde(default)]
    pub user_input: Option<String>,
    #[serde(default)]
    pub input_data: Option<serde_json::Value>,
    #[serde(default, alias = "result")]
    pub output_data: Option<serde_json::Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
}

impl TaskHistoryEntry {
    pub fn new(id: TaskId, status: TaskStatus, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            status,
            created_at,
            completed_at: None,
            user_input: None,
            input_data: None,
            output_data: None,
            error_message: None,
            duration_seconds: None,
        }
    }

    /// Wall-clock duration, from the server value or the timestamps
    pub fn duration(&self) -> Option<chrono::Duration> {
        if let Some(secs) = self.duration_seconds {
            return chrono::Duration::try_milliseconds((secs * 1000.0) as i64);
        }
        self.completed_at.map(|done| done - self.created_at)
    }
}

/// Server timestamps may come without a UTC offset; those are read as UTC
mod server_time {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer};

    fn parse(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .or_else(|_| {
                NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").map(|t| t.and_utc())
            })
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    pub fn deserialize_option<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|raw| parse(&raw).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// One page of execution history, most recent first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPage {
    pub workflow_id: WorkflowId,
    pub total_count: u64,
    pub limit: u32,
    pub offset: u32,
    pub tasks: Vec<TaskHistoryEntry>,
}

/// Acknowledgement of a cancellation request
///
/// Cancelling a task that already finished (or that the server does not
/// know) is acknowledged rather than treated as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelAck {
    Requested,
    AlreadyFinished,
}

/// Versioned workflow document store
#[async_trait]
pub trait WorkflowApi: Send + Sync {
    /// Fetch the authoritative current document
    async fn get_workflow(&self, id: WorkflowId) -> Result<WorkflowRecord, RemoteError>;

    /// Store a brand-new document; the store assigns id and initial version
    async fn create_workflow(
        &self,
        name: &str,
        graph: &WorkflowGraph,
    ) -> Result<WorkflowRecord, RemoteError>;

    /// Compare-and-swap write
    ///
    /// Accepted only when `lock_version` equals the stored version; otherwise
    /// fails with [`RemoteError::VersionConflict`].
    async fn update_workflow(
        &self,
        id: WorkflowId,
        graph: &WorkflowGraph,
        lock_version: LockVersion,
    ) -> Result<SavedWorkflow, RemoteError>;

    /// Rename without touching the graph or the lock version
    async fn rename_workflow(&self, id: WorkflowId, name: &str) -> Result<(), RemoteError>;

    /// Current stored lock version
    async fn current_lock_version(&self, id: WorkflowId) -> Result<LockVersion, RemoteError> {
        Ok(self.get_workflow(id).await?.lock_version)
    }
}

/// Remote execution service
#[async_trait]
pub trait ExecutionApi: Send + Sync {
    /// Start an execution of the stored workflow
    async fn execute(
        &self,
        workflow_id: WorkflowId,
        inputs: &serde_json::Value,
    ) -> Result<TaskId, RemoteError>;

    /// Request cancellation (idempotent)
    async fn cancel(&self, task_id: TaskId) -> Result<CancelAck, RemoteError>;

    /// Execution history, most recent first
    async fn history(
        &self,
        workflow_id: WorkflowId,
        limit: u32,
        offset: u32,
    ) -> Result<HistoryPage, RemoteError>;

    /// Delete a history record
    async fn delete_task(&self, task_id: TaskId) -> Result<(), RemoteError>;
}
