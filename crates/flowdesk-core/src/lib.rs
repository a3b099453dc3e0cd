// Workflow Editor Sync Core
//
// This crate keeps an editor's local copy of a workflow graph consistent with
// a shared remote copy while asynchronous executions run against it.
//
// Key design decisions:
// - Remote store, execution service, durable storage, prompts and the exit hook
//   are traits (WorkflowApi, ExecutionApi, KeyValueStore, Prompter, ExitGuard)
// - Saves are compare-and-swap on lock_version; conflicts are surfaced, never merged
// - At most one save is in flight; an outstanding conflict blocks every save
// - Dirty detection hashes the semantic graph only (positions are excluded)
// - The active execution's TaskHandle is the only state persisted across restarts
// - Completed and Cancelled are distinct states that both read as "not running"

// Graph and document model
pub mod graph;
pub mod validate;

// Dirty tracking and saving
pub mod autosave;
pub mod save;
pub mod tracker;

// Execution lifecycle
pub mod execution;
pub mod history;

// Collaborator seams
pub mod kv;
pub mod prompt;
pub mod remote;

pub mod config;
pub mod error;
pub mod session;

// In-memory implementations for examples and testing
pub mod memory;

// Re-exports for convenience
pub use autosave::Autosaver;
pub use config::SyncConfig;
pub use error::{
    ExecutionError, HistoryError, ReconcileError, RemoteError, SaveError, SessionError,
    StoreError,
};
pub use execution::{
    ExecutionSignal, ExecutionState, ExecutionStateMachine, ExecutionStatus, NodeRunState,
    RunOutcome, StopOutcome, TaskHandle, ACTIVE_TASK_KEY,
};
pub use graph::{
    GraphEdge, GraphNode, LockVersion, NodeId, Position, WorkflowDocument, WorkflowGraph,
    WorkflowId, WorkflowRecord,
};
pub use history::{Reconciliation, TaskHistoryReconciler};
pub use kv::{FileKeyValueStore, KeyValueStore};
pub use prompt::{AutoConfirm, ConfirmPrompt, Prompter};
pub use remote::{
    CancelAck, ExecutionApi, HistoryPage, SavedWorkflow, TaskHistoryEntry, TaskId, TaskStatus,
    WorkflowApi,
};
pub use save::{
    ConflictResolution, LocalSubmission, ResolutionOutcome, SaveConflict, SaveController,
    SaveMode, SaveOutcome,
};
pub use session::{EditorSession, SessionContext};
pub use tracker::{compute_hash, ChangeHashTracker, ExitGuard, GraphHash, NoopExitGuard};
pub use validate::{
    GraphValidator, Severity, StructuralValidator, ValidationIssue, ValidationReport,
};
