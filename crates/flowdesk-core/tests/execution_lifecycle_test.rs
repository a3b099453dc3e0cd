//! Integration tests for the execution lifecycle across restarts
//!
//! Run with: cargo test -p flowdesk-core --test execution_lifecycle_test

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use flowdesk_core::memory::{
    InMemoryExecutionApi, InMemoryKeyValueStore, InMemoryWorkflowApi, RecordingExitGuard,
    ScriptedPrompter,
};
use flowdesk_core::{
    EditorSession, ExecutionError, ExecutionSignal, ExecutionState, FileKeyValueStore, GraphNode,
    KeyValueStore,
    LockVersion, Reconciliation, RunOutcome, SessionContext, StopOutcome, StructuralValidator,
    SyncConfig, TaskHistoryEntry, TaskId, TaskStatus, WorkflowGraph, WorkflowId, WorkflowRecord,
    ACTIVE_TASK_KEY,
};

/// Everything that survives a process restart: the remote services and the
/// durable key-value store
struct World {
    workflows: Arc<InMemoryWorkflowApi>,
    executions: Arc<InMemoryExecutionApi>,
    kv: Arc<InMemoryKeyValueStore>,
}

impl World {
    fn new() -> Self {
        Self {
            workflows: Arc::new(InMemoryWorkflowApi::new()),
            executions: Arc::new(InMemoryExecutionApi::new()),
            kv: Arc::new(InMemoryKeyValueStore::new()),
        }
    }

    fn workflow(&self, graph: WorkflowGraph) -> WorkflowId {
        let record = WorkflowRecord {
            id: WorkflowId::new(),
            name: "pipeline".into(),
            graph,
            lock_version: LockVersion(1),
        };
        let id = record.id;
        self.workflows.seed(record);
        id
    }

    /// A fresh process: new prompter, new exit guard, same remote + disk
    fn context(&self, prompter: ScriptedPrompter) -> SessionContext {
        SessionContext {
            workflows: self.workflows.clone(),
            executions: self.executions.clone(),
            kv: self.kv.clone(),
            validator: Arc::new(StructuralValidator),
            prompter: Arc::new(prompter),
            exit_guard: Arc::new(RecordingExitGuard::default()),
            config: SyncConfig::default().with_stop_settle_interval(Duration::from_millis(100)),
        }
    }
}

fn pipeline() -> WorkflowGraph {
    WorkflowGraph::new()
        .with_node(GraphNode::new("fetch", "tool"))
        .with_node(GraphNode::new("summarize", "agent"))
        .with_edge("fetch", "summarize")
}

// ============================================================================
// Scenario: run survives a restart
// ============================================================================

#[tokio::test]
async fn test_running_execution_is_recovered_after_restart() {
    let world = World::new();
    let workflow_id = world.workflow(pipeline());

    // First process: open, run, then "crash" without stopping
    let task_id = {
        let session = EditorSession::open(&world.context(ScriptedPrompter::always(true)), workflow_id)
            .await
            .unwrap();
        assert_eq!(session.reconciliation(), Some(Reconciliation::Idle));

        let RunOutcome::Started(handle) = session.execution().run(json!({"query": "news"})).await.unwrap()
        else {
            panic!("run was declined");
        };
        assert!(world.kv.get(ACTIVE_TASK_KEY).unwrap().is_some());
        handle.task_id
    };

    // Second process: reopen without any user action
    let session = EditorSession::open(&world.context(ScriptedPrompter::always(true)), workflow_id)
        .await
        .unwrap();

    assert_eq!(session.reconciliation(), Some(Reconciliation::Running(task_id)));
    assert!(session.execution().is_running());
    assert_eq!(session.execution().state(), ExecutionState::Running);
    assert_eq!(session.execution().handle().map(|h| h.task_id), Some(task_id));
    assert_eq!(world.executions.execute_calls(), 1);
}

#[tokio::test]
async fn test_history_in_flight_entry_without_local_handle() {
    // A previous client crashed before persisting anything locally
    let world = World::new();
    let workflow_id = world.workflow(pipeline());
    let entry = TaskHistoryEntry::new(TaskId::new(), TaskStatus::Pending, Utc::now());
    let task_id = entry.id;
    world.executions.seed(workflow_id, entry);

    let session = EditorSession::open(&world.context(ScriptedPrompter::always(true)), workflow_id)
        .await
        .unwrap();

    assert!(session.execution().is_running());
    assert_eq!(session.reconciliation(), Some(Reconciliation::Running(task_id)));
    // The adopted handle is now durable too
    assert!(world.kv.get(ACTIVE_TASK_KEY).unwrap().is_some());
}

#[tokio::test]
async fn test_handle_for_finished_run_is_released_on_open() {
    let world = World::new();
    let workflow_id = world.workflow(pipeline());

    let task_id = {
        let session = EditorSession::open(&world.context(ScriptedPrompter::always(true)), workflow_id)
            .await
            .unwrap();
        match session.execution().run(json!({})).await.unwrap() {
            RunOutcome::Started(handle) => handle.task_id,
            RunOutcome::Declined => panic!("run was declined"),
        }
    };
    // Finishes while no editor is open
    world.executions.finish(task_id, TaskStatus::Completed);

    let session = EditorSession::open(&world.context(ScriptedPrompter::always(true)), workflow_id)
        .await
        .unwrap();

    assert_eq!(session.reconciliation(), Some(Reconciliation::Released(task_id)));
    assert_eq!(session.execution().state(), ExecutionState::Completed);
    assert!(!session.execution().is_running());
    assert!(world.kv.is_empty());
}

#[tokio::test]
async fn test_history_failure_on_open_keeps_restored_state() {
    let world = World::new();
    let workflow_id = world.workflow(pipeline());
    {
        let session = EditorSession::open(&world.context(ScriptedPrompter::always(true)), workflow_id)
            .await
            .unwrap();
        session.execution().run(json!({})).await.unwrap();
    }

    world
        .executions
        .fail_next("history", flowdesk_core::RemoteError::network("offline"));
    let session = EditorSession::open(&world.context(ScriptedPrompter::always(true)), workflow_id)
        .await
        .unwrap();

    assert_eq!(session.reconciliation(), None);
    assert!(session.execution().is_running());
    assert!(session.history().entries().is_empty());
}

// ============================================================================
// Run / stop preconditions
// ============================================================================

#[tokio::test]
async fn test_empty_graph_run_is_rejected_without_network() {
    let world = World::new();
    let ctx = world.context(ScriptedPrompter::always(true));
    let session = EditorSession::draft(&ctx, "empty", WorkflowGraph::new());

    let err = session.execution().run(json!({})).await.unwrap_err();

    assert!(matches!(err, ExecutionError::EmptyGraph));
    assert_eq!(world.workflows.call_count(), 0);
    assert_eq!(world.executions.call_count(), 0);
}

#[tokio::test]
async fn test_stop_without_handle_is_a_warning_without_network() {
    let world = World::new();
    let workflow_id = world.workflow(pipeline());
    let session = EditorSession::open(&world.context(ScriptedPrompter::always(true)), workflow_id)
        .await
        .unwrap();
    let calls = world.executions.call_count();

    let outcome = session.execution().stop().await.unwrap();

    assert_eq!(outcome, StopOutcome::NoActiveExecution);
    assert_eq!(world.executions.call_count(), calls);
}

#[tokio::test]
async fn test_run_on_draft_creates_document_first() {
    let world = World::new();
    let ctx = world.context(ScriptedPrompter::always(true));
    let session = EditorSession::draft(&ctx, "fresh", pipeline());

    let RunOutcome::Started(handle) = session.execution().run(json!({})).await.unwrap() else {
        panic!("run was declined");
    };

    assert_eq!(world.workflows.create_calls(), 1);
    assert_eq!(session.save().workflow_id(), Some(handle.workflow_id));
    assert!(world.workflows.record(handle.workflow_id).is_some());
    assert!(!session.save().is_dirty());
}

// ============================================================================
// Single installation-wide handle slot
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_run_in_other_workflow_must_resolve_existing_handle() {
    let world = World::new();
    let first = world.workflow(pipeline());
    let second = world.workflow(pipeline());

    let running = {
        let session = EditorSession::open(&world.context(ScriptedPrompter::always(true)), first)
            .await
            .unwrap();
        match session.execution().run(json!({})).await.unwrap() {
            RunOutcome::Started(handle) => handle,
            RunOutcome::Declined => panic!("run was declined"),
        }
    };

    // Opening another workflow: it reads idle, but the slot is taken
    let declining = EditorSession::open(&world.context(ScriptedPrompter::always(false)), second)
        .await
        .unwrap();
    assert!(!declining.execution().is_running());
    assert_eq!(declining.execution().handle(), Some(running));
    assert_eq!(
        declining.execution().run(json!({})).await.unwrap(),
        RunOutcome::Declined
    );
    assert_eq!(world.executions.status(running.task_id), Some(TaskStatus::Running));

    let confirming = EditorSession::open(&world.context(ScriptedPrompter::always(true)), second)
        .await
        .unwrap();
    let RunOutcome::Started(new_handle) = confirming.execution().run(json!({})).await.unwrap()
    else {
        panic!("run was declined");
    };

    assert_eq!(new_handle.workflow_id, second);
    assert_eq!(world.executions.status(running.task_id), Some(TaskStatus::Cancelled));
    let persisted: flowdesk_core::TaskHandle =
        serde_json::from_str(&world.kv.get(ACTIVE_TASK_KEY).unwrap().unwrap()).unwrap();
    assert_eq!(persisted, new_handle);
}

#[tokio::test]
async fn test_corrupt_state_file_does_not_block_open() {
    let world = World::new();
    let workflow_id = world.workflow(pipeline());
    let dir = tempfile::tempdir().unwrap();
    let kv = Arc::new(FileKeyValueStore::in_dir(dir.path()).unwrap());
    std::fs::write(kv.path(), "{\"active_task\": \"{\\\"workflow_id\\\": 1,").unwrap();

    let ctx = SessionContext {
        kv: kv.clone(),
        ..world.context(ScriptedPrompter::always(true))
    };
    let session = EditorSession::open(&ctx, workflow_id).await.unwrap();

    assert_eq!(session.execution().state(), ExecutionState::Idle);
    assert!(session.execution().handle().is_none());
    assert!(dir.path().join("state.json.corrupt").exists());

    // The store is usable again for the next run
    let RunOutcome::Started(handle) = session.execution().run(json!({})).await.unwrap() else {
        panic!("run was declined");
    };
    assert!(kv.get(ACTIVE_TASK_KEY).unwrap().is_some());
    assert_eq!(session.execution().handle(), Some(handle));
}

// ============================================================================
// Signals
// ============================================================================

#[tokio::test]
async fn test_completion_signal_releases_handle() {
    let world = World::new();
    let workflow_id = world.workflow(pipeline());
    let session = EditorSession::open(&world.context(ScriptedPrompter::always(true)), workflow_id)
        .await
        .unwrap();
    let RunOutcome::Started(handle) = session.execution().run(json!({})).await.unwrap() else {
        panic!("run was declined");
    };

    let applied = session
        .execution()
        .apply_signal(ExecutionSignal::Completed {
            task_id: handle.task_id,
            output: Some(json!({"summary": "ok"})),
        })
        .unwrap();

    assert!(applied);
    assert_eq!(session.execution().state(), ExecutionState::Completed);
    assert!(!session.execution().is_running());
    assert!(world.kv.is_empty());

    // Stop after completion has nothing to do
    assert_eq!(
        session.execution().stop().await.unwrap(),
        StopOutcome::NoActiveExecution
    );
}
