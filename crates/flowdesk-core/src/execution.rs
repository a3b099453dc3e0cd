//! Execution lifecycle
//!
//! The [`ExecutionStateMachine`] owns the run/stop lifecycle of the single
//! active execution and the durable [`TaskHandle`] that lets a restarted
//! process find it again.
//!
//! ```text
//!            run (non-empty graph, handle persisted)
//!   Idle ─────────────────────────────────────────────► Running
//!   Completed / Cancelled / Failed ──── run ──────────►   │
//!                                                         │ Completed signal ─► Completed
//!                                                         │ Failed signal ────► Failed
//!                                                         │ stop / Cancelled ─► Cancelled
//! ```
//!
//! The handle slot is per installation, not per workflow: at most one
//! execution is tracked as current across the whole application.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::{ExecutionError, SaveError, StoreError};
use crate::graph::{NodeId, WorkflowId};
use crate::kv::KeyValueStore;
use crate::prompt::{ConfirmPrompt, Prompter};
use crate::remote::{CancelAck, ExecutionApi, TaskHistoryEntry, TaskId, TaskStatus};
use crate::save::{SaveController, SaveMode, SaveOutcome};

/// Key under which the active task handle is persisted
pub const ACTIVE_TASK_KEY: &str = "flowdesk.active_task";

/// Durable reference to a remote execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHandle {
    pub task_id: TaskId,
    pub workflow_id: WorkflowId,
}

/// Observable lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    #[default]
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl ExecutionState {
    /// Only `Running` counts as running; every other state reads as idle
    pub fn is_running(self) -> bool {
        self == ExecutionState::Running
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Status shown by the editor
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionStatus {
    pub state: ExecutionState,
    pub current_node_label: Option<String>,
    /// Fraction in `0.0..=1.0`
    pub progress: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    /// Set once the execution reaches a terminal state
    pub duration: Option<chrono::Duration>,
    pub error_message: Option<String>,
}

impl ExecutionStatus {
    fn running(started_at: DateTime<Utc>) -> Self {
        Self {
            state: ExecutionState::Running,
            started_at: Some(started_at),
            ..Default::default()
        }
    }

    fn finish(&mut self, state: ExecutionState) {
        self.state = state;
        self.current_node_label = None;
        self.duration = self.started_at.map(|start| Utc::now() - start);
    }
}

/// Transient per-node annotation shown on the canvas during a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRunState {
    #[default]
    Idle,
    Running,
    Succeeded,
    Failed,
}

/// Out-of-band event emitted by the execution engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionSignal {
    NodeStarted { task_id: TaskId, node_id: NodeId },
    NodeFinished {
        task_id: TaskId,
        node_id: NodeId,
        success: bool,
    },
    Progress { task_id: TaskId, progress: f64 },
    Completed {
        task_id: TaskId,
        #[serde(default)]
        output: Option<serde_json::Value>,
    },
    Failed { task_id: TaskId, error: String },
    Cancelled { task_id: TaskId },
}

impl ExecutionSignal {
    pub fn task_id(&self) -> TaskId {
        match self {
            Self::NodeStarted { task_id, .. }
            | Self::NodeFinished { task_id, .. }
            | Self::Progress { task_id, .. }
            | Self::Completed { task_id, .. }
            | Self::Failed { task_id, .. }
            | Self::Cancelled { task_id } => *task_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::Cancelled { .. }
        )
    }

    /// Terminal signal equivalent to a finished history entry
    ///
    /// Lets a poller that only sees history snapshots drive the machine.
    pub fn from_history(entry: &TaskHistoryEntry) -> Option<Self> {
        let task_id = entry.id;
        match entry.status {
            TaskStatus::Pending | TaskStatus::Running => None,
            TaskStatus::Completed => Some(Self::Completed {
                task_id,
                output: entry.output_data.clone(),
            }),
            TaskStatus::Failed => Some(Self::Failed {
                task_id,
                error: entry
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "execution failed".to_string()),
            }),
            TaskStatus::Cancelled => Some(Self::Cancelled { task_id }),
        }
    }
}

/// Result of a run request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Started(TaskHandle),
    /// The user kept the already-running execution
    Declined,
}

/// Result of a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Local state cleared; `remote` is None when the cancel call failed
    Stopped {
        task_id: TaskId,
        remote: Option<CancelAck>,
    },
    /// Nothing to stop; no network call was made
    NoActiveExecution,
}

#[derive(Default)]
struct MachineState {
    handle: Option<TaskHandle>,
    status: ExecutionStatus,
    nodes: BTreeMap<NodeId, NodeRunState>,
}

impl MachineState {
    fn reset_nodes(&mut self) {
        for state in self.nodes.values_mut() {
            *state = NodeRunState::Idle;
        }
    }
}

/// Run/stop lifecycle of the current execution
pub struct ExecutionStateMachine {
    save: Arc<SaveController>,
    api: Arc<dyn ExecutionApi>,
    kv: Arc<dyn KeyValueStore>,
    prompter: Arc<dyn Prompter>,
    settle_interval: Duration,
    state: Mutex<MachineState>,
}

impl ExecutionStateMachine {
    pub fn new(
        save: Arc<SaveController>,
        api: Arc<dyn ExecutionApi>,
        kv: Arc<dyn KeyValueStore>,
        prompter: Arc<dyn Prompter>,
        settle_interval: Duration,
    ) -> Self {
        Self {
            save,
            api,
            kv,
            prompter,
            settle_interval,
            state: Mutex::new(MachineState::default()),
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        self.state.lock().status.clone()
    }

    pub fn state(&self) -> ExecutionState {
        self.state.lock().status.state
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    /// The task handle currently held, if any
    pub fn handle(&self) -> Option<TaskHandle> {
        self.state.lock().handle
    }

    pub fn node_states(&self) -> BTreeMap<NodeId, NodeRunState> {
        self.state.lock().nodes.clone()
    }

    pub fn node_state(&self, id: &NodeId) -> NodeRunState {
        self.state
            .lock()
            .nodes
            .get(id)
            .copied()
            .unwrap_or_default()
    }

    // =========================================================================
    // Durable handle
    // =========================================================================

    /// Load the persisted handle after a restart
    ///
    /// A handle for `workflow_id` puts the machine in `Running` until history
    /// says otherwise. A handle for another workflow still occupies the slot
    /// (a new run must resolve it first) but this workflow reads as idle.
    pub fn restore(&self, workflow_id: WorkflowId) -> Result<Option<TaskHandle>, ExecutionError> {
        let Some(raw) = self.kv.get(ACTIVE_TASK_KEY)? else {
            return Ok(None);
        };
        let handle: TaskHandle = match serde_json::from_str(&raw) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "discarding unreadable task handle");
                self.kv.remove(ACTIVE_TASK_KEY)?;
                return Ok(None);
            }
        };

        let mut state = self.state.lock();
        state.handle = Some(handle);
        if handle.workflow_id == workflow_id {
            state.status = ExecutionStatus {
                state: ExecutionState::Running,
                ..Default::default()
            };
            info!(task_id = %handle.task_id, "restored active execution");
        } else {
            debug!(
                task_id = %handle.task_id,
                owner = %handle.workflow_id,
                "active execution belongs to another workflow"
            );
        }
        Ok(Some(handle))
    }

    fn persist_handle(&self, handle: &TaskHandle) -> Result<(), StoreError> {
        let raw = serde_json::to_string(handle)?;
        self.kv.set(ACTIVE_TASK_KEY, &raw)
    }

    /// Adopt an execution found in flight by history reconciliation
    pub fn adopt_in_flight(
        &self,
        workflow_id: WorkflowId,
        entry: &TaskHistoryEntry,
    ) -> Result<TaskHandle, ExecutionError> {
        let handle = TaskHandle {
            task_id: entry.id,
            workflow_id,
        };
        let previous = self.handle();
        if previous != Some(handle) {
            if let Some(previous) = previous {
                warn!(
                    replaced = %previous.task_id,
                    task_id = %handle.task_id,
                    "replacing tracked execution with one found in history"
                );
            }
            self.persist_handle(&handle)?;
        }

        let mut state = self.state.lock();
        state.handle = Some(handle);
        state.status = ExecutionStatus::running(entry.created_at);
        info!(task_id = %handle.task_id, status = %entry.status, "execution in flight, adopted");
        Ok(handle)
    }

    /// Drop a held handle whose execution is no longer in flight
    ///
    /// `entry` is the task's history record when one was found; without it
    /// the machine returns to `Idle`.
    pub fn release_finished(&self, entry: Option<&TaskHistoryEntry>) -> Result<(), ExecutionError> {
        match entry.and_then(ExecutionSignal::from_history) {
            Some(signal) => {
                self.apply_signal(signal)?;
            }
            None => {
                let released = self.state.lock().handle.take();
                if let Some(handle) = released {
                    info!(task_id = %handle.task_id, "released stale task handle");
                    self.kv.remove(ACTIVE_TASK_KEY)?;
                }
                self.state.lock().status = ExecutionStatus::default();
            }
        }
        Ok(())
    }

    // =========================================================================
    // Run / stop
    // =========================================================================

    /// Save the graph and start a new execution
    #[instrument(skip(self, inputs))]
    pub async fn run(&self, inputs: serde_json::Value) -> Result<RunOutcome, ExecutionError> {
        let graph = self.save.graph();
        if graph.is_empty() {
            warn!("run rejected: workflow has no nodes");
            return Err(ExecutionError::EmptyGraph);
        }

        if let Some(active) = self.handle() {
            let confirmed = self
                .prompter
                .confirm(&ConfirmPrompt::CancelActiveRun {
                    task_id: active.task_id,
                })
                .await;
            if !confirmed {
                info!(task_id = %active.task_id, "run declined, keeping active execution");
                return Ok(RunOutcome::Declined);
            }
            self.stop().await?;
            tokio::time::sleep(self.settle_interval).await;
        }

        match self.save.save(SaveMode::Silent).await? {
            SaveOutcome::Aborted => return Ok(RunOutcome::Declined),
            SaveOutcome::Saved { .. } | SaveOutcome::Created { .. } => {}
        }
        let workflow_id = self.save.workflow_id().ok_or(SaveError::NoIdentity)?;

        let task_id = self
            .api
            .execute(workflow_id, &inputs)
            .await
            .inspect_err(|e| warn!(workflow_id = %workflow_id, error = %e, "starting execution failed"))?;
        let handle = TaskHandle {
            task_id,
            workflow_id,
        };

        if let Err(e) = self.persist_handle(&handle) {
            warn!(task_id = %task_id, error = %e, "persisting task handle failed, cancelling run");
            if let Err(cancel_err) = self.api.cancel(task_id).await {
                warn!(task_id = %task_id, error = %cancel_err, "cancelling unrecorded run failed");
            }
            return Err(e.into());
        }

        let mut state = self.state.lock();
        state.handle = Some(handle);
        state.status = ExecutionStatus::running(Utc::now());
        state.nodes = graph
            .node_ids()
            .map(|id| (id.clone(), NodeRunState::Idle))
            .collect();
        info!(workflow_id = %workflow_id, task_id = %task_id, "execution started");
        Ok(RunOutcome::Started(handle))
    }

    /// Cancel the held execution and clear local state
    ///
    /// Local state is cleared whatever the cancel call returns. A handle
    /// that cannot be removed from the store is left for reconciliation to
    /// release on the next open.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<StopOutcome, ExecutionError> {
        let Some(handle) = self.handle() else {
            warn!("stop requested but no execution is active");
            return Ok(StopOutcome::NoActiveExecution);
        };

        let remote = match self.api.cancel(handle.task_id).await {
            Ok(ack) => {
                debug!(task_id = %handle.task_id, ack = ?ack, "cancel acknowledged");
                Some(ack)
            }
            Err(e) => {
                warn!(task_id = %handle.task_id, error = %e, "cancel request failed, clearing anyway");
                None
            }
        };

        let owned = self.save.workflow_id() == Some(handle.workflow_id);
        {
            let mut state = self.state.lock();
            state.handle = None;
            if owned {
                state.status.finish(ExecutionState::Cancelled);
                state.status.progress = None;
                state.reset_nodes();
            }
        }
        self.release_stored_handle(handle.task_id);
        info!(task_id = %handle.task_id, "execution stopped");

        Ok(StopOutcome::Stopped {
            task_id: handle.task_id,
            remote,
        })
    }

    fn release_stored_handle(&self, task_id: TaskId) {
        if let Err(e) = self.kv.remove(ACTIVE_TASK_KEY) {
            warn!(task_id = %task_id, error = %e, "failed to remove stored task handle");
        }
    }

    // =========================================================================
    // Engine signals
    // =========================================================================

    /// Apply an engine event; returns false when it was for another task
    pub fn apply_signal(&self, signal: ExecutionSignal) -> Result<bool, ExecutionError> {
        let label = match &signal {
            ExecutionSignal::NodeStarted { node_id, .. } => Some(
                self.save
                    .graph()
                    .node(node_id)
                    .map(|n| n.label())
                    .unwrap_or_else(|| node_id.to_string()),
            ),
            _ => None,
        };

        let task_id = signal.task_id();
        let terminal = signal.is_terminal();
        let current = self.save.workflow_id();
        {
            let mut state = self.state.lock();
            let Some(handle) = state.handle.filter(|h| h.task_id == task_id) else {
                debug!(task_id = %task_id, "ignoring signal for untracked task");
                return Ok(false);
            };

            // Another workflow's run only holds the slot
            if current != Some(handle.workflow_id) {
                if !terminal {
                    debug!(task_id = %task_id, owner = %handle.workflow_id, "ignoring progress of another workflow's run");
                    return Ok(false);
                }
                state.handle = None;
                drop(state);
                info!(task_id = %task_id, owner = %handle.workflow_id, "another workflow's run finished, slot released");
                self.kv.remove(ACTIVE_TASK_KEY)?;
                return Ok(true);
            }

            match signal {
                ExecutionSignal::NodeStarted { node_id, .. } => {
                    state.nodes.insert(node_id, NodeRunState::Running);
                    state.status.current_node_label = label;
                }
                ExecutionSignal::NodeFinished {
                    node_id, success, ..
                } => {
                    let run_state = if success {
                        NodeRunState::Succeeded
                    } else {
                        NodeRunState::Failed
                    };
                    state.nodes.insert(node_id, run_state);
                }
                ExecutionSignal::Progress { progress, .. } => {
                    state.status.progress = Some(progress.clamp(0.0, 1.0));
                }
                ExecutionSignal::Completed { .. } => {
                    state.status.finish(ExecutionState::Completed);
                    state.status.progress = Some(1.0);
                    info!(task_id = %task_id, "execution completed");
                }
                ExecutionSignal::Failed { error, .. } => {
                    state.status.finish(ExecutionState::Failed);
                    warn!(task_id = %task_id, error = %error, "execution failed");
                    state.status.error_message = Some(error);
                }
                ExecutionSignal::Cancelled { .. } => {
                    state.status.finish(ExecutionState::Cancelled);
                    info!(task_id = %task_id, "execution cancelled remotely");
                }
            }
            if terminal {
                state.handle = None;
            }
        }

        if terminal {
            self.kv.remove(ACTIVE_TASK_KEY)?;
        }
        Ok(true)
    }
}

impl std::fmt::Debug for ExecutionStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ExecutionStateMachine")
            .field("handle", &state.handle)
            .field("state", &state.status.state)
            .field("settle_interval", &self.settle_interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphNode, LockVersion, WorkflowGraph, WorkflowRecord};
    use crate::memory::{
        InMemoryExecutionApi, InMemoryKeyValueStore, InMemoryWorkflowApi, ScriptedPrompter,
    };
    use crate::tracker::NoopExitGuard;
    use crate::validate::StructuralValidator;
    use serde_json::json;

    struct Fixture {
        workflows: Arc<InMemoryWorkflowApi>,
        executions: Arc<InMemoryExecutionApi>,
        kv: Arc<InMemoryKeyValueStore>,
        prompter: Arc<ScriptedPrompter>,
        machine: ExecutionStateMachine,
        workflow_id: WorkflowId,
    }

    fn fixture(graph: WorkflowGraph, prompter: ScriptedPrompter) -> Fixture {
        let workflows = Arc::new(InMemoryWorkflowApi::new());
        let executions = Arc::new(InMemoryExecutionApi::new());
        let kv = Arc::new(InMemoryKeyValueStore::new());
        let prompter = Arc::new(prompter);

        let record = WorkflowRecord {
            id: WorkflowId::new(),
            name: "wf".into(),
            graph,
            lock_version: LockVersion(1),
        };
        workflows.seed(record.clone());
        let workflow_id = record.id;

        let save = Arc::new(SaveController::new(
            workflows.clone(),
            Arc::new(StructuralValidator),
            prompter.clone(),
            Arc::new(NoopExitGuard),
            record.into(),
        ));
        let machine = ExecutionStateMachine::new(
            save,
            executions.clone(),
            kv.clone(),
            prompter.clone(),
            Duration::from_millis(500),
        );
        Fixture {
            workflows,
            executions,
            kv,
            prompter,
            machine,
            workflow_id,
        }
    }

    fn two_nodes() -> WorkflowGraph {
        WorkflowGraph::new()
            .with_node(GraphNode::new("a", "agent").with_config(json!({"label": "Research"})))
            .with_node(GraphNode::new("b", "tool"))
            .with_edge("a", "b")
    }

    fn started(outcome: RunOutcome) -> TaskHandle {
        match outcome {
            RunOutcome::Started(handle) => handle,
            other => panic!("expected started run, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_saves_then_persists_handle() {
        let f = fixture(two_nodes(), ScriptedPrompter::always(true));

        let handle = started(f.machine.run(json!({"query": "go"})).await.unwrap());

        assert_eq!(handle.workflow_id, f.workflow_id);
        assert_eq!(f.workflows.update_calls(), 1);
        assert_eq!(f.executions.execute_calls(), 1);
        assert!(f.machine.is_running());
        assert!(f.machine.status().started_at.is_some());

        let raw = f.kv.get(ACTIVE_TASK_KEY).unwrap().unwrap();
        let persisted: TaskHandle = serde_json::from_str(&raw).unwrap();
        assert_eq!(persisted, handle);
    }

    #[tokio::test]
    async fn test_run_empty_graph_makes_no_calls() {
        let f = fixture(WorkflowGraph::new(), ScriptedPrompter::always(true));

        let err = f.machine.run(json!({})).await.unwrap_err();

        assert!(matches!(err, ExecutionError::EmptyGraph));
        assert_eq!(f.workflows.call_count(), 0);
        assert_eq!(f.executions.call_count(), 0);
        assert_eq!(f.machine.state(), ExecutionState::Idle);
    }

    #[tokio::test]
    async fn test_stop_without_handle_makes_no_calls() {
        let f = fixture(two_nodes(), ScriptedPrompter::always(true));

        let outcome = f.machine.stop().await.unwrap();

        assert_eq!(outcome, StopOutcome::NoActiveExecution);
        assert_eq!(f.executions.call_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_clears_state_even_when_cancel_fails() {
        let f = fixture(two_nodes(), ScriptedPrompter::always(true));
        let handle = started(f.machine.run(json!({})).await.unwrap());
        f.machine
            .apply_signal(ExecutionSignal::NodeStarted {
                task_id: handle.task_id,
                node_id: "a".into(),
            })
            .unwrap();
        f.executions
            .fail_next("cancel", crate::error::RemoteError::network("connection reset"));

        let outcome = f.machine.stop().await.unwrap();

        assert_eq!(
            outcome,
            StopOutcome::Stopped {
                task_id: handle.task_id,
                remote: None
            }
        );
        assert_eq!(f.machine.state(), ExecutionState::Cancelled);
        assert!(!f.machine.is_running());
        assert!(f.machine.handle().is_none());
        assert!(f.kv.is_empty());
        assert_eq!(f.machine.node_state(&"a".into()), NodeRunState::Idle);
    }

    #[tokio::test]
    async fn test_handle_persist_failure_cancels_started_task() {
        let f = fixture(two_nodes(), ScriptedPrompter::always(true));
        f.kv.set_fail_writes(true);

        let err = f.machine.run(json!({})).await.unwrap_err();

        assert!(matches!(err, ExecutionError::Store(_)));
        assert_eq!(f.executions.cancel_calls(), 1);
        assert!(f.machine.handle().is_none());
        assert_eq!(f.machine.state(), ExecutionState::Idle);
    }

    #[tokio::test]
    async fn test_execute_failure_leaves_state_untouched() {
        let f = fixture(two_nodes(), ScriptedPrompter::always(true));
        f.executions
            .fail_next("execute", crate::error::RemoteError::server(500, "boom"));

        let err = f.machine.run(json!({})).await.unwrap_err();

        assert!(matches!(err, ExecutionError::Remote(_)));
        assert!(f.kv.is_empty());
        assert_eq!(f.machine.state(), ExecutionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rerun_cancels_active_after_confirmation() {
        let f = fixture(two_nodes(), ScriptedPrompter::always(true));
        let first = started(f.machine.run(json!({})).await.unwrap());

        let before = tokio::time::Instant::now();
        let second = started(f.machine.run(json!({})).await.unwrap());

        assert!(before.elapsed() >= Duration::from_millis(500));
        assert_ne!(first.task_id, second.task_id);
        assert_eq!(f.executions.status(first.task_id), Some(TaskStatus::Cancelled));
        assert_eq!(f.machine.handle(), Some(second));
        assert_eq!(
            f.prompter.asked(),
            vec![ConfirmPrompt::CancelActiveRun {
                task_id: first.task_id
            }]
        );
    }

    #[tokio::test]
    async fn test_rerun_declined_keeps_active() {
        let f = fixture(two_nodes(), ScriptedPrompter::always(false));
        let first = started(f.machine.run(json!({})).await.unwrap());

        let outcome = f.machine.run(json!({})).await.unwrap();

        assert_eq!(outcome, RunOutcome::Declined);
        assert_eq!(f.executions.execute_calls(), 1);
        assert_eq!(f.executions.cancel_calls(), 0);
        assert_eq!(f.machine.handle(), Some(first));
    }

    #[tokio::test]
    async fn test_signals_drive_annotations_and_terminal_states() {
        let f = fixture(two_nodes(), ScriptedPrompter::always(true));
        let handle = started(f.machine.run(json!({})).await.unwrap());
        let task_id = handle.task_id;

        f.machine
            .apply_signal(ExecutionSignal::NodeStarted {
                task_id,
                node_id: "a".into(),
            })
            .unwrap();
        assert_eq!(
            f.machine.status().current_node_label.as_deref(),
            Some("Research")
        );
        assert_eq!(f.machine.node_state(&"a".into()), NodeRunState::Running);

        f.machine
            .apply_signal(ExecutionSignal::NodeFinished {
                task_id,
                node_id: "a".into(),
                success: true,
            })
            .unwrap();
        f.machine
            .apply_signal(ExecutionSignal::Progress {
                task_id,
                progress: 1.7,
            })
            .unwrap();
        assert_eq!(f.machine.status().progress, Some(1.0));

        let ignored = f
            .machine
            .apply_signal(ExecutionSignal::Failed {
                task_id: TaskId::new(),
                error: "other".into(),
            })
            .unwrap();
        assert!(!ignored);
        assert!(f.machine.is_running());

        f.machine
            .apply_signal(ExecutionSignal::Failed {
                task_id,
                error: "tool crashed".into(),
            })
            .unwrap();
        let status = f.machine.status();
        assert_eq!(status.state, ExecutionState::Failed);
        assert_eq!(status.error_message.as_deref(), Some("tool crashed"));
        assert!(status.duration.is_some());
        assert!(f.machine.handle().is_none());
        assert!(f.kv.is_empty());
        assert_eq!(f.machine.node_state(&"a".into()), NodeRunState::Succeeded);
    }

    #[tokio::test]
    async fn test_restore_foreign_handle_occupies_slot_but_reads_idle() {
        let f = fixture(two_nodes(), ScriptedPrompter::always(true));
        let foreign = TaskHandle {
            task_id: TaskId::new(),
            workflow_id: WorkflowId::new(),
        };
        f.kv
            .set(ACTIVE_TASK_KEY, &serde_json::to_string(&foreign).unwrap())
            .unwrap();

        let restored = f.machine.restore(f.workflow_id).unwrap();

        assert_eq!(restored, Some(foreign));
        assert_eq!(f.machine.handle(), Some(foreign));
        assert!(!f.machine.is_running());
    }

    #[tokio::test]
    async fn test_signals_for_another_workflows_run_only_release_the_slot() {
        let f = fixture(two_nodes(), ScriptedPrompter::always(true));
        let foreign = TaskHandle {
            task_id: TaskId::new(),
            workflow_id: WorkflowId::new(),
        };
        f.kv
            .set(ACTIVE_TASK_KEY, &serde_json::to_string(&foreign).unwrap())
            .unwrap();
        f.machine.restore(f.workflow_id).unwrap();

        let progressed = f
            .machine
            .apply_signal(ExecutionSignal::NodeStarted {
                task_id: foreign.task_id,
                node_id: "a".into(),
            })
            .unwrap();
        assert!(!progressed);
        assert_eq!(f.machine.node_state(&"a".into()), NodeRunState::Idle);

        let released = f
            .machine
            .apply_signal(ExecutionSignal::Failed {
                task_id: foreign.task_id,
                error: "worker crashed".into(),
            })
            .unwrap();

        assert!(released);
        assert!(f.machine.handle().is_none());
        assert!(f.kv.is_empty());
        let status = f.machine.status();
        assert_eq!(status.state, ExecutionState::Idle);
        assert_eq!(status.error_message, None);
    }

    #[tokio::test]
    async fn test_stop_reports_stopped_when_handle_removal_fails() {
        let f = fixture(two_nodes(), ScriptedPrompter::always(true));
        let handle = started(f.machine.run(json!({})).await.unwrap());
        f.kv.set_fail_writes(true);

        let outcome = f.machine.stop().await.unwrap();

        assert!(matches!(
            outcome,
            StopOutcome::Stopped { task_id, remote: Some(_) } if task_id == handle.task_id
        ));
        assert!(f.machine.handle().is_none());
        assert_eq!(f.machine.state(), ExecutionState::Cancelled);
        // The stale copy stays on disk until the next open reconciles it
        assert_eq!(f.kv.len(), 1);
    }

    #[tokio::test]
    async fn test_restore_discards_corrupt_handle() {
        let f = fixture(two_nodes(), ScriptedPrompter::always(true));
        f.kv.set(ACTIVE_TASK_KEY, "not json").unwrap();

        assert_eq!(f.machine.restore(f.workflow_id).unwrap(), None);
        assert!(f.kv.is_empty());
    }
}
