// In-memory implementations for examples and testing
//
// These implementations keep all data in memory and provide the same
// semantics as the HTTP-backed ones:
// - InMemoryWorkflowApi enforces lock_version compare-and-swap
// - InMemoryExecutionApi keeps per-workflow history, cancel is idempotent
// - InMemoryKeyValueStore stands in for the durable state file
//
// Every fake counts its calls so tests can assert that an operation did not
// touch the network, and can be told to fail its next call.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};

use crate::error::{RemoteError, StoreError};
use crate::graph::{LockVersion, WorkflowGraph, WorkflowId, WorkflowRecord};
use crate::kv::KeyValueStore;
use crate::prompt::{ConfirmPrompt, Prompter};
use crate::remote::{
    CancelAck, ExecutionApi, HistoryPage, SavedWorkflow, TaskHistoryEntry, TaskId, TaskStatus,
    WorkflowApi,
};
use crate::save::{ConflictResolution, SaveConflict};
use crate::tracker::ExitGuard;

// ============================================================================
// InMemoryWorkflowApi - versioned document store
// ============================================================================

/// In-memory workflow store with compare-and-swap writes
#[derive(Default)]
pub struct InMemoryWorkflowApi {
    workflows: RwLock<HashMap<WorkflowId, WorkflowRecord>>,
    failures: Mutex<HashMap<&'static str, VecDeque<RemoteError>>>,
    update_delay: Mutex<Option<Duration>>,
    get_calls: AtomicUsize,
    create_calls: AtomicUsize,
    update_calls: AtomicUsize,
    rename_calls: AtomicUsize,
}

impl InMemoryWorkflowApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a record as-is (useful for testing)
    pub fn seed(&self, record: WorkflowRecord) {
        self.workflows.write().insert(record.id, record);
    }

    /// Current stored record
    pub fn record(&self, id: WorkflowId) -> Option<WorkflowRecord> {
        self.workflows.read().get(&id).cloned()
    }

    /// Simulate another editor saving: mutate the graph and bump the version
    pub fn concurrent_edit(&self, id: WorkflowId, f: impl FnOnce(&mut WorkflowGraph)) {
        let mut workflows = self.workflows.write();
        if let Some(record) = workflows.get_mut(&id) {
            f(&mut record.graph);
            record.lock_version = record.lock_version.next();
        }
    }

    /// Make the next call to `op` ("get", "create", "update", "rename") fail
    pub fn fail_next(&self, op: &'static str, error: RemoteError) {
        self.failures.lock().entry(op).or_default().push_back(error);
    }

    /// Delay every update by `delay` (to hold a save in flight)
    pub fn set_update_delay(&self, delay: Duration) {
        *self.update_delay.lock() = Some(delay);
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    /// Total number of calls of any kind
    pub fn call_count(&self) -> usize {
        self.get_calls()
            + self.create_calls()
            + self.update_calls()
            + self.rename_calls.load(Ordering::SeqCst)
    }

    fn injected(&self, op: &'static str) -> Result<(), RemoteError> {
        match self.failures.lock().get_mut(op).and_then(|q| q.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl WorkflowApi for InMemoryWorkflowApi {
    async fn get_workflow(&self, id: WorkflowId) -> Result<WorkflowRecord, RemoteError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.injected("get")?;
        self.record(id)
            .ok_or_else(|| RemoteError::workflow_not_found(id))
    }

    async fn create_workflow(
        &self,
        name: &str,
        graph: &WorkflowGraph,
    ) -> Result<WorkflowRecord, RemoteError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.injected("create")?;
        let record = WorkflowRecord {
            id: WorkflowId::new(),
            name: name.to_string(),
            graph: graph.clone(),
            lock_version: LockVersion::INITIAL,
        };
        self.seed(record.clone());
        Ok(record)
    }

    async fn update_workflow(
        &self,
        id: WorkflowId,
        graph: &WorkflowGraph,
        lock_version: LockVersion,
    ) -> Result<SavedWorkflow, RemoteError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.update_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.injected("update")?;

        let mut workflows = self.workflows.write();
        let record = workflows
            .get_mut(&id)
            .ok_or_else(|| RemoteError::workflow_not_found(id))?;

        if record.lock_version != lock_version {
            return Err(RemoteError::VersionConflict {
                submitted: lock_version,
                current: Some(record.lock_version),
            });
        }

        record.graph = graph.clone();
        record.lock_version = record.lock_version.next();
        Ok(SavedWorkflow {
            graph: record.graph.clone(),
            lock_version: record.lock_version,
        })
    }

    async fn rename_workflow(&self, id: WorkflowId, name: &str) -> Result<(), RemoteError> {
        self.rename_calls.fetch_add(1, Ordering::SeqCst);
        self.injected("rename")?;
        let mut workflows = self.workflows.write();
        let record = workflows
            .get_mut(&id)
            .ok_or_else(|| RemoteError::workflow_not_found(id))?;
        record.name = name.to_string();
        Ok(())
    }
}

// ============================================================================
// InMemoryExecutionApi - execution service and history
// ============================================================================

struct TaskRecord {
    workflow_id: WorkflowId,
    entry: TaskHistoryEntry,
}

/// In-memory execution service
///
/// Started tasks stay `running` until a test moves them on with
/// [`finish`](Self::finish).
#[derive(Default)]
pub struct InMemoryExecutionApi {
    tasks: RwLock<HashMap<TaskId, TaskRecord>>,
    failures: Mutex<HashMap<&'static str, VecDeque<RemoteError>>>,
    execute_calls: AtomicUsize,
    cancel_calls: AtomicUsize,
    history_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

impl InMemoryExecutionApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a history entry for a workflow
    pub fn seed(&self, workflow_id: WorkflowId, entry: TaskHistoryEntry) {
        self.tasks
            .write()
            .insert(entry.id, TaskRecord { workflow_id, entry });
    }

    pub fn status(&self, task_id: TaskId) -> Option<TaskStatus> {
        self.tasks.read().get(&task_id).map(|t| t.entry.status)
    }

    /// Move a task to a terminal status
    pub fn finish(&self, task_id: TaskId, status: TaskStatus) {
        if let Some(task) = self.tasks.write().get_mut(&task_id) {
            task.entry.status = status;
            task.entry.completed_at = Some(Utc::now());
        }
    }

    /// Make the next call to `op` ("execute", "cancel", "history", "delete") fail
    pub fn fail_next(&self, op: &'static str, error: RemoteError) {
        self.failures.lock().entry(op).or_default().push_back(error);
    }

    pub fn execute_calls(&self) -> usize {
        self.execute_calls.load(Ordering::SeqCst)
    }

    pub fn cancel_calls(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }

    pub fn history_calls(&self) -> usize {
        self.history_calls.load(Ordering::SeqCst)
    }

    /// Total number of calls of any kind
    pub fn call_count(&self) -> usize {
        self.execute_calls()
            + self.cancel_calls()
            + self.history_calls()
            + self.delete_calls.load(Ordering::SeqCst)
    }

    fn injected(&self, op: &'static str) -> Result<(), RemoteError> {
        match self.failures.lock().get_mut(op).and_then(|q| q.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ExecutionApi for InMemoryExecutionApi {
    async fn execute(
        &self,
        workflow_id: WorkflowId,
        inputs: &serde_json::Value,
    ) -> Result<TaskId, RemoteError> {
        self.execute_calls.fetch_add(1, Ordering::SeqCst);
        self.injected("execute")?;
        let task_id = TaskId::new();
        let mut entry = TaskHistoryEntry::new(task_id, TaskStatus::Running, Utc::now());
        entry.input_data = Some(inputs.clone());
        entry.user_input = inputs
            .get("query")
            .or_else(|| inputs.get("input"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        self.seed(workflow_id, entry);
        Ok(task_id)
    }

    async fn cancel(&self, task_id: TaskId) -> Result<CancelAck, RemoteError> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        self.injected("cancel")?;
        let mut tasks = self.tasks.write();
        match tasks.get_mut(&task_id) {
            Some(task) if task.entry.status.is_in_flight() => {
                task.entry.status = TaskStatus::Cancelled;
                task.entry.completed_at = Some(Utc::now());
                Ok(CancelAck::Requested)
            }
            _ => Ok(CancelAck::AlreadyFinished),
        }
    }

    async fn history(
        &self,
        workflow_id: WorkflowId,
        limit: u32,
        offset: u32,
    ) -> Result<HistoryPage, RemoteError> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        self.injected("history")?;
        let tasks = self.tasks.read();
        let mut entries: Vec<&TaskHistoryEntry> = tasks
            .values()
            .filter(|t| t.workflow_id == workflow_id)
            .map(|t| &t.entry)
            .collect();
        // Most recent first; v7 ids break timestamp ties in creation order
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        Ok(HistoryPage {
            workflow_id,
            total_count: entries.len() as u64,
            limit,
            offset,
            tasks: entries
                .into_iter()
                .skip(offset as usize)
                .take(limit as usize)
                .cloned()
                .collect(),
        })
    }

    async fn delete_task(&self, task_id: TaskId) -> Result<(), RemoteError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.injected("delete")?;
        self.tasks
            .write()
            .remove(&task_id)
            .map(|_| ())
            .ok_or_else(|| RemoteError::NotFound(format!("task {task_id}")))
    }
}

// ============================================================================
// InMemoryKeyValueStore - durable store stand-in
// ============================================================================

/// In-memory key-value store
///
/// Share one instance (behind an `Arc`) between two sessions to simulate a
/// process restart.
#[derive(Debug, Default)]
pub struct InMemoryKeyValueStore {
    entries: RwLock<HashMap<String, String>>,
    fail_writes: AtomicBool,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `set` and `remove` fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KeyValueStore for InMemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".into()));
        }
        self.entries
            .write()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".into()));
        }
        self.entries.write().remove(key);
        Ok(())
    }
}

// ============================================================================
// ScriptedPrompter - canned user answers
// ============================================================================

/// Prompter answering from a script and recording what it was asked
pub struct ScriptedPrompter {
    answers: Mutex<VecDeque<bool>>,
    default_answer: bool,
    resolution: ConflictResolution,
    asked: Mutex<Vec<ConfirmPrompt>>,
}

impl ScriptedPrompter {
    /// Answer every confirmation with `answer`
    pub fn always(answer: bool) -> Self {
        Self {
            answers: Mutex::new(VecDeque::new()),
            default_answer: answer,
            resolution: ConflictResolution::Cancel,
            asked: Mutex::new(Vec::new()),
        }
    }

    /// Answer the next confirmations in order, then fall back to the default
    pub fn with_answers(self, answers: impl IntoIterator<Item = bool>) -> Self {
        self.answers.lock().extend(answers);
        self
    }

    pub fn with_resolution(mut self, resolution: ConflictResolution) -> Self {
        self.resolution = resolution;
        self
    }

    /// Prompts asked so far
    pub fn asked(&self) -> Vec<ConfirmPrompt> {
        self.asked.lock().clone()
    }
}

#[async_trait]
impl Prompter for ScriptedPrompter {
    async fn confirm(&self, prompt: &ConfirmPrompt) -> bool {
        self.asked.lock().push(prompt.clone());
        self.answers
            .lock()
            .pop_front()
            .unwrap_or(self.default_answer)
    }

    async fn choose_resolution(&self, _conflict: &SaveConflict) -> ConflictResolution {
        self.resolution
    }
}

// ============================================================================
// RecordingExitGuard - observes the confirm-before-exit hook
// ============================================================================

/// Exit guard that records engage/release calls
#[derive(Debug, Default)]
pub struct RecordingExitGuard {
    engaged: AtomicBool,
    engage_count: AtomicUsize,
}

impl RecordingExitGuard {
    pub fn is_engaged(&self) -> bool {
        self.engaged.load(Ordering::SeqCst)
    }

    pub fn engage_count(&self) -> usize {
        self.engage_count.load(Ordering::SeqCst)
    }
}

impl ExitGuard for RecordingExitGuard {
    fn engage(&self) {
        self.engaged.store(true, Ordering::SeqCst);
        self.engage_count.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        self.engaged.store(false, Ordering::SeqCst);
    }
}
