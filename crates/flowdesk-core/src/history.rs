//! Execution history browsing and reconciliation
//!
//! [`TaskHistoryReconciler`] caches the most recently fetched history page
//! for the open workflow. On open, [`reconcile`](TaskHistoryReconciler::reconcile)
//! inspects the first page so an execution left running by a previous
//! process is reported as running instead of idle.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::error::{HistoryError, ReconcileError};
use crate::execution::ExecutionStateMachine;
use crate::graph::WorkflowId;
use crate::remote::{ExecutionApi, HistoryPage, TaskHistoryEntry, TaskId};

/// What reconciliation concluded about the open workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// An execution is in flight and is now tracked
    Running(TaskId),
    /// The held handle pointed at an execution that already finished
    Released(TaskId),
    /// Nothing in flight
    Idle,
}

#[derive(Debug, Default)]
struct HistoryState {
    workflow_id: Option<WorkflowId>,
    entries: Vec<TaskHistoryEntry>,
    total_count: u64,
    selected: Option<TaskHistoryEntry>,
}

/// Cached execution history for the open workflow
pub struct TaskHistoryReconciler {
    api: Arc<dyn ExecutionApi>,
    page_size: u32,
    state: Mutex<HistoryState>,
}

impl TaskHistoryReconciler {
    pub fn new(api: Arc<dyn ExecutionApi>, page_size: u32) -> Self {
        Self {
            api,
            page_size: page_size.max(1),
            state: Mutex::new(HistoryState::default()),
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Entries of the last successful fetch, most recent first
    pub fn entries(&self) -> Vec<TaskHistoryEntry> {
        self.state.lock().entries.clone()
    }

    pub fn total_count(&self) -> u64 {
        self.state.lock().total_count
    }

    pub fn selected(&self) -> Option<TaskHistoryEntry> {
        self.state.lock().selected.clone()
    }

    /// Fetch one page of history
    ///
    /// On failure the cached list keeps its previous value.
    #[instrument(skip(self))]
    pub async fn fetch_history(
        &self,
        workflow_id: WorkflowId,
        limit: u32,
        offset: u32,
    ) -> Result<HistoryPage, HistoryError> {
        let page = self
            .api
            .history(workflow_id, limit, offset)
            .await
            .inspect_err(|e| warn!(workflow_id = %workflow_id, error = %e, "history fetch failed, keeping previous list"))?;

        let mut state = self.state.lock();
        if state.workflow_id != Some(workflow_id) {
            state.selected = None;
        }
        state.workflow_id = Some(workflow_id);
        state.entries = page.tasks.clone();
        state.total_count = page.total_count;
        // Keep the selection pointed at the fresh snapshot of the same task
        let refreshed = state
            .selected
            .as_ref()
            .and_then(|s| page.tasks.iter().find(|e| e.id == s.id).cloned());
        if refreshed.is_some() {
            state.selected = refreshed;
        }
        debug!(
            entries = page.tasks.len(),
            total = page.total_count,
            "history fetched"
        );
        Ok(page)
    }

    /// Prime the state machine from the first history page
    ///
    /// The first in-flight entry (most recent first) becomes the tracked
    /// execution. Otherwise a handle held for this workflow is released,
    /// since history proves it is no longer running.
    #[instrument(skip(self, machine))]
    pub async fn reconcile(
        &self,
        workflow_id: WorkflowId,
        machine: &ExecutionStateMachine,
    ) -> Result<Reconciliation, ReconcileError> {
        let page = self.fetch_history(workflow_id, self.page_size, 0).await?;

        if let Some(entry) = page.tasks.iter().find(|e| e.status.is_in_flight()) {
            let handle = machine.adopt_in_flight(workflow_id, entry)?;
            return Ok(Reconciliation::Running(handle.task_id));
        }

        match machine.handle() {
            Some(handle) if handle.workflow_id == workflow_id => {
                let finished = page.tasks.iter().find(|e| e.id == handle.task_id);
                machine.release_finished(finished)?;
                info!(task_id = %handle.task_id, "tracked execution already finished");
                Ok(Reconciliation::Released(handle.task_id))
            }
            _ => Ok(Reconciliation::Idle),
        }
    }

    /// Select an entry for browsing (None clears the selection)
    pub fn select_entry(&self, entry: Option<&TaskHistoryEntry>) {
        self.state.lock().selected = entry.cloned();
    }

    /// Delete a history record remotely, then locally
    ///
    /// Nothing changes locally unless the remote delete succeeded.
    #[instrument(skip(self))]
    pub async fn delete_entry(&self, task_id: TaskId) -> Result<(), HistoryError> {
        self.api
            .delete_task(task_id)
            .await
            .inspect_err(|e| warn!(task_id = %task_id, error = %e, "deleting history entry failed"))?;

        let mut state = self.state.lock();
        let before = state.entries.len();
        state.entries.retain(|e| e.id != task_id);
        if state.entries.len() < before {
            state.total_count = state.total_count.saturating_sub(1);
        }
        if state.selected.as_ref().map(|e| e.id) == Some(task_id) {
            state.selected = None;
        }
        info!(task_id = %task_id, "history entry deleted");
        Ok(())
    }
}

impl std::fmt::Debug for TaskHistoryReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHistoryReconciler")
            .field("page_size", &self.page_size)
            .field("state", &*self.state.lock())
            .finish()
    }
}
