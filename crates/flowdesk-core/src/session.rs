// Editor session
//
// Wires one open workflow to its collaborators: the save controller, the
// execution state machine and the history reconciler. `open` is the single
// "workflow opened" entry point: load, set baseline, restore the durable
// handle, reconcile with history.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::error::SessionError;
use crate::execution::ExecutionStateMachine;
use crate::graph::{WorkflowDocument, WorkflowGraph, WorkflowId};
use crate::history::{Reconciliation, TaskHistoryReconciler};
use crate::kv::KeyValueStore;
use crate::prompt::Prompter;
use crate::remote::{ExecutionApi, WorkflowApi};
use crate::save::SaveController;
use crate::tracker::ExitGuard;
use crate::validate::GraphValidator;

/// External collaborators shared by every session
#[derive(Clone)]
pub struct SessionContext {
    pub workflows: Arc<dyn WorkflowApi>,
    pub executions: Arc<dyn ExecutionApi>,
    pub kv: Arc<dyn KeyValueStore>,
    pub validator: Arc<dyn GraphValidator>,
    pub prompter: Arc<dyn Prompter>,
    pub exit_guard: Arc<dyn ExitGuard>,
    pub config: SyncConfig,
}

/// One workflow open in the editor
pub struct EditorSession {
    save: Arc<SaveController>,
    execution: Arc<ExecutionStateMachine>,
    history: Arc<TaskHistoryReconciler>,
    reconciliation: Option<Reconciliation>,
}

impl EditorSession {
    /// Open a stored workflow
    ///
    /// Loading and restoring the handle must succeed. A history failure is
    /// logged and leaves the restored state in place.
    pub async fn open(ctx: &SessionContext, workflow_id: WorkflowId) -> Result<Self, SessionError> {
        let record = ctx.workflows.get_workflow(workflow_id).await?;
        info!(
            workflow_id = %workflow_id,
            lock_version = %record.lock_version,
            nodes = record.graph.node_count(),
            "opening workflow"
        );

        let mut session = Self::assemble(ctx, record.into());
        session.execution.restore(workflow_id)?;

        match session
            .history
            .reconcile(workflow_id, &session.execution)
            .await
        {
            Ok(reconciliation) => session.reconciliation = Some(reconciliation),
            Err(e) => warn!(workflow_id = %workflow_id, error = %e, "reconciliation failed"),
        }
        Ok(session)
    }

    /// Start a new, never-saved workflow
    pub fn draft(ctx: &SessionContext, name: impl Into<String>, graph: WorkflowGraph) -> Self {
        Self::assemble(ctx, WorkflowDocument::draft(name, graph))
    }

    fn assemble(ctx: &SessionContext, document: WorkflowDocument) -> Self {
        let save = Arc::new(SaveController::new(
            ctx.workflows.clone(),
            ctx.validator.clone(),
            ctx.prompter.clone(),
            ctx.exit_guard.clone(),
            document,
        ));
        let execution = Arc::new(ExecutionStateMachine::new(
            save.clone(),
            ctx.executions.clone(),
            ctx.kv.clone(),
            ctx.prompter.clone(),
            ctx.config.stop_settle_interval,
        ));
        let history = Arc::new(TaskHistoryReconciler::new(
            ctx.executions.clone(),
            ctx.config.history_page_size,
        ));
        Self {
            save,
            execution,
            history,
            reconciliation: None,
        }
    }

    pub fn save(&self) -> &Arc<SaveController> {
        &self.save
    }

    pub fn execution(&self) -> &Arc<ExecutionStateMachine> {
        &self.execution
    }

    pub fn history(&self) -> &Arc<TaskHistoryReconciler> {
        &self.history
    }

    /// Outcome of the reconciliation run on open (None if it failed or
    /// the session is a draft)
    pub fn reconciliation(&self) -> Option<Reconciliation> {
        self.reconciliation
    }
}

impl std::fmt::Debug for EditorSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EditorSession")
            .field("save", &self.save)
            .field("execution", &self.execution)
            .field("reconciliation", &self.reconciliation)
            .finish()
    }
}
