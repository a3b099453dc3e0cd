// User confirmation seam
//
// Every decision that needs a human (proceed despite warnings, cancel the
// run that is already going, pick a conflict resolution) goes through this
// trait so the core can be driven by a terminal, a GUI shell, or a test script.

use async_trait::async_trait;

use crate::remote::TaskId;
use crate::save::{ConflictResolution, SaveConflict};
use crate::validate::ValidationIssue;

/// A yes/no question for the user
#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmPrompt {
    /// Validation produced non-fatal warnings; save anyway?
    ProceedWithWarnings { warnings: Vec<ValidationIssue> },

    /// An execution is already running; cancel it to start a new one?
    CancelActiveRun { task_id: TaskId },

    /// Unsaved changes exist; leave anyway?
    DiscardUnsavedChanges,
}

impl ConfirmPrompt {
    pub fn message(&self) -> String {
        match self {
            ConfirmPrompt::ProceedWithWarnings { warnings } => {
                let list: Vec<String> = warnings.iter().map(|w| w.to_string()).collect();
                format!(
                    "Workflow has {} warning(s):\n  {}\nSave anyway?",
                    warnings.len(),
                    list.join("\n  ")
                )
            }
            ConfirmPrompt::CancelActiveRun { task_id } => {
                format!("Execution {task_id} is still running. Cancel it and start a new run?")
            }
            ConfirmPrompt::DiscardUnsavedChanges => {
                "You have unsaved changes. Leave without saving?".to_string()
            }
        }
    }
}

#[async_trait]
pub trait Prompter: Send + Sync {
    async fn confirm(&self, prompt: &ConfirmPrompt) -> bool;

    async fn choose_resolution(&self, conflict: &SaveConflict) -> ConflictResolution;
}

/// Non-interactive prompter: confirms everything and cancels conflicts
///
/// Suitable for silent contexts where no human is available; choosing
/// `Cancel` keeps the local edits and leaves the remote copy untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoConfirm;

#[async_trait]
impl Prompter for AutoConfirm {
    async fn confirm(&self, _prompt: &ConfirmPrompt) -> bool {
        true
    }

    async fn choose_resolution(&self, _conflict: &SaveConflict) -> ConflictResolution {
        ConflictResolution::Cancel
    }
}
