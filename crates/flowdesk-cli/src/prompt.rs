// Terminal prompts and the confirm-before-exit flag
//
// dialoguer prompts block on stdin, so they run on the blocking pool.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dialoguer::{Confirm, Select};
use flowdesk_core::{ConfirmPrompt, ConflictResolution, ExitGuard, Prompter, SaveConflict};
use tracing::warn;

/// Prompter that asks on the terminal
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompter;

#[async_trait]
impl Prompter for TerminalPrompter {
    async fn confirm(&self, prompt: &ConfirmPrompt) -> bool {
        let message = prompt.message();
        let answer = tokio::task::spawn_blocking(move || {
            Confirm::new()
                .with_prompt(message)
                .default(false)
                .interact()
        })
        .await;

        match answer {
            Ok(Ok(answer)) => answer,
            Ok(Err(e)) => {
                warn!(error = %e, "prompt failed, treating as no");
                false
            }
            Err(e) => {
                warn!(error = %e, "prompt task failed, treating as no");
                false
            }
        }
    }

    async fn choose_resolution(&self, conflict: &SaveConflict) -> ConflictResolution {
        let message = conflict.describe();
        let choices = [
            "Reload: discard my changes and load the current version",
            "Overwrite: replace the current version with my changes",
            "Cancel: keep my changes locally, change nothing",
        ];
        let answer = tokio::task::spawn_blocking(move || {
            Select::new()
                .with_prompt(message)
                .items(&choices)
                .default(2)
                .interact()
        })
        .await;

        match answer {
            Ok(Ok(0)) => ConflictResolution::Reload,
            Ok(Ok(1)) => ConflictResolution::Force,
            Ok(Ok(_)) => ConflictResolution::Cancel,
            Ok(Err(e)) => {
                warn!(error = %e, "prompt failed, keeping local changes");
                ConflictResolution::Cancel
            }
            Err(e) => {
                warn!(error = %e, "prompt task failed, keeping local changes");
                ConflictResolution::Cancel
            }
        }
    }
}

/// Exit guard backed by a flag the interrupt handler consults
#[derive(Debug, Default)]
pub struct TerminalExitGuard {
    engaged: AtomicBool,
}

impl TerminalExitGuard {
    /// Unsaved changes exist
    pub fn is_engaged(&self) -> bool {
        self.engaged.load(Ordering::SeqCst)
    }
}

impl ExitGuard for TerminalExitGuard {
    fn engage(&self) {
        self.engaged.store(true, Ordering::SeqCst);
    }

    fn release(&self) {
        self.engaged.store(false, Ordering::SeqCst);
    }
}
