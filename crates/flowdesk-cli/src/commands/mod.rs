// Command implementations
//
// Every command builds a SessionContext from the same pieces: the HTTP
// client (both remote traits), the file-backed state store, and either the
// terminal prompter or AutoConfirm when --yes is given.

pub mod execution;
pub mod history;
pub mod workflows;

use std::sync::Arc;

use anyhow::{Context, Result};
use flowdesk_core::{
    AutoConfirm, ExitGuard, FileKeyValueStore, NoopExitGuard, Prompter, SessionContext,
    StructuralValidator, SyncConfig,
};

use crate::client::Client;
use crate::output::OutputFormat;
use crate::prompt::TerminalPrompter;

/// Shared state for one CLI invocation
pub struct App {
    pub client: Arc<Client>,
    pub kv: Arc<FileKeyValueStore>,
    pub config: SyncConfig,
    pub output: OutputFormat,
    pub quiet: bool,
    pub assume_yes: bool,
}

impl App {
    pub fn new(config: SyncConfig, output: OutputFormat, quiet: bool, assume_yes: bool) -> Result<Self> {
        let kv = FileKeyValueStore::in_dir(&config.state_dir).with_context(|| {
            format!(
                "Failed to open state directory: {}",
                config.state_dir.display()
            )
        })?;
        Ok(Self {
            client: Arc::new(Client::new(&config.api_url)),
            kv: Arc::new(kv),
            config,
            output,
            quiet,
            assume_yes,
        })
    }

    pub fn prompter(&self) -> Arc<dyn Prompter> {
        if self.assume_yes {
            Arc::new(AutoConfirm)
        } else {
            Arc::new(TerminalPrompter)
        }
    }

    pub fn context(&self) -> SessionContext {
        self.context_with_guard(Arc::new(NoopExitGuard))
    }

    pub fn context_with_guard(&self, exit_guard: Arc<dyn ExitGuard>) -> SessionContext {
        SessionContext {
            workflows: self.client.clone(),
            executions: self.client.clone(),
            kv: self.kv.clone(),
            validator: Arc::new(StructuralValidator),
            prompter: self.prompter(),
            exit_guard,
            config: self.config.clone(),
        }
    }

    /// Print for text mode unless --quiet
    pub fn say(&self, message: impl AsRef<str>) {
        if self.output.is_text() && !self.quiet {
            println!("{}", message.as_ref());
        }
    }
}
