//! Debounced autosave
//!
//! The [`Autosaver`] watches the save controller's edit counter. A burst of
//! edits inside the debounce window collapses into a single silent save once
//! the window passes without further edits. Nothing is written while a
//! conflict is outstanding or when the document is already clean. When the
//! window closes while another save is in flight, the autosave waits one more
//! window instead of being dropped.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::SaveError;
use crate::save::{SaveController, SaveMode, SaveOutcome};

/// Background task performing debounced silent saves
pub struct Autosaver {
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Autosaver {
    /// Start autosaving edits made through `save`
    pub fn spawn(save: Arc<SaveController>, debounce: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let edits = save.subscribe_edits();
        let handle = tokio::spawn(autosave_loop(save, edits, shutdown_rx, debounce));
        debug!(debounce_ms = debounce.as_millis() as u64, "autosave started");
        Self {
            shutdown_tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Stop the loop; a pending (not yet fired) save is dropped
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "autosave task ended abnormally");
            }
        }
        debug!("autosave stopped");
    }
}

impl Drop for Autosaver {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn autosave_loop(
    save: Arc<SaveController>,
    mut edits: watch::Receiver<u64>,
    mut shutdown_rx: watch::Receiver<bool>,
    debounce: Duration,
) {
    loop {
        // Wait for the first edit of a burst
        tokio::select! {
            changed = edits.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = shutdown_rx.changed() => break,
        }

        // A save already in flight defers this one by another window
        'burst: loop {
            // Restart the window on every further edit
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(debounce) => break,
                    changed = edits.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    _ = shutdown_rx.changed() => return,
                }
            }

            if save.has_pending_conflict() {
                debug!("autosave skipped, conflict outstanding");
                break 'burst;
            }
            if save.is_saving() {
                debug!("autosave deferred, another save is in flight");
                continue 'burst;
            }
            if !save.is_dirty() {
                debug!("autosave skipped, nothing to save");
                break 'burst;
            }

            match save.save(SaveMode::Silent).await {
                Ok(SaveOutcome::Saved { lock_version }) => {
                    debug!(lock_version = %lock_version, "autosaved");
                }
                Ok(SaveOutcome::Created { id, lock_version }) => {
                    info!(workflow_id = %id, lock_version = %lock_version, "autosave created workflow");
                }
                Ok(SaveOutcome::Aborted) => {}
                Err(SaveError::SaveInProgress) => {
                    debug!("autosave deferred, another save is in flight");
                    continue 'burst;
                }
                Err(SaveError::Conflict(conflict)) => {
                    warn!(conflict = %conflict.describe(), "autosave hit a conflict, waiting for resolution");
                }
                Err(e) => {
                    warn!(error = %e, "autosave failed");
                }
            }
            break 'burst;
        }
    }
    debug!("autosave loop exited");
}
