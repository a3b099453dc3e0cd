//! Versioned saves with conflict detection and resolution
//!
//! The [`SaveController`] owns the editor's copy of the document and the
//! lock version it was last synchronized at. Every write is a
//! compare-and-swap against the remote store:
//!
//! ```text
//!  save() ──validate──► update_workflow(graph, v) ──ok──► adopt v' > v, reset baseline
//!                                   │
//!                                   └─conflict─► get_workflow() ─► SaveConflict (outstanding)
//!
//!  resolve_conflict(Reload) ─► adopt remote graph + version, clean
//!  resolve_conflict(Force)  ─► current_lock_version() ─► update_workflow(local, v_remote)
//!  resolve_conflict(Cancel) ─► keep local edits at old version, stay dirty
//! ```
//!
//! While a conflict is outstanding every save fails fast without touching
//! the network, and at most one write is in flight at any time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::error::{RemoteError, SaveError};
use crate::graph::{LockVersion, WorkflowDocument, WorkflowGraph, WorkflowId, WorkflowRecord};
use crate::prompt::{ConfirmPrompt, Prompter};
use crate::remote::WorkflowApi;
use crate::tracker::{ChangeHashTracker, ExitGuard, GraphHash};
use crate::validate::{GraphValidator, ValidationIssue};

/// How a save was triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveMode {
    /// User-initiated: warnings need confirmation
    Interactive,
    /// Autosave or pre-run persist: warnings are logged only
    Silent,
}

/// Successful (or deliberately abandoned) save
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Existing document updated
    Saved { lock_version: LockVersion },
    /// Document stored for the first time
    Created {
        id: WorkflowId,
        lock_version: LockVersion,
    },
    /// User declined to save past validation warnings
    Aborted,
}

/// The user's choice for an outstanding conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Discard local edits and adopt the remote document
    Reload,
    /// Overwrite the remote document with the local edits
    Force,
    /// Keep local edits, change nothing remotely
    Cancel,
}

/// Result of a successful conflict resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionOutcome {
    Reloaded { lock_version: LockVersion },
    Forced { lock_version: LockVersion },
    Cancelled,
}

/// The rejected local write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalSubmission {
    pub graph: WorkflowGraph,
    pub lock_version: LockVersion,
}

/// A rejected write paired with the authoritative remote document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveConflict {
    pub workflow_id: WorkflowId,
    pub local: LocalSubmission,
    pub remote: WorkflowDocument,
}

impl SaveConflict {
    pub fn describe(&self) -> String {
        format!(
            "Workflow {} was modified by another user. Your version: {}, current version: {}.",
            self.workflow_id, self.local.lock_version, self.remote.lock_version
        )
    }
}

struct SaveState {
    document: WorkflowDocument,
    tracker: ChangeHashTracker,
    conflict: Option<SaveConflict>,
}

/// Resets the in-flight flag when a save attempt ends, however it ends
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owns the local document and performs version-guarded writes
pub struct SaveController {
    api: Arc<dyn WorkflowApi>,
    validator: Arc<dyn GraphValidator>,
    prompter: Arc<dyn Prompter>,
    state: Mutex<SaveState>,
    in_flight: AtomicBool,
    edits: watch::Sender<u64>,
}

impl SaveController {
    pub fn new(
        api: Arc<dyn WorkflowApi>,
        validator: Arc<dyn GraphValidator>,
        prompter: Arc<dyn Prompter>,
        exit_guard: Arc<dyn ExitGuard>,
        document: WorkflowDocument,
    ) -> Self {
        let mut tracker = ChangeHashTracker::new(exit_guard);
        if document.has_identity() {
            tracker.set_baseline(&document.graph);
        } else {
            tracker.observe(&document.graph);
        }
        let (edits, _) = watch::channel(0);
        Self {
            api,
            validator,
            prompter,
            state: Mutex::new(SaveState {
                document,
                tracker,
                conflict: None,
            }),
            in_flight: AtomicBool::new(false),
            edits,
        }
    }

    // =========================================================================
    // Local document access
    // =========================================================================

    /// Snapshot of the local document
    pub fn document(&self) -> WorkflowDocument {
        self.state.lock().document.clone()
    }

    pub fn graph(&self) -> WorkflowGraph {
        self.state.lock().document.graph.clone()
    }

    pub fn workflow_id(&self) -> Option<WorkflowId> {
        self.state.lock().document.id
    }

    pub fn lock_version(&self) -> LockVersion {
        self.state.lock().document.lock_version
    }

    pub fn is_dirty(&self) -> bool {
        let state = self.state.lock();
        state.tracker.is_dirty(&state.document.graph)
    }

    pub fn baseline(&self) -> Option<GraphHash> {
        self.state.lock().tracker.baseline().cloned()
    }

    /// The conflict awaiting resolution, if any
    pub fn pending_conflict(&self) -> Option<SaveConflict> {
        self.state.lock().conflict.clone()
    }

    pub fn has_pending_conflict(&self) -> bool {
        self.state.lock().conflict.is_some()
    }

    pub fn is_saving(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Edit counter; changes on every local edit (drives autosave)
    pub fn subscribe_edits(&self) -> watch::Receiver<u64> {
        self.edits.subscribe()
    }

    /// Replace the local graph; returns the new dirty flag
    pub fn set_graph(&self, graph: WorkflowGraph) -> bool {
        self.edit(|g| *g = graph)
    }

    /// Apply an in-place edit; returns the new dirty flag
    pub fn edit(&self, f: impl FnOnce(&mut WorkflowGraph)) -> bool {
        let dirty = {
            let mut state = self.state.lock();
            let SaveState {
                document, tracker, ..
            } = &mut *state;
            f(&mut document.graph);
            tracker.observe(&document.graph)
        };
        self.edits.send_modify(|n| *n = n.wrapping_add(1));
        dirty
    }

    /// Replace the local document with a freshly loaded remote one
    pub fn load(&self, record: WorkflowRecord) {
        let mut state = self.state.lock();
        let document = WorkflowDocument::from(record);
        info!(
            workflow_id = ?document.id,
            lock_version = %document.lock_version,
            "workflow loaded"
        );
        state.conflict = None;
        state.tracker.set_baseline(&document.graph);
        state.tracker.set_conflict_outstanding(false, &document.graph);
        state.document = document;
    }

    /// Give a never-saved document the identity the store assigned to it
    ///
    /// Call [`mark_saved`](Self::mark_saved) afterwards when the current graph
    /// is known to be what was stored.
    pub fn assign_identity(&self, id: WorkflowId, lock_version: LockVersion) {
        let mut state = self.state.lock();
        state.document.id = Some(id);
        state.document.lock_version = lock_version;
    }

    /// Reset the dirty baseline to the current graph without a round-trip
    pub fn mark_saved(&self) {
        let mut state = self.state.lock();
        let SaveState {
            document, tracker, ..
        } = &mut *state;
        tracker.set_baseline(&document.graph);
    }

    // =========================================================================
    // Remote writes
    // =========================================================================

    /// Validate and write the local graph
    #[instrument(skip(self), fields(workflow_id = tracing::field::Empty))]
    pub async fn save(&self, mode: SaveMode) -> Result<SaveOutcome, SaveError> {
        if self.has_pending_conflict() {
            debug!("save blocked by outstanding conflict");
            return Err(SaveError::ConflictUnresolved);
        }
        let _in_flight = InFlight::acquire(&self.in_flight).ok_or_else(|| {
            debug!("save skipped, another save is in flight");
            SaveError::SaveInProgress
        })?;

        let submitted = self.document();
        if let Some(id) = submitted.id {
            tracing::Span::current().record("workflow_id", tracing::field::display(id));
        }

        let report = self.validator.validate(&submitted.graph);
        if report.has_errors() {
            warn!(issues = %report, "save blocked by validation errors");
            return Err(SaveError::Validation(report));
        }
        if report.has_warnings() {
            let warnings: Vec<ValidationIssue> = report.warnings().cloned().collect();
            match mode {
                SaveMode::Interactive => {
                    let proceed = self
                        .prompter
                        .confirm(&ConfirmPrompt::ProceedWithWarnings { warnings })
                        .await;
                    if !proceed {
                        info!("save aborted at validation warnings");
                        return Ok(SaveOutcome::Aborted);
                    }
                }
                SaveMode::Silent => {
                    warn!(issues = %report, "saving despite validation warnings");
                }
            }
        }

        match submitted.id {
            None => self.create(submitted).await,
            Some(id) => self.update(id, submitted.graph, submitted.lock_version).await,
        }
    }

    async fn create(&self, submitted: WorkflowDocument) -> Result<SaveOutcome, SaveError> {
        let record = self
            .api
            .create_workflow(&submitted.name, &submitted.graph)
            .await
            .inspect_err(|e| warn!(error = %e, "creating workflow failed"))?;

        let mut state = self.state.lock();
        let SaveState {
            document, tracker, ..
        } = &mut *state;
        document.id = Some(record.id);
        document.lock_version = record.lock_version;
        tracker.record_saved(&submitted.graph, &document.graph);
        info!(
            workflow_id = %record.id,
            lock_version = %record.lock_version,
            "workflow created"
        );
        Ok(SaveOutcome::Created {
            id: record.id,
            lock_version: record.lock_version,
        })
    }

    async fn update(
        &self,
        id: WorkflowId,
        graph: WorkflowGraph,
        lock_version: LockVersion,
    ) -> Result<SaveOutcome, SaveError> {
        match self.api.update_workflow(id, &graph, lock_version).await {
            Ok(saved) => {
                self.adopt_write(&graph, lock_version, saved.lock_version)?;
                Ok(SaveOutcome::Saved {
                    lock_version: saved.lock_version,
                })
            }
            Err(RemoteError::VersionConflict { current, .. }) => {
                warn!(
                    workflow_id = %id,
                    submitted = %lock_version,
                    current = ?current,
                    "save rejected: remote copy changed"
                );
                let conflict = self.open_conflict(id, graph, lock_version).await?;
                Err(SaveError::Conflict(Box::new(conflict)))
            }
            Err(e) => {
                warn!(workflow_id = %id, error = %e, "save failed, document left dirty");
                Err(e.into())
            }
        }
    }

    /// Adopt a version returned by an accepted write
    fn adopt_write(
        &self,
        submitted: &WorkflowGraph,
        submitted_version: LockVersion,
        new_version: LockVersion,
    ) -> Result<(), SaveError> {
        if new_version <= submitted_version {
            return Err(RemoteError::Protocol(format!(
                "store accepted lock_version {submitted_version} but returned {new_version}"
            ))
            .into());
        }
        let mut state = self.state.lock();
        let SaveState {
            document, tracker, ..
        } = &mut *state;
        document.lock_version = new_version;
        tracker.record_saved(submitted, &document.graph);
        info!(lock_version = %new_version, "workflow saved");
        Ok(())
    }

    /// Fetch the authoritative document and record the conflict
    async fn open_conflict(
        &self,
        id: WorkflowId,
        graph: WorkflowGraph,
        lock_version: LockVersion,
    ) -> Result<SaveConflict, SaveError> {
        let remote = self.api.get_workflow(id).await.inspect_err(|e| {
            warn!(workflow_id = %id, error = %e, "fetching remote copy after conflict failed");
        })?;
        let conflict = SaveConflict {
            workflow_id: id,
            local: LocalSubmission {
                graph,
                lock_version,
            },
            remote: remote.into(),
        };

        let mut state = self.state.lock();
        let SaveState {
            document,
            tracker,
            conflict: slot,
        } = &mut *state;
        *slot = Some(conflict.clone());
        tracker.set_conflict_outstanding(true, &document.graph);
        Ok(conflict)
    }

    /// Apply the user's choice to the outstanding conflict
    #[instrument(skip(self))]
    pub async fn resolve_conflict(
        &self,
        resolution: ConflictResolution,
    ) -> Result<ResolutionOutcome, SaveError> {
        let conflict = self.pending_conflict().ok_or(SaveError::NoConflict)?;

        match resolution {
            ConflictResolution::Reload => {
                let mut state = self.state.lock();
                let remote = conflict.remote;
                let lock_version = remote.lock_version;
                state.conflict = None;
                state.document.graph = remote.graph;
                state.document.name = remote.name;
                state.document.lock_version = lock_version;
                let SaveState {
                    document, tracker, ..
                } = &mut *state;
                tracker.set_baseline(&document.graph);
                tracker.set_conflict_outstanding(false, &document.graph);
                info!(lock_version = %lock_version, "conflict resolved by reloading remote copy");
                Ok(ResolutionOutcome::Reloaded { lock_version })
            }
            ConflictResolution::Cancel => {
                let mut state = self.state.lock();
                state.conflict = None;
                let SaveState {
                    document, tracker, ..
                } = &mut *state;
                tracker.set_conflict_outstanding(false, &document.graph);
                tracker.require_resubmit(&document.graph);
                info!(
                    lock_version = %document.lock_version,
                    "conflict resolution cancelled, local edits kept"
                );
                Ok(ResolutionOutcome::Cancelled)
            }
            ConflictResolution::Force => self.force(conflict.workflow_id).await,
        }
    }

    /// Last-writer-wins: overwrite the remote copy with the local graph
    async fn force(&self, id: WorkflowId) -> Result<ResolutionOutcome, SaveError> {
        let _in_flight = InFlight::acquire(&self.in_flight).ok_or(SaveError::SaveInProgress)?;

        let remote_version = self.api.current_lock_version(id).await?;
        let graph = self.graph();
        warn!(
            workflow_id = %id,
            lock_version = %remote_version,
            "forcing save, remote changes will be overwritten"
        );

        match self.api.update_workflow(id, &graph, remote_version).await {
            Ok(saved) => {
                self.adopt_write(&graph, remote_version, saved.lock_version)?;
                let mut state = self.state.lock();
                state.conflict = None;
                let SaveState {
                    document, tracker, ..
                } = &mut *state;
                tracker.set_conflict_outstanding(false, &document.graph);
                Ok(ResolutionOutcome::Forced {
                    lock_version: saved.lock_version,
                })
            }
            Err(RemoteError::VersionConflict { .. }) => {
                // Someone wrote between our version read and our write
                let conflict = self.open_conflict(id, graph, remote_version).await?;
                Err(SaveError::Conflict(Box::new(conflict)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Rename the stored workflow; does not touch the lock version
    pub async fn rename(&self, name: &str) -> Result<(), SaveError> {
        let id = self.workflow_id().ok_or(SaveError::NoIdentity)?;
        self.api.rename_workflow(id, name).await?;
        self.state.lock().document.name = name.to_string();
        info!(workflow_id = %id, name, "workflow renamed");
        Ok(())
    }
}

impl std::fmt::Debug for SaveController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SaveController")
            .field("workflow_id", &state.document.id)
            .field("lock_version", &state.document.lock_version)
            .field("tracker", &state.tracker)
            .field("conflict", &state.conflict.is_some())
            .finish()
    }
}
