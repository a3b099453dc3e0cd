//! Change tracking for the editor's local graph
//!
//! The tracker fingerprints the *semantic* graph (node ids, node types,
//! node configuration and edges) and compares it with the fingerprint taken
//! at the last successful save. Canvas positions and rendering hints are not
//! part of the fingerprint, so moving a node never marks the document dirty.
//!
//! Whenever the document becomes dirty the injected [`ExitGuard`] is engaged
//! so the shell asks before closing; it is released once the document is
//! clean again.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::graph::WorkflowGraph;

/// Canonical fingerprint of a workflow graph (hex-encoded SHA-256)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GraphHash(String);

impl GraphHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GraphHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Confirm-before-exit hook provided by the shell
pub trait ExitGuard: Send + Sync {
    /// Unsaved changes exist: closing must be confirmed
    fn engage(&self);

    /// No unsaved changes: closing may proceed freely
    fn release(&self);
}

/// Exit guard that does nothing (headless usage)
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopExitGuard;

impl ExitGuard for NoopExitGuard {
    fn engage(&self) {}
    fn release(&self) {}
}

/// Compute the canonical hash of a graph
///
/// Pure function of node identity, type, configuration and the set of edges.
/// Object keys are sorted and edges are ordered, so two graphs that differ
/// only in serialization order or layout hash identically.
pub fn compute_hash(graph: &WorkflowGraph) -> GraphHash {
    let mut hasher = Sha256::new();

    hasher.update(b"nodes[");
    for node in graph.nodes() {
        hasher.update(b"{id:");
        write_str(&mut hasher, node.id.as_str());
        hasher.update(b",type:");
        write_str(&mut hasher, &node.node_type);
        hasher.update(b",config:");
        write_canonical(&mut hasher, &node.config);
        hasher.update(b"}");
    }

    let mut edges: Vec<(&str, &str)> = graph
        .edges()
        .iter()
        .map(|e| (e.source.as_str(), e.target.as_str()))
        .collect();
    edges.sort_unstable();

    hasher.update(b"]edges[");
    for (source, target) in edges {
        write_str(&mut hasher, source);
        hasher.update(b"->");
        write_str(&mut hasher, target);
        hasher.update(b";");
    }
    hasher.update(b"]");

    GraphHash(hex::encode(hasher.finalize()))
}

fn write_str(hasher: &mut Sha256, s: &str) {
    // Length prefix keeps "ab"+"c" distinct from "a"+"bc"
    hasher.update((s.len() as u64).to_le_bytes());
    hasher.update(s.as_bytes());
}

fn write_canonical(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => hasher.update(b"n"),
        Value::Bool(b) => hasher.update(if *b { b"t" } else { b"f" }),
        Value::Number(n) => {
            hasher.update(b"#");
            write_str(hasher, &n.to_string());
        }
        Value::String(s) => {
            hasher.update(b"s");
            write_str(hasher, s);
        }
        Value::Array(items) => {
            hasher.update(b"[");
            for item in items {
                write_canonical(hasher, item);
            }
            hasher.update(b"]");
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            hasher.update(b"{");
            for key in keys {
                write_str(hasher, key);
                write_canonical(hasher, &map[key]);
            }
            hasher.update(b"}");
        }
    }
}

/// Tracks whether the local graph differs from its last persisted form
pub struct ChangeHashTracker {
    baseline: Option<GraphHash>,
    conflict_outstanding: bool,
    resubmit_required: bool,
    dirty: bool,
    guard: Arc<dyn ExitGuard>,
}

impl ChangeHashTracker {
    pub fn new(guard: Arc<dyn ExitGuard>) -> Self {
        Self {
            baseline: None,
            conflict_outstanding: false,
            resubmit_required: false,
            dirty: false,
            guard,
        }
    }

    pub fn compute_hash(graph: &WorkflowGraph) -> GraphHash {
        compute_hash(graph)
    }

    /// Hash recorded at the last successful save or load
    pub fn baseline(&self) -> Option<&GraphHash> {
        self.baseline.as_ref()
    }

    /// Record `graph` as the persisted state (after load or successful save)
    pub fn set_baseline(&mut self, graph: &WorkflowGraph) {
        self.record_saved(graph, graph);
    }

    /// Record `saved` as persisted while the editor already shows `current`
    ///
    /// Edits made while a write was in flight stay dirty.
    pub fn record_saved(&mut self, saved: &WorkflowGraph, current: &WorkflowGraph) {
        let hash = compute_hash(saved);
        debug!(hash = %hash, "dirty baseline reset");
        self.baseline = Some(hash);
        self.resubmit_required = false;
        self.observe(current);
    }

    /// Keep the document dirty until the next successful write, even if its
    /// hash matches the baseline (used when a conflict is cancelled)
    pub fn require_resubmit(&mut self, graph: &WorkflowGraph) {
        self.resubmit_required = true;
        self.observe(graph);
    }

    /// Whether `graph` has unsaved changes
    ///
    /// Always true while a save conflict is outstanding or after a conflict
    /// was cancelled. A document that was never saved is dirty as soon as it
    /// has content.
    pub fn is_dirty(&self, graph: &WorkflowGraph) -> bool {
        if self.conflict_outstanding || self.resubmit_required {
            return true;
        }
        match &self.baseline {
            Some(baseline) => *baseline != compute_hash(graph),
            None => !graph.is_empty(),
        }
    }

    /// Re-evaluate dirtiness after an edit and update the exit guard
    ///
    /// Returns the new dirty flag.
    pub fn observe(&mut self, graph: &WorkflowGraph) -> bool {
        let dirty = self.is_dirty(graph);
        if dirty != self.dirty {
            if dirty {
                self.guard.engage();
            } else {
                self.guard.release();
            }
            self.dirty = dirty;
        }
        dirty
    }

    /// Mark a conflict as outstanding (or resolved) and re-evaluate
    pub fn set_conflict_outstanding(&mut self, outstanding: bool, graph: &WorkflowGraph) {
        self.conflict_outstanding = outstanding;
        self.observe(graph);
    }

    /// Last observed dirty flag
    pub fn dirty(&self) -> bool {
        self.dirty
    }
}

impl fmt::Debug for ChangeHashTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeHashTracker")
            .field("baseline", &self.baseline)
            .field("conflict_outstanding", &self.conflict_outstanding)
            .field("resubmit_required", &self.resubmit_required)
            .field("dirty", &self.dirty)
            .finish()
    }
}
