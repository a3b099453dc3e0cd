// Structural validation of workflow graphs
//
// Errors block a save before any network call. Warnings are non-fatal: an
// interactive save asks for confirmation, a silent save logs and proceeds.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::graph::{NodeId, WorkflowGraph};

/// Severity of a validation finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

/// A single violated rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Stable rule identifier (e.g. "dangling_edge")
    pub rule: String,
    pub message: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
}

impl ValidationIssue {
    pub fn error(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            message: message.into(),
            severity: Severity::Error,
            node_id: None,
        }
    }

    pub fn warning(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            message: message.into(),
            severity: Severity::Warning,
            node_id: None,
        }
    }

    pub fn at(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node_id {
            Some(node) => write!(f, "[{}] {} (node {})", self.rule, self.message, node),
            None => write!(f, "[{}] {}", self.rule, self.message),
        }
    }
}

/// Result of validating a graph
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, issue: ValidationIssue) {
        self.issues.push(issue);
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Warning)
    }

    pub fn has_errors(&self) -> bool {
        self.errors().next().is_some()
    }

    pub fn has_warnings(&self) -> bool {
        self.warnings().next().is_some()
    }

    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.issues.iter().map(|i| i.to_string()).collect();
        f.write_str(&rendered.join("; "))
    }
}

/// Validates a graph before it is written
pub trait GraphValidator: Send + Sync {
    fn validate(&self, graph: &WorkflowGraph) -> ValidationReport;
}

/// Built-in structural checks
///
/// Errors: edges pointing at missing nodes, self-loops, nodes without a type.
/// Warnings: duplicate edges, nodes with no connections in a multi-node graph.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuralValidator;

impl GraphValidator for StructuralValidator {
    fn validate(&self, graph: &WorkflowGraph) -> ValidationReport {
        let mut report = ValidationReport::new();

        for node in graph.nodes() {
            if node.node_type.trim().is_empty() {
                report.push(
                    ValidationIssue::error("missing_node_type", "node has no type")
                        .at(node.id.clone()),
                );
            }
        }

        let mut seen = HashSet::new();
        let mut connected: HashSet<&NodeId> = HashSet::new();
        for edge in graph.edges() {
            for end in [&edge.source, &edge.target] {
                if !graph.contains_node(end) {
                    report.push(ValidationIssue::error(
                        "dangling_edge",
                        format!(
                            "edge {} -> {} references missing node {}",
                            edge.source, edge.target, end
                        ),
                    ));
                }
            }
            if edge.source == edge.target {
                report.push(
                    ValidationIssue::error("self_loop", "edge connects a node to itself")
                        .at(edge.source.clone()),
                );
            }
            if !seen.insert((&edge.source, &edge.target)) {
                report.push(ValidationIssue::warning(
                    "duplicate_edge",
                    format!("edge {} -> {} appears more than once", edge.source, edge.target),
                ));
            }
            connected.insert(&edge.source);
            connected.insert(&edge.target);
        }

        if graph.node_count() > 1 {
            for id in graph.node_ids() {
                if !connected.contains(id) {
                    report.push(
                        ValidationIssue::warning("disconnected_node", "node has no connections")
                            .at(id.clone()),
                    );
                }
            }
        }

        report
    }
}
