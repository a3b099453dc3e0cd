// Workflow document commands

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use clap::Subcommand;
use flowdesk_core::{
    Autosaver, ConfirmPrompt, ConflictResolution, EditorSession, Prompter, ResolutionOutcome,
    SaveController, SaveError, SaveMode, SaveOutcome, WorkflowGraph, WorkflowId,
};
use serde::Serialize;
use tracing::{info, warn};

use super::App;
use crate::output::{print_field, print_table_header, print_table_row};
use crate::prompt::TerminalExitGuard;

#[derive(Subcommand)]
pub enum WorkflowsCommand {
    /// Show a workflow and its graph
    Get {
        /// Workflow ID
        workflow_id: WorkflowId,
    },

    /// Save a graph file (creates a new workflow when --id is omitted)
    Push {
        /// JSON or YAML file with {nodes, edges}
        #[arg(short, long)]
        file: PathBuf,

        /// Existing workflow to update
        #[arg(long)]
        id: Option<WorkflowId>,

        /// Name for a new workflow
        #[arg(long)]
        name: Option<String>,

        /// What to do when the stored copy changed since it was loaded
        #[arg(long, default_value = "ask", value_parser = ["ask", "reload", "force", "cancel"])]
        on_conflict: String,
    },

    /// Rename a workflow (its version is unchanged)
    Rename {
        /// Workflow ID
        workflow_id: WorkflowId,

        /// New name
        name: String,
    },

    /// Edit a workflow through a local file; changes are autosaved
    Edit {
        /// Workflow ID
        workflow_id: WorkflowId,

        /// Working file (overwritten with the stored graph on start)
        #[arg(short, long)]
        file: PathBuf,
    },
}

pub async fn run(command: WorkflowsCommand, app: &App) -> Result<()> {
    match command {
        WorkflowsCommand::Get { workflow_id } => get(app, workflow_id).await,
        WorkflowsCommand::Push {
            file,
            id,
            name,
            on_conflict,
        } => push(app, &file, id, name, &on_conflict).await,
        WorkflowsCommand::Rename { workflow_id, name } => {
            rename(app, workflow_id, &name).await
        }
        WorkflowsCommand::Edit { workflow_id, file } => {
            edit(app, workflow_id, &file).await
        }
    }
}

async fn get(app: &App, workflow_id: WorkflowId) -> Result<()> {
    let ctx = app.context();
    let record = ctx
        .workflows
        .get_workflow(workflow_id)
        .await
        .with_context(|| format!("Failed to load workflow {}", workflow_id))?;

    if !app.output.is_text() {
        return app.output.print_value(&record);
    }

    print_field("ID", &record.id.to_string());
    print_field("Name", &record.name);
    print_field("Version", &record.lock_version.to_string());
    print_field("Nodes", &record.graph.node_count().to_string());
    print_field("Edges", &record.graph.edges().len().to_string());

    if !record.graph.is_empty() {
        println!();
        print_table_header(&[("NODE", 20), ("TYPE", 14), ("LABEL", 30)]);
        for node in record.graph.nodes() {
            let label = node.label();
            print_table_row(&[
                (node.id.as_str(), 20),
                (node.node_type.as_str(), 14),
                (label.as_str(), 30),
            ]);
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct SaveReport {
    workflow_id: Option<WorkflowId>,
    lock_version: u64,
    outcome: &'static str,
}

async fn push(
    app: &App,
    file: &Path,
    id: Option<WorkflowId>,
    name: Option<String>,
    on_conflict: &str,
) -> Result<()> {
    let graph = read_graph(file)?;
    let ctx = app.context();

    let session = match id {
        Some(id) => {
            let session = EditorSession::open(&ctx, id).await?;
            session.save().set_graph(graph);
            session
        }
        None => {
            let name = name.context("--name is required when creating a workflow")?;
            EditorSession::draft(&ctx, name, graph)
        }
    };

    let outcome = save_resolving(session.save(), ctx.prompter.as_ref(), on_conflict).await?;
    let report = SaveReport {
        workflow_id: session.save().workflow_id(),
        lock_version: session.save().lock_version().get(),
        outcome,
    };

    if app.output.is_text() {
        if app.quiet {
            if let Some(id) = report.workflow_id {
                println!("{}", id);
            }
        } else {
            println!("Workflow {}", report.outcome);
            if let Some(id) = report.workflow_id {
                print_field("ID", &id.to_string());
            }
            print_field("Version", &report.lock_version.to_string());
        }
        Ok(())
    } else {
        app.output.print_value(&report)
    }
}

/// Save interactively; on conflict apply `policy` ("ask" defers to the prompter)
async fn save_resolving(
    save: &SaveController,
    prompter: &dyn Prompter,
    policy: &str,
) -> Result<&'static str> {
    let conflict = match save.save(SaveMode::Interactive).await {
        Ok(SaveOutcome::Saved { .. }) => return Ok("saved"),
        Ok(SaveOutcome::Created { .. }) => return Ok("created"),
        Ok(SaveOutcome::Aborted) => return Ok("not saved"),
        Err(SaveError::Conflict(conflict)) => conflict,
        Err(e) => return Err(e.into()),
    };

    eprintln!("{}", conflict.describe());
    let resolution = match policy {
        "reload" => ConflictResolution::Reload,
        "force" => ConflictResolution::Force,
        "cancel" => ConflictResolution::Cancel,
        _ => prompter.choose_resolution(&conflict).await,
    };

    Ok(match save.resolve_conflict(resolution).await? {
        ResolutionOutcome::Reloaded { .. } => "reloaded (local changes discarded)",
        ResolutionOutcome::Forced { .. } => "overwritten",
        ResolutionOutcome::Cancelled => "not saved (conflict left unresolved)",
    })
}

async fn rename(app: &App, workflow_id: WorkflowId, name: &str) -> Result<()> {
    let session = EditorSession::open(&app.context(), workflow_id).await?;
    session.save().rename(name).await?;

    if app.output.is_text() {
        app.say(format!("Renamed workflow {} to {}", workflow_id, name));
        Ok(())
    } else {
        app.output
            .print_value(&serde_json::json!({ "id": workflow_id, "name": name }))
    }
}

/// Mirror the workflow into `file`, push file changes through the autosaver
async fn edit(app: &App, workflow_id: WorkflowId, file: &Path) -> Result<()> {
    let guard = Arc::new(TerminalExitGuard::default());
    let ctx = app.context_with_guard(guard.clone());
    let session = EditorSession::open(&ctx, workflow_id).await?;
    let save = session.save().clone();

    write_graph(file, &save.graph())?;
    let mut last_seen = modified(file)?;
    let autosaver = Autosaver::spawn(save.clone(), app.config.autosave_debounce);

    app.say(format!(
        "Editing {} (version {}) via {}. Press Ctrl-C to stop.",
        workflow_id,
        save.lock_version(),
        file.display()
    ));

    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Some(conflict) = save.pending_conflict() {
                    eprintln!("{}", conflict.describe());
                    let resolution = ctx.prompter.choose_resolution(&conflict).await;
                    match save.resolve_conflict(resolution).await {
                        Ok(ResolutionOutcome::Reloaded { lock_version }) => {
                            write_graph(file, &save.graph())?;
                            last_seen = modified(file)?;
                            app.say(format!("Reloaded version {}", lock_version));
                        }
                        Ok(ResolutionOutcome::Forced { lock_version }) => {
                            app.say(format!("Overwrote with version {}", lock_version));
                        }
                        Ok(ResolutionOutcome::Cancelled) => {
                            app.say("Kept local changes; edit the file again to retry");
                        }
                        Err(e) => warn!(error = %e, "conflict resolution failed"),
                    }
                }

                let current = modified(file)?;
                if current != last_seen {
                    last_seen = current;
                    match read_graph(file) {
                        Ok(graph) => {
                            let dirty = save.set_graph(graph);
                            info!(dirty, "working file changed");
                        }
                        Err(e) => warn!(error = %e, "ignoring unreadable working file"),
                    }
                }
            }
            _ = &mut ctrl_c => {
                if guard.is_engaged()
                    && !ctx.prompter.confirm(&ConfirmPrompt::DiscardUnsavedChanges).await
                {
                    ctrl_c.set(tokio::signal::ctrl_c());
                    continue;
                }
                break;
            }
        }
    }

    autosaver.shutdown().await;
    app.say(format!("Stopped editing at version {}", save.lock_version()));
    Ok(())
}

fn modified(file: &Path) -> Result<SystemTime> {
    std::fs::metadata(file)
        .and_then(|m| m.modified())
        .with_context(|| format!("Failed to stat file: {}", file.display()))
}

fn is_yaml(file: &Path) -> bool {
    matches!(
        file.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Read a graph file (YAML by extension, otherwise JSON then YAML)
pub fn read_graph(file: &Path) -> Result<WorkflowGraph> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read file: {}", file.display()))?;
    let graph = if is_yaml(file) {
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse YAML: {}", file.display()))?
    } else {
        serde_json::from_str(&content)
            .map_err(anyhow::Error::from)
            .or_else(|_| serde_yaml::from_str(&content).map_err(anyhow::Error::from))
            .with_context(|| {
                format!("Failed to parse file (tried JSON and YAML): {}", file.display())
            })?
    };
    Ok(graph)
}

pub fn write_graph(file: &Path, graph: &WorkflowGraph) -> Result<()> {
    let content = if is_yaml(file) {
        serde_yaml::to_string(graph)?
    } else {
        serde_json::to_string_pretty(graph)?
    };
    std::fs::write(file, content)
        .with_context(|| format!("Failed to write file: {}", file.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowdesk_core::GraphNode;

    fn graph() -> WorkflowGraph {
        WorkflowGraph::new()
            .with_node(GraphNode::new("a", "agent").with_position(10.0, 20.0))
            .with_node(GraphNode::new("b", "tool"))
            .with_edge("a", "b")
    }

    #[test]
    fn test_graph_file_roundtrip_json_and_yaml() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["graph.json", "graph.yaml"] {
            let path = dir.path().join(name);
            write_graph(&path, &graph()).unwrap();
            assert_eq!(read_graph(&path).unwrap(), graph());
        }
    }

    #[test]
    fn test_unknown_extension_falls_back_to_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.txt");
        std::fs::write(&path, "nodes:\n  - id: a\n    type: agent\nedges: []\n").unwrap();

        let parsed = read_graph(&path).unwrap();
        assert_eq!(parsed.node_count(), 1);
    }
}
