// Run / stop / status commands

use std::time::Duration;

use anyhow::{bail, Context, Result};
use flowdesk_core::{
    EditorSession, ExecutionSignal, ExecutionState, KeyValueStore, Reconciliation, RunOutcome,
    StopOutcome, TaskHandle, TaskId, WorkflowGraph, WorkflowId, ACTIVE_TASK_KEY,
};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::App;
use crate::output::{format_duration, print_field};

#[derive(Debug, Serialize)]
struct StatusView {
    workflow_id: Option<WorkflowId>,
    task_id: Option<TaskId>,
    state: ExecutionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl StatusView {
    fn of(session: &EditorSession, workflow_id: Option<WorkflowId>) -> Self {
        let status = session.execution().status();
        let handle = session.execution().handle();
        Self {
            workflow_id: workflow_id.or(handle.map(|h| h.workflow_id)),
            task_id: handle.map(|h| h.task_id),
            state: status.state,
            started_at: status.started_at,
            duration_seconds: status
                .duration
                .map(|d| d.num_milliseconds() as f64 / 1000.0),
            error: status.error_message,
        }
    }

    fn print(&self, app: &App) -> Result<()> {
        if !app.output.is_text() {
            return app.output.print_value(self);
        }
        if let Some(id) = self.workflow_id {
            print_field("Workflow", &id.to_string());
        }
        if let Some(id) = self.task_id {
            print_field("Task", &id.to_string());
        }
        print_field("State", &self.state.to_string());
        if let Some(started) = self.started_at {
            print_field("Started", &started.format("%Y-%m-%d %H:%M:%S").to_string());
        }
        if let Some(secs) = self.duration_seconds {
            print_field(
                "Duration",
                &format_duration(chrono::Duration::milliseconds((secs * 1000.0) as i64)),
            );
        }
        if let Some(error) = &self.error {
            print_field("Error", error);
        }
        Ok(())
    }
}

/// Parse `key=value` pairs into the run inputs; values that parse as JSON
/// keep their type, everything else is a string
pub fn parse_inputs(query: Option<String>, pairs: &[String]) -> Result<Value> {
    let mut inputs = Map::new();
    if let Some(query) = query {
        inputs.insert("query".to_string(), Value::String(query));
    }
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("Invalid input '{}', expected key=value", pair);
        };
        if key.is_empty() {
            bail!("Invalid input '{}', key is empty", pair);
        }
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.into()));
        inputs.insert(key.to_string(), value);
    }
    Ok(Value::Object(inputs))
}

/// Start an execution of a stored workflow
pub async fn run(
    app: &App,
    workflow_id: WorkflowId,
    query: Option<String>,
    inputs: Vec<String>,
    wait: bool,
    poll_interval: Duration,
) -> Result<()> {
    let inputs = parse_inputs(query, &inputs)?;
    let session = EditorSession::open(&app.context(), workflow_id).await?;

    let handle = match session.execution().run(inputs).await? {
        RunOutcome::Started(handle) => handle,
        RunOutcome::Declined => {
            app.say("Kept the execution that is already running");
            return Ok(());
        }
    };

    if !wait {
        if app.output.is_text() {
            if app.quiet {
                println!("{}", handle.task_id);
            } else {
                println!("Execution started");
                print_field("Task", &handle.task_id.to_string());
                print_field("Workflow", &handle.workflow_id.to_string());
            }
            return Ok(());
        }
        return app.output.print_value(&handle);
    }

    app.say(format!("Waiting for task {}...", handle.task_id));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = &mut ctrl_c => {
                app.say(format!(
                    "Detached; task {} keeps running. Use `flowdesk stop` to cancel it.",
                    handle.task_id
                ));
                return Ok(());
            }
        }

        if let Some(signal) = poll_terminal_signal(&session, &handle).await {
            session.execution().apply_signal(signal)?;
            break;
        }
    }

    StatusView::of(&session, Some(workflow_id)).print(app)
}

/// Look for a finished history entry for `handle`
async fn poll_terminal_signal(session: &EditorSession, handle: &TaskHandle) -> Option<ExecutionSignal> {
    let history = session.history();
    if let Err(e) = history
        .fetch_history(handle.workflow_id, history.page_size(), 0)
        .await
    {
        warn!(error = %e, "history poll failed, retrying");
        return None;
    }

    let entry = history
        .entries()
        .into_iter()
        .find(|entry| entry.id == handle.task_id)?;
    debug!(task_id = %entry.id, status = %entry.status, "polled task status");
    ExecutionSignal::from_history(&entry)
}

/// The handle persisted by the last run, if any
fn active_handle(app: &App) -> Result<Option<TaskHandle>> {
    let Some(raw) = app
        .kv
        .get(ACTIVE_TASK_KEY)
        .context("Failed to read local state")?
    else {
        return Ok(None);
    };
    match serde_json::from_str(&raw) {
        Ok(handle) => Ok(Some(handle)),
        Err(e) => {
            warn!(error = %e, "ignoring unreadable task handle");
            Ok(None)
        }
    }
}

/// Cancel the execution recorded in local state
pub async fn stop(app: &App) -> Result<()> {
    let ctx = app.context();
    let session = EditorSession::draft(&ctx, "", WorkflowGraph::new());
    if let Some(handle) = active_handle(app)? {
        session.execution().restore(handle.workflow_id)?;
    }

    match session.execution().stop().await? {
        StopOutcome::Stopped { task_id, remote } => {
            if app.output.is_text() {
                match remote {
                    Some(_) => app.say(format!("Stopped task {}", task_id)),
                    None => app.say(format!(
                        "Stopped tracking task {} (the cancel request failed)",
                        task_id
                    )),
                }
                Ok(())
            } else {
                app.output.print_value(&serde_json::json!({
                    "task_id": task_id,
                    "cancel": remote,
                }))
            }
        }
        StopOutcome::NoActiveExecution => {
            if app.output.is_text() {
                app.say("No active execution");
                Ok(())
            } else {
                app.output
                    .print_value(&serde_json::json!({ "task_id": null, "cancel": null }))
            }
        }
    }
}

/// Show the execution state of a workflow, or of the local handle
pub async fn status(app: &App, workflow_id: Option<WorkflowId>) -> Result<()> {
    let ctx = app.context();

    let Some(workflow_id) = workflow_id else {
        let Some(handle) = active_handle(app)? else {
            if app.output.is_text() {
                println!("No active execution");
                return Ok(());
            }
            return app.output.print_value(&serde_json::json!({ "state": "idle" }));
        };
        // Reconcile against the handle's own workflow
        let session = EditorSession::open(&ctx, handle.workflow_id).await?;
        return StatusView::of(&session, Some(handle.workflow_id)).print(app);
    };

    let session = EditorSession::open(&ctx, workflow_id).await?;
    if session.reconciliation().is_none() {
        warn!("execution history unavailable, showing local state only");
    }
    if let Some(Reconciliation::Released(task_id)) = session.reconciliation() {
        app.say(format!("Task {} finished since it was last checked", task_id));
    }
    StatusView::of(&session, Some(workflow_id)).print(app)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_inputs_keeps_json_types() {
        let inputs = parse_inputs(
            Some("latest news".into()),
            &["limit=5".into(), "verbose=true".into(), "topic=rust".into()],
        )
        .unwrap();

        assert_eq!(
            inputs,
            json!({"query": "latest news", "limit": 5, "verbose": true, "topic": "rust"})
        );
    }

    #[test]
    fn test_parse_inputs_rejects_missing_separator() {
        assert!(parse_inputs(None, &["oops".into()]).is_err());
        assert!(parse_inputs(None, &["=value".into()]).is_err());
    }

    #[test]
    fn test_parse_inputs_empty() {
        assert_eq!(parse_inputs(None, &[]).unwrap(), json!({}));
    }
}
