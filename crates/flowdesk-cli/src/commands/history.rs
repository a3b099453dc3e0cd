// Execution history commands

use anyhow::{Context, Result};
use clap::Subcommand;
use flowdesk_core::{TaskHistoryEntry, TaskHistoryReconciler, TaskId, WorkflowId};

use super::App;
use crate::output::{format_duration, print_field, print_table_header, print_table_row};

#[derive(Subcommand)]
pub enum HistoryCommand {
    /// List past executions of a workflow (most recent first)
    List {
        /// Workflow ID
        workflow_id: WorkflowId,

        /// Maximum number of entries
        #[arg(long)]
        limit: Option<u32>,

        /// Entries to skip
        #[arg(long, default_value = "0")]
        offset: u32,
    },

    /// Show one execution with its inputs and output
    Show {
        /// Workflow ID
        workflow_id: WorkflowId,

        /// Task ID
        task_id: TaskId,
    },

    /// Delete an execution record
    Delete {
        /// Task ID
        task_id: TaskId,
    },
}

pub async fn run(command: HistoryCommand, app: &App) -> Result<()> {
    let history = TaskHistoryReconciler::new(app.client.clone(), app.config.history_page_size);

    match command {
        HistoryCommand::List {
            workflow_id,
            limit,
            offset,
        } => {
            let limit = limit.unwrap_or(history.page_size());
            let page = history
                .fetch_history(workflow_id, limit, offset)
                .await?;

            if !app.output.is_text() {
                return app.output.print_value(&page);
            }
            if page.tasks.is_empty() {
                println!("No executions found");
                return Ok(());
            }

            print_table_header(&[
                ("TASK", 10),
                ("STATUS", 10),
                ("STARTED", 19),
                ("DURATION", 9),
                ("INPUT", 30),
            ]);
            for entry in &page.tasks {
                let started = entry.created_at.format("%Y-%m-%d %H:%M:%S").to_string();
                let duration = entry.duration().map(format_duration).unwrap_or_default();
                let id = entry.id.to_string();
                let status = entry.status.to_string();
                print_table_row(&[
                    (id.as_str(), 10),
                    (status.as_str(), 10),
                    (started.as_str(), 19),
                    (duration.as_str(), 9),
                    (entry.user_input.as_deref().unwrap_or("-"), 30),
                ]);
            }
            if !app.quiet {
                println!();
                println!(
                    "Showing {}-{} of {}",
                    offset + 1,
                    offset as usize + page.tasks.len(),
                    page.total_count
                );
            }
            Ok(())
        }

        HistoryCommand::Show {
            workflow_id,
            task_id,
        } => {
            let entry = find_entry(&history, workflow_id, task_id).await?;
            history.select_entry(Some(&entry));

            if !app.output.is_text() {
                return app.output.print_value(&entry);
            }
            print_entry(&entry)
        }

        HistoryCommand::Delete { task_id } => {
            history.delete_entry(task_id).await?;

            if app.output.is_text() {
                app.say(format!("Deleted execution {}", task_id));
                Ok(())
            } else {
                app.output
                    .print_value(&serde_json::json!({ "deleted": task_id }))
            }
        }
    }
}

/// Page through history until `task_id` turns up
async fn find_entry(
    history: &TaskHistoryReconciler,
    workflow_id: WorkflowId,
    task_id: TaskId,
) -> Result<TaskHistoryEntry> {
    let limit = history.page_size();
    let mut offset = 0;
    loop {
        let page = history.fetch_history(workflow_id, limit, offset).await?;
        if let Some(entry) = page.tasks.iter().find(|e| e.id == task_id) {
            return Ok(entry.clone());
        }
        offset += limit;
        if page.tasks.is_empty() || u64::from(offset) >= page.total_count {
            return Err(anyhow::anyhow!("Execution not found: {}", task_id));
        }
    }
}

fn print_entry(entry: &TaskHistoryEntry) -> Result<()> {
    print_field("Task", &entry.id.to_string());
    print_field("Status", &entry.status.to_string());
    print_field(
        "Started",
        &entry.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
    );
    if let Some(done) = entry.completed_at {
        print_field("Finished", &done.format("%Y-%m-%d %H:%M:%S").to_string());
    }
    if let Some(duration) = entry.duration() {
        print_field("Duration", &format_duration(duration));
    }
    if let Some(input) = &entry.user_input {
        print_field("Input", input);
    }
    if let Some(error) = &entry.error_message {
        print_field("Error", error);
    }
    if let Some(data) = &entry.input_data {
        println!();
        println!("Input data:");
        println!(
            "{}",
            serde_json::to_string_pretty(data).context("Failed to format input data")?
        );
    }
    if let Some(output) = &entry.output_data {
        println!();
        println!("Output:");
        println!(
            "{}",
            serde_json::to_string_pretty(output).context("Failed to format output")?
        );
    }
    Ok(())
}
