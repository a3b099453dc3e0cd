// Flowdesk CLI
//
// Design Decision: Use clap derive for ergonomic argument parsing.
// Design Decision: Support text/json/yaml output formats for scripting.
// Design Decision: The sync core does the work; this crate supplies the HTTP
// client, terminal prompts and a file-backed state directory.
// Design Decision: Logs go to stderr so json/yaml output stays parseable.

mod client;
mod commands;
mod output;
mod prompt;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use flowdesk_core::SyncConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "flowdesk")]
#[command(about = "Flowdesk CLI - Edit, save and run workflows")]
#[command(version)]
pub struct Cli {
    /// API base URL (defaults to FLOWDESK_API_URL or http://localhost:8765)
    #[arg(long)]
    pub api_url: Option<String>,

    /// Directory for local state (defaults to FLOWDESK_STATE_DIR or .flowdesk)
    #[arg(long)]
    pub state_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, short, default_value = "text", value_parser = ["text", "json", "yaml"])]
    pub output: String,

    /// Suppress non-essential output
    #[arg(long, short)]
    pub quiet: bool,

    /// Answer yes to every confirmation (conflicts are left unresolved)
    #[arg(long, short)]
    pub yes: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage workflow documents
    Workflows {
        #[command(subcommand)]
        command: commands::workflows::WorkflowsCommand,
    },

    /// Save and run a workflow
    Run {
        /// Workflow ID
        workflow_id: flowdesk_core::WorkflowId,

        /// Prompt passed to the workflow as `query`
        #[arg(long, short)]
        query: Option<String>,

        /// Extra inputs as key=value (repeatable)
        #[arg(long = "input", short)]
        inputs: Vec<String>,

        /// Wait until the execution finishes
        #[arg(long)]
        wait: bool,

        /// Poll interval in seconds while waiting
        #[arg(long, default_value = "2")]
        poll_interval: u64,
    },

    /// Stop the active execution
    Stop,

    /// Show execution state of a workflow (or of the active execution)
    Status {
        /// Workflow ID
        workflow_id: Option<flowdesk_core::WorkflowId>,
    },

    /// Browse execution history
    History {
        #[command(subcommand)]
        command: commands::history::HistoryCommand,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowdesk=warn,flowdesk_core=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = SyncConfig::from_env();
    if let Some(url) = cli.api_url {
        config = config.with_api_url(url);
    }
    if let Some(dir) = cli.state_dir {
        config = config.with_state_dir(dir);
    }
    tracing::debug!(api_url = %config.api_url, state_dir = %config.state_dir.display(), "configuration loaded");

    let output_format = output::OutputFormat::parse(&cli.output);
    let app = commands::App::new(config, output_format, cli.quiet, cli.yes)?;

    match cli.command {
        Commands::Workflows { command } => commands::workflows::run(command, &app).await,
        Commands::Run {
            workflow_id,
            query,
            inputs,
            wait,
            poll_interval,
        } => {
            commands::execution::run(
                &app,
                workflow_id,
                query,
                inputs,
                wait,
                Duration::from_secs(poll_interval.max(1)),
            )
            .await
        }
        Commands::Stop => commands::execution::stop(&app).await,
        Commands::Status { workflow_id } => commands::execution::status(&app, workflow_id).await,
        Commands::History { command } => commands::history::run(command, &app).await,
    }
}
