mod cli;
mod config;
mod db;
mod embedding;
mod memory;
mod server;
mod tools;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cairn", version, about = "Shared memory graph MCP server for agent types")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the MCP server
    Serve {
        /// Serve Streamable HTTP on the configured host and port instead of stdio
        #[arg(long)]
        http: bool,
    },
    /// Retrieve ranked fragments for a task
    Retrieve {
        query: String,
        #[arg(long)]
        agent_type: String,
        /// Technology tags of the current task (repeatable)
        #[arg(long = "tech")]
        technologies: Vec<String>,
        /// Category tags of the current task (repeatable)
        #[arg(long = "category")]
        categories: Vec<String>,
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
        /// Include expired, superseded and archived fragments
        #[arg(long)]
        historical: bool,
    },
    /// Show statistics for an agent type
    Stats {
        agent_type: String,
        #[arg(long)]
        project: Option<String>,
    },
    /// Show full details for one fragment
    Inspect { id: String },
    /// List conflicts for an agent type
    Conflicts {
        agent_type: String,
        /// Only conflicts in this status
        #[arg(long)]
        status: Option<String>,
        /// Print the append-only resolution ledger too
        #[arg(long)]
        ledger: bool,
    },
    /// Lower quality of fragments that have not been validated recently
    Decay {
        #[arg(long)]
        agent_type: Option<String>,
    },
    /// Archive stale, low-quality fragments and remove orphaned vectors
    Sweep {
        #[arg(long)]
        max_age_days: Option<i64>,
        #[arg(long)]
        min_quality: Option<f64>,
    },
    /// Check database integrity and consistency
    Doctor,
    /// Manage the embedding model
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },
}

#[derive(Subcommand)]
enum ModelAction {
    /// Download the embedding model to ~/.cairn/models/
    Download,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = config::CairnConfig::load()?;

    // Log to stderr so stdout stays clean for MCP JSON-RPC.
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve { http } => {
            if http || config.server.transport == "http" {
                server::serve_http(config).await?;
            } else {
                server::serve_stdio(config).await?;
            }
        }
        Command::Retrieve {
            query,
            agent_type,
            technologies,
            categories,
            project,
            limit,
            historical,
        } => {
            let args = cli::retrieve::RetrieveArgs {
                query: &query,
                agent_type: &agent_type,
                technologies: &technologies,
                categories: &categories,
                project: project.as_deref(),
                limit,
                historical,
            };
            cli::retrieve::retrieve(config, args).await?;
        }
        Command::Stats { agent_type, project } => {
            cli::stats::stats(&config, &agent_type, project.as_deref())?;
        }
        Command::Inspect { id } => cli::inspect::inspect(&config, &id)?,
        Command::Conflicts {
            agent_type,
            status,
            ledger,
        } => cli::conflicts::conflicts(&config, &agent_type, status.as_deref(), ledger)?,
        Command::Decay { agent_type } => cli::maintenance::decay(&config, agent_type.as_deref())?,
        Command::Sweep {
            max_age_days,
            min_quality,
        } => cli::maintenance::sweep(&config, max_age_days, min_quality)?,
        Command::Doctor => cli::doctor::doctor(&config)?,
        Command::Model { action } => match action {
            ModelAction::Download => cli::model_download(&config.embedding).await?,
        },
    }

    Ok(())
}
