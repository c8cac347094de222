//! toolgather: query Jira, Confluence and Google Drive tool servers from the terminal.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use toolgather::agent_core::Orchestrator;

#[derive(Parser)]
#[command(name = "toolgather")]
#[command(about = "Resilient tool-server queries with timeouts, retries and recovery hints")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Directory holding mcp_servers.json and settings.yaml
    #[arg(short, long, global = true)]
    config_dir: Option<PathBuf>,

    /// Write logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe every enabled server
    Health,
    /// Gather data for a query from the relevant servers
    Gather {
        /// Free-text query
        query: String,
        /// Brand or product hint (e.g., "atlassian", "google")
        #[arg(short = 'x', long)]
        context: Option<String>,
    },
    /// List the tools a server advertises
    Tools {
        /// Server key from mcp_servers.json
        server: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    toolgather::init_tracing(cli.json_logs).context("failed to initialize logging")?;

    let config_dir = match cli.config_dir {
        Some(dir) => dir,
        None => {
            let cwd = std::env::current_dir().context("failed to read working directory")?;
            toolgather::config::find_config_dir(&cwd)?
        }
    };
    let orchestrator = toolgather::build_orchestrator(&config_dir)
        .with_context(|| format!("failed to load config from {}", config_dir.display()))?;

    let result = run(&orchestrator, cli.command).await;
    orchestrator.shutdown().await;

    let output = result?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run(orchestrator: &Orchestrator, command: Commands) -> anyhow::Result<serde_json::Value> {
    match command {
        Commands::Health => Ok(serde_json::to_value(orchestrator.health_check().await)?),
        Commands::Gather { query, context } => {
            let result = orchestrator.gather_data(&query, context.as_deref()).await;
            Ok(serde_json::to_value(result)?)
        }
        Commands::Tools { server } => {
            let tools = orchestrator
                .pool()
                .catalog(&server)
                .await
                .with_context(|| format!("could not reach server '{server}'"))?;
            Ok(serde_json::to_value(tools)?)
        }
    }
}
