use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use gridlb_core::GridConfig;

#[derive(Parser)]
#[command(name = "gridlbd", about = "gridlb dispatcher daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatcher: front door, queue pump, autoscaler, health checker.
    Run {
        /// TOML configuration file. Built-in defaults when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port for the front door.
        #[arg(long, default_value = "8000")]
        port: u16,
    },

    /// Validate a configuration file and print the effective settings.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,gridlbd=debug,gridlb=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, port } => {
            let config = load_config(config.as_deref())?;
            gridlbd::run(config, port).await
        }
        Command::CheckConfig { config } => {
            let config = load_config(Some(&config))?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<GridConfig> {
    match path {
        Some(path) => {
            let config = GridConfig::from_file(path)
                .with_context(|| format!("load config {}", path.display()))?;
            info!(path = %path.display(), workers = config.workers.len(), "configuration loaded");
            Ok(config)
        }
        None => {
            info!("no configuration file, using defaults");
            Ok(GridConfig::default())
        }
    }
}
