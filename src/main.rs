//! wardend - daemon entry point.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use warden::config::WardenConfig;
use warden::lifecycle::WardenDeps;
use warden::sim::SimCluster;

#[derive(Parser)]
#[command(name = "wardend", about = "Lifecycle manager for the storage cluster's database engine")]
struct Cli {
    /// Log level filter (e.g. "info", "warden=debug").
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file and print a summary.
    Check {
        /// Path to the JSON configuration file.
        #[arg(long)]
        config: PathBuf,
    },
    /// Run the full lifecycle against an in-process simulated engine.
    Dev {
        /// Number of simulated cluster nodes.
        #[arg(long, default_value_t = 8)]
        nodes: usize,
    },
}

#[tokio::main]
async fn main() -> warden::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone())),
        )
        .init();

    match cli.command {
        Commands::Check { config } => {
            let config = WardenConfig::from_file(&config)?;
            config.validate()?;
            println!(
                "ok: database '{}', {} nodes, exists quorum {}, escalation threshold {}",
                config.database_name,
                config.cluster_size(),
                config.exists_quorum(),
                config.escalation_threshold
            );
            Ok(())
        }
        Commands::Dev { nodes } => {
            let sim = SimCluster::new(nodes);
            let config = WardenConfig::development(sim.addrs());
            let deps = WardenDeps {
                connector: sim.connector(),
                store: sim.store(),
            };
            warden::run(config, deps).await
        }
    }
}
