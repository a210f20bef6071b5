//! relay-jobs operator console
//!
//! Connects to a deployment's shared store (Redis) and exposes the
//! operational surfaces: dead-letter inspection, circuit overrides, and
//! execution statistics. Reprocessing happens inside the application (it
//! needs the application's queue and handlers); this tool is for looking
//! and for the circuit override an incident call actually needs.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{CircuitCommand, DlqCommand, StatsCommand};

#[derive(Parser)]
#[command(name = "relay-jobs")]
#[command(version)]
#[command(about = "Operator console for relay-jobs deployments", long_about = None)]
struct Cli {
    /// Path to the relay TOML configuration file
    #[arg(long, default_value = "relay.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect the dead-letter store
    Dlq {
        #[command(subcommand)]
        command: DlqCommand,
    },
    /// Inspect and override circuit breakers
    Circuit {
        #[command(subcommand)]
        command: CircuitCommand,
    },
    /// Execution statistics per job type
    Stats(StatsCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let store = commands::connect(&cli.config)?;

    match cli.command {
        Commands::Dlq { command } => command.execute(store).await,
        Commands::Circuit { command } => command.execute(&cli.config, store).await,
        Commands::Stats(command) => command.execute(store).await,
    }
}
