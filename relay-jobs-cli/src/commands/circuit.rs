//! Circuit breaker inspection and override commands

use std::sync::Arc;

use anyhow::Result;
use clap::Subcommand;
use console::style;
use relay_jobs::circuit::{CircuitBreaker, CircuitState};
use relay_jobs::store::SharedStore;

/// Circuit breaker commands
#[derive(Debug, Subcommand)]
pub enum CircuitCommand {
    /// Show the circuit for a downstream resource
    Show {
        /// Resource name (as configured in job type overrides)
        resource: String,
    },

    /// Force a circuit closed, discarding its failure history
    ForceClose {
        /// Resource name
        resource: String,
    },
}

impl CircuitCommand {
    /// Execute the circuit command against the shared store.
    ///
    /// # Errors
    ///
    /// Fails if the configuration or the store is unreachable.
    pub async fn execute(&self, config_path: &str, store: Arc<dyn SharedStore>) -> Result<()> {
        let config = super::load_config(config_path)?;
        let breaker = CircuitBreaker::new(store, config.circuit);
        match self {
            Self::Show { resource } => {
                let snapshot = breaker.snapshot(resource).await?;
                let state = match snapshot.state {
                    CircuitState::Closed => style("closed").green(),
                    CircuitState::Open => style("open").red(),
                    CircuitState::HalfOpen => style("half-open").yellow(),
                };
                println!("{}               {resource}", style("Resource:").bold());
                println!("{}                  {state}", style("State:").bold());
                println!(
                    "{}   {}",
                    style("Consecutive failures:").bold(),
                    snapshot.consecutive_failures
                );
                if let Some(opened_at) = snapshot.opened_at {
                    println!(
                        "{}              {}",
                        style("Opened at:").bold(),
                        opened_at.format("%Y-%m-%d %H:%M:%S UTC")
                    );
                }
                Ok(())
            }
            Self::ForceClose { resource } => {
                breaker.force_close(resource).await?;
                println!(
                    "{} circuit for {resource} forced closed",
                    style("✓").green()
                );
                Ok(())
            }
        }
    }
}
