//! Dead-letter inspection commands

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Subcommand;
use console::style;
use relay_jobs::dead_letter::{DeadLetterFilter, DeadLetterId, DeadLetterStore};
use relay_jobs::store::SharedStore;

/// Dead-letter store commands
#[derive(Debug, Subcommand)]
pub enum DlqCommand {
    /// List dead-letter entries
    List {
        /// Only entries for this job type
        #[arg(short, long)]
        job_type: Option<String>,

        /// Include entries already reprocessed
        #[arg(short, long)]
        all: bool,

        /// Limit number of results
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show one entry in full, including its payload
    Show {
        /// Dead-letter entry id
        entry_id: String,
    },
}

impl DlqCommand {
    /// Execute the dead-letter command against the shared store.
    ///
    /// # Errors
    ///
    /// Fails if the store is unreachable or the entry id is malformed.
    pub async fn execute(&self, store: Arc<dyn SharedStore>) -> Result<()> {
        let dead_letters = DeadLetterStore::new(store);
        match self {
            Self::List {
                job_type,
                all,
                limit,
            } => Self::list(&dead_letters, job_type.as_deref(), *all, *limit).await,
            Self::Show { entry_id } => Self::show(&dead_letters, entry_id).await,
        }
    }

    async fn list(
        dead_letters: &DeadLetterStore,
        job_type: Option<&str>,
        all: bool,
        limit: usize,
    ) -> Result<()> {
        let filter = DeadLetterFilter {
            job_type: job_type.map(ToString::to_string),
            include_reprocessed: all,
            limit: Some(limit),
        };
        let entries = dead_letters.list(&filter).await?;

        if entries.is_empty() {
            println!("{}", style("Dead-letter store is empty").green());
            return Ok(());
        }

        println!(
            "{:<38} {:<20} {:<10} {:<9} {}",
            style("ENTRY").bold(),
            style("JOB TYPE").bold(),
            style("ATTEMPTS").bold(),
            style("KIND").bold(),
            style("ADMITTED").bold(),
        );
        for entry in entries {
            let marker = if entry.reprocessed {
                style("↻").dim().to_string()
            } else {
                " ".to_string()
            };
            println!(
                "{:<38} {:<20} {:<10} {:<9} {} {}",
                entry.id,
                entry.job_type,
                entry.total_attempts,
                entry.error_kind,
                entry.admitted_at.format("%Y-%m-%d %H:%M:%S"),
                marker,
            );
        }
        Ok(())
    }

    async fn show(dead_letters: &DeadLetterStore, entry_id: &str) -> Result<()> {
        let id = DeadLetterId::parse(entry_id)
            .with_context(|| format!("invalid dead-letter entry id: {entry_id}"))?;
        let entry = dead_letters
            .get(id)
            .await?
            .with_context(|| format!("no dead-letter entry {entry_id}"))?;

        println!("{}          {}", style("Entry:").bold(), entry.id);
        println!("{}         {}", style("Job id:").bold(), entry.job_id);
        println!("{}       {}", style("Job type:").bold(), entry.job_type);
        println!("{}          {}", style("Queue:").bold(), entry.queue);
        println!("{}       {}", style("Attempts:").bold(), entry.total_attempts);
        println!("{}     {}", style("Error kind:").bold(), entry.error_kind);
        println!("{}   {}", style("Error detail:").bold(), entry.error_detail);
        println!(
            "{}       {}",
            style("Admitted:").bold(),
            entry.admitted_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
        if entry.reprocessed {
            let as_job = entry
                .reprocessed_as
                .map_or_else(|| "?".to_string(), |id| id.to_string());
            println!(
                "{}    {} {}",
                style("Reprocessed:").bold(),
                style("yes").yellow(),
                style(format!("(as job {as_job})")).dim(),
            );
        }
        println!("{}", style("Payload:").bold());
        println!("{}", serde_json::to_string_pretty(&entry.payload)?);
        Ok(())
    }
}
