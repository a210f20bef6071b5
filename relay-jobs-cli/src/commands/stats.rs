//! Execution statistics commands

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use console::style;
use relay_jobs::store::SharedStore;
use relay_jobs::tracker::ExecutionTracker;

/// Show execution statistics for one or more job types
#[derive(Debug, Args)]
pub struct StatsCommand {
    /// Job types to aggregate
    #[arg(required = true)]
    job_types: Vec<String>,

    /// Aggregation window in seconds
    #[arg(short, long, default_value = "3600")]
    window_secs: u64,

    /// Emit Prometheus-style exposition text instead of a table
    #[arg(long)]
    prometheus: bool,
}

impl StatsCommand {
    /// Execute the stats command against the shared store.
    ///
    /// # Errors
    ///
    /// Fails if the store is unreachable.
    pub async fn execute(&self, store: Arc<dyn SharedStore>) -> Result<()> {
        let tracker = ExecutionTracker::new(store);
        let window = Duration::from_secs(self.window_secs);

        if self.prometheus {
            let names: Vec<&str> = self.job_types.iter().map(String::as_str).collect();
            print!("{}", tracker.render_metrics(&names, window).await?);
            return Ok(());
        }

        println!(
            "{:<20} {:>8} {:>9} {:>10} {:>10} {:>10} {:>10}",
            style("JOB TYPE").bold(),
            style("COUNT").bold(),
            style("SUCCESS").bold(),
            style("P50 MS").bold(),
            style("P95 MS").bold(),
            style("P99 MS").bold(),
            style("QUEUE MS").bold(),
        );
        for job_type in &self.job_types {
            let stats = tracker.stats(job_type, window).await?;
            println!(
                "{:<20} {:>8} {:>8.1}% {:>10} {:>10} {:>10} {:>10}",
                stats.job_type,
                stats.count,
                stats.success_rate * 100.0,
                stats.p50_execution_ms,
                stats.p95_execution_ms,
                stats.p99_execution_ms,
                stats.avg_queue_ms,
            );
        }
        Ok(())
    }
}
