//! CLI command implementations

pub mod circuit;
pub mod dlq;
pub mod stats;

use std::sync::Arc;

use anyhow::{Context, Result};
use relay_jobs::config::RelayConfig;
use relay_jobs::store::redis::RedisStore;
use relay_jobs::store::SharedStore;

pub use circuit::CircuitCommand;
pub use dlq::DlqCommand;
pub use stats::StatsCommand;

/// Connect to the deployment's shared store.
///
/// # Errors
///
/// Fails if the configuration is malformed, carries no `store_url`, or the
/// Redis pool cannot be created.
pub fn connect(config_path: &str) -> Result<Arc<dyn SharedStore>> {
    let config = load_config(config_path)?;
    let url = config.store_url.as_deref().context(
        "no store_url configured; the operator console needs the deployment's shared Redis",
    )?;
    let store = RedisStore::connect(url)
        .with_context(|| format!("failed to connect to shared store at {url}"))?;
    Ok(Arc::new(store))
}

/// Load the deployment configuration the tool operates against.
///
/// # Errors
///
/// Fails if the configuration file or environment overrides are malformed.
pub fn load_config(config_path: &str) -> Result<RelayConfig> {
    RelayConfig::load_from(config_path)
        .with_context(|| format!("failed to load configuration from {config_path}"))
}
