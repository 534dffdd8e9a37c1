//! Bootstrap utilities for herald binaries.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LOG_ENV_VAR, LOG_FORMAT_ENV_VAR};

/// Initialize tracing with the HERALD_LOG environment variable.
///
/// Defaults to "info" level if HERALD_LOG is not set. Set HERALD_LOG_FORMAT=json
/// for one JSON object per line.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if json_output(std::env::var(LOG_FORMAT_ENV_VAR).ok().as_deref()) {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn json_output(format: Option<&str>) -> bool {
    format.is_some_and(|f| f.eq_ignore_ascii_case("json"))
}

/// Wait for Ctrl+C, then flip `shutdown` to true.
pub async fn shutdown_on_ctrl_c(
    shutdown: tokio::sync::watch::Sender<bool>,
) -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");
    let _ = shutdown.send(true);
    Ok(())
}
