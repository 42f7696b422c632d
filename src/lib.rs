//! Per-tenant HTTP telemetry for an S3-compatible gateway
//!
//! Every request is attributed to the bucket it addresses and to that
//! bucket's owner, resolved through an admin service behind an expiring
//! cache and a circuit breaker. Measurements are exposed in the
//! Prometheus text format.

pub mod config;
pub mod error;
pub mod health;
pub mod helpers;
pub mod logging;
pub mod middleware;
pub mod observability;
pub mod ownership;
pub mod server;

pub use config::{AppConfig, load_config};
pub use error::AppError;

use anyhow::Result;
use std::panic;

/// Load configuration, install logging and serve until shutdown
pub async fn run_server() -> Result<()> {
    let app_config = config::load_config()?;

    if let Err(e) = logging::setup_tracing(&app_config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        return Err(e);
    }

    panic::set_hook(Box::new(|panic_info| {
        ::tracing::error!(?panic_info, "FATAL: Panic occurred");
        std::process::exit(1);
    }));

    ::tracing::info!(
        environment = ?app_config.environment,
        s3_endpoint = %app_config.s3.endpoint,
        ownership_enabled = app_config.ownership.admin_endpoint.is_some(),
        "bucket-telemetry starting up"
    );

    server::start_server(app_config).await
}
