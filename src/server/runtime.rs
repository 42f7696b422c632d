use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    Router,
    middleware::{from_fn, from_fn_with_state},
    routing::get,
};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::health::{HealthManager, liveness_handler, readiness_handler};
use crate::logging::trace_requests;
use crate::middleware::metrics::{MetricsLayerState, metrics_middleware};
use crate::observability::{MetricsRegistry, metrics_router};
use crate::ownership::OwnershipResolver;

use super::upstream::{self, UpstreamProxy};

/// Everything the gateway serves, wired from configuration
///
/// `app` is the main router. `metrics_app` is set when the exposition
/// endpoint lives on its own listener (`metrics.address`); otherwise the
/// endpoint is part of `app`.
pub struct Gateway {
    pub app: Router,
    pub metrics_app: Option<Router>,
    health: HealthManager,
    registry: Arc<MetricsRegistry>,
    resolver: Arc<OwnershipResolver>,
}

impl Gateway {
    pub fn build(config: &AppConfig) -> Result<Self> {
        let registry = Arc::new(
            MetricsRegistry::new(&config.metrics.namespace, &config.metrics.subsystem)
                .context("Failed to build metrics registry")?,
        );

        let resolver = Arc::new(
            OwnershipResolver::from_config(&config.ownership, Arc::clone(&registry))
                .context("Failed to build bucket ownership resolver")?,
        );

        let classifier = config
            .network
            .classifier()
            .context("Invalid private network range")?;

        let health = HealthManager::new().with_resolver(Arc::clone(&resolver));

        let mut metrics_state = MetricsLayerState::new(
            Arc::clone(&registry),
            Arc::clone(&resolver),
            classifier,
            &config.s3.endpoint,
        )
        .with_hostname(config.metrics.hostname.as_deref())
        .exclude_path(&config.health.liveness_path)
        .exclude_path(&config.health.readiness_path);

        let mut app = Router::new()
            .route(&config.health.liveness_path, get(liveness_handler))
            .route(&config.health.readiness_path, get(readiness_handler))
            .with_state(health.clone());

        let exposition = metrics_router(&config.metrics.path, Arc::clone(&registry));
        let metrics_app = if config.metrics.address.is_some() {
            Some(exposition)
        } else {
            metrics_state = metrics_state.exclude_path(&config.metrics.path);
            app = app.merge(exposition);
            None
        };

        if let Some(base) = &config.server.upstream {
            let proxy = UpstreamProxy::new(base).context("Failed to build upstream client")?;
            info!(upstream = %proxy.base(), "Forwarding unmatched requests upstream");
            app = app.fallback_service(
                Router::new()
                    .fallback(upstream::forward)
                    .with_state(Arc::new(proxy)),
            );
        }

        let app = app
            .layer(from_fn_with_state(metrics_state, metrics_middleware))
            .layer(from_fn(trace_requests));

        Ok(Self {
            app,
            metrics_app,
            health,
            registry,
            resolver,
        })
    }

    pub fn health(&self) -> &HealthManager {
        &self.health
    }

    pub fn registry(&self) -> &Arc<MetricsRegistry> {
        &self.registry
    }

    pub fn resolver(&self) -> &Arc<OwnershipResolver> {
        &self.resolver
    }
}

/// Bind the configured address and serve until SIGINT/SIGTERM
pub async fn start_server(config: AppConfig) -> Result<()> {
    let bind_addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await.with_context(|| {
        format!("Failed to bind to {bind_addr}. Is another process using this port?")
    })?;
    info!(address = %bind_addr, "Server bound");

    serve(config, listener, shutdown_signal()).await
}

/// Serve the gateway on `listener` until `shutdown` resolves
///
/// Starts the owner-cache sweeper and, when configured, the dedicated
/// metrics listener. After `shutdown`, in-flight requests get
/// `server.shutdown_timeout` seconds to finish; the sweeper is stopped
/// last.
pub async fn serve<F>(config: AppConfig, listener: TcpListener, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let gateway = Gateway::build(&config)?;
    let grace = Duration::from_secs(config.server.shutdown_timeout);

    let sweeper = gateway.resolver.start_sweeper(Duration::from_secs(
        config.ownership.cache_sweep_interval_seconds,
    ));

    let (stop_tx, stop_rx) = watch::channel(false);

    let metrics_server = match (&config.metrics.address, gateway.metrics_app.clone()) {
        (Some(address), Some(metrics_app)) => {
            let metrics_listener = TcpListener::bind(address)
                .await
                .with_context(|| format!("Failed to bind metrics listener to {address}"))?;
            info!(address = %address, path = %config.metrics.path, "Metrics listener bound");

            let server = axum::serve(metrics_listener, metrics_app)
                .with_graceful_shutdown(stopped(stop_rx.clone()));
            Some(tokio::spawn(server.into_future()))
        }
        _ => None,
    };

    let server = axum::serve(
        listener,
        gateway
            .app
            .clone()
            .into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(stopped(stop_rx));
    let mut server = tokio::spawn(server.into_future());

    gateway.health.mark_ready().await;
    info!("Gateway ready");

    let served = tokio::select! {
        result = &mut server => result.context("Server task failed")?.context("Server error"),
        _ = shutdown => {
            info!("Shutdown signal received, draining connections");
            let _ = stop_tx.send(true);
            match tokio::time::timeout(grace, &mut server).await {
                Ok(result) => result.context("Server task failed")?.context("Server error"),
                Err(_) => {
                    warn!(timeout_seconds = grace.as_secs(), "Graceful shutdown timed out");
                    server.abort();
                    Ok(())
                }
            }
        }
    };
    let _ = stop_tx.send(true);

    if let Some(metrics_server) = metrics_server {
        match tokio::time::timeout(grace, metrics_server).await {
            Ok(Ok(Err(e))) => error!(error = %e, "Metrics listener failed"),
            Ok(Err(e)) => error!(error = %e, "Metrics listener task failed"),
            Err(_) => warn!("Metrics listener did not stop in time"),
            Ok(Ok(Ok(()))) => {}
        }
    }

    sweeper.shutdown().await;
    info!("Server shutdown complete");

    served
}

async fn stopped(mut stop: watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        // A dropped sender also means stop
        if stop.changed().await.is_err() {
            break;
        }
    }
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT (Ctrl+C), starting graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, starting graceful shutdown"),
    }
}
