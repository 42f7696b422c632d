//! Per-request telemetry middleware
//!
//! Wraps every request except the exposition endpoint itself. For each one
//! it records the basic HTTP family (labelled by host, address family and
//! protocol) and the tenant family (labelled by bucket, method, status,
//! internal/external peer and bucket owner).
//!
//! The response is returned unchanged apart from its body being wrapped in a
//! [`MeteredBody`]. Measurements are recorded when that body finishes or is
//! dropped, so byte counts and total duration cover the whole transfer.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use axum::{Router, middleware::from_fn_with_state, routing::get};
//! use bucket_telemetry::helpers::network::NetworkClassifier;
//! use bucket_telemetry::middleware::metrics::{MetricsLayerState, metrics_middleware};
//! use bucket_telemetry::observability::registry::MetricsRegistry;
//! use bucket_telemetry::ownership::resolver::OwnershipResolver;
//!
//! let registry = Arc::new(MetricsRegistry::new("gateway", "http").unwrap());
//! let state = MetricsLayerState::new(
//!     registry,
//!     Arc::new(OwnershipResolver::disabled()),
//!     NetworkClassifier::with_default_ranges(),
//!     "s3.example.com",
//! );
//!
//! let app: Router = Router::new()
//!     .route("/{*path}", get(|| async { "ok" }))
//!     .layer(from_fn_with_state(state, metrics_middleware));
//! ```

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{Version, header::HOST},
    middleware::Next,
    response::Response,
};
use tokio::time::Instant;
use tracing::trace;

use crate::error::HandlerFailure;
use crate::helpers::identity::{self, bucket_label, host_label};
use crate::helpers::network::{NetworkClassifier, address_family};
use crate::observability::registry::{MetricsRegistry, RequestMeasurement};
use crate::ownership::resolver::OwnershipResolver;

use super::body::{BodyStats, MeteredBody};

/// Shared state of the metrics middleware
#[derive(Clone)]
pub struct MetricsLayerState {
    registry: Arc<MetricsRegistry>,
    resolver: Arc<OwnershipResolver>,
    classifier: Arc<NetworkClassifier>,
    s3_endpoint: Arc<str>,
    hostname: Option<Arc<str>>,
    excluded_paths: Arc<Vec<String>>,
}

impl MetricsLayerState {
    pub fn new(
        registry: Arc<MetricsRegistry>,
        resolver: Arc<OwnershipResolver>,
        classifier: NetworkClassifier,
        s3_endpoint: &str,
    ) -> Self {
        Self {
            registry,
            resolver,
            classifier: Arc::new(classifier),
            s3_endpoint: Arc::from(s3_endpoint),
            hostname: None,
            excluded_paths: Arc::new(Vec::new()),
        }
    }

    /// Use a fixed `host` label instead of the request host
    pub fn with_hostname(mut self, hostname: Option<&str>) -> Self {
        self.hostname = hostname
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(Arc::from);
        self
    }

    /// Skip instrumentation for requests to `path`
    pub fn exclude_path(mut self, path: &str) -> Self {
        Arc::make_mut(&mut self.excluded_paths).push(path.to_string());
        self
    }

    pub fn registry(&self) -> &Arc<MetricsRegistry> {
        &self.registry
    }
}

/// Status to report for a finished request
///
/// `returned` is the status the handler chain reported, `failed` whether it
/// also reported an error, `observed` the status actually written. A zero
/// status with an error becomes 500; a zero status without one falls back
/// to the written status.
///
/// Inside an axum stack the returned status is never zero, so
/// [`metrics_middleware`] always records the response status as is. The
/// zero cases exist for embedders that drive the recorder from a stack
/// where a handler can fail before choosing a status.
pub fn normalize_status(returned: u16, failed: bool, observed: u16) -> u16 {
    match (returned, failed) {
        (0, true) => 500,
        (0, false) => observed,
        (status, _) => status,
    }
}

/// `proto` label for an HTTP version
pub fn proto_label(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_11 => "1.1",
        Version::HTTP_2 => "2.0",
        Version::HTTP_3 => "3.0",
        _ => "1.1",
    }
}

/// Host the client addressed: the `Host` header, else the URI authority
fn request_host(request: &Request) -> String {
    request
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| request.uri().authority().map(|a| a.as_str().to_string()))
        .unwrap_or_default()
}

fn peer_ip(request: &Request) -> Option<IpAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

/// Metrics middleware, mounted with `axum::middleware::from_fn_with_state`
pub async fn metrics_middleware(
    State(state): State<MetricsLayerState>,
    request: Request,
    next: Next,
) -> Response {
    if state
        .excluded_paths
        .iter()
        .any(|path| request.uri().path() == path)
    {
        return next.run(request).await;
    }

    let start = Instant::now();

    let peer = peer_ip(&request);
    let method = request.method().to_string();
    let proto = proto_label(request.version());
    let host = request_host(&request);
    let path = request.uri().path().to_string();

    let response = next.run(request).await;
    let upstream_duration = start.elapsed();

    let observed = response.status().as_u16();
    let failed = response.extensions().get::<HandlerFailure>().is_some();
    let status = normalize_status(observed, failed, observed);

    let (bucket, _) = identity::extract(&state.s3_endpoint, &host, &path);
    let bucket = bucket_label(&bucket);
    let owner_id = state.resolver.resolve_owner(&bucket).await;

    let host = match &state.hostname {
        Some(hostname) => hostname.to_string(),
        None => host_label(&host),
    };

    // Owner lookup latency is not part of the request latency
    let time_to_first_byte = upstream_duration;
    let pending = RequestMeasurement {
        host,
        family: address_family(peer),
        proto,
        status,
        bucket_name: bucket,
        method,
        internal: state.classifier.internal_label(peer),
        owner_id,
        byte_size: 0,
        total_duration: time_to_first_byte,
        time_to_first_byte,
        upstream_duration,
    };

    let registry = Arc::clone(&state.registry);
    let (parts, body) = response.into_parts();
    let body = MeteredBody::new(body, move |stats: BodyStats| {
        let measurement = RequestMeasurement {
            byte_size: stats.bytes,
            total_duration: start.elapsed(),
            ..pending
        };
        trace!(
            bucket = %measurement.bucket_name,
            owner = %measurement.owner_id,
            status = measurement.status,
            bytes = measurement.byte_size,
            completed = stats.completed,
            "Recording request measurement"
        );
        registry.record_request(&measurement);
    });

    Response::from_parts(parts, Body::new(body))
}
