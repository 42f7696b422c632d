//! Metrics registry and its Prometheus exposition endpoint

pub mod endpoint;
pub mod registry;

pub use endpoint::{metrics_endpoint, metrics_router};
pub use registry::{MetricNames, MetricsRegistry, RequestMeasurement};
