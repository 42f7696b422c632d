//! HTTP middleware and the circuit breaker guarding admin-service calls

pub mod body;
pub mod circuit_breaker;
pub mod metrics;

pub use circuit_breaker::{BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use self::metrics::{MetricsLayerState, metrics_middleware};
