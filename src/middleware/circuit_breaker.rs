//! Circuit breaker for calls to external services
//!
//! Protects the request path from a slow or failing dependency such as the
//! bucket ownership admin service.
//!
//! # Circuit Breaker States
//!
//! 1. **Closed**: Normal operation. Outcomes are counted in a rolling window.
//! 2. **Open**: Every call is rejected without invoking the dependency.
//! 3. **HalfOpen**: A bounded number of trial calls test the dependency.
//!
//! # State Transitions
//!
//! - **Closed → Open**: the rolling window holds at least
//!   `request_volume_threshold` calls and `failure_threshold` failures
//! - **Open → HalfOpen**: `sleep_window` has elapsed (checked on the next call)
//! - **HalfOpen → Closed**: `success_threshold` consecutive trial successes
//! - **HalfOpen → Open**: any trial failure
//!
//! Each transition starts a new generation. An outcome reported by a call
//! admitted in an earlier generation only updates the totals, so a burst of
//! concurrent failures trips the breaker exactly once.
//!
//! # Usage
//!
//! ```rust
//! use bucket_telemetry::middleware::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let breaker = CircuitBreaker::new("admin", CircuitBreakerConfig {
//!     failure_threshold: 3,
//!     request_volume_threshold: 5,
//!     timeout: Duration::from_secs(1),
//!     ..Default::default()
//! });
//!
//! let result = breaker.call(|| async { Ok::<_, String>("owner") }).await;
//! assert_eq!(result.unwrap(), "owner");
//! # }
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::observability::registry::MetricsRegistry;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - calls pass through
    Closed,
    /// Failure mode - calls fail immediately
    Open,
    /// Recovery testing - limited calls allowed
    HalfOpen,
}

impl CircuitState {
    /// Lowercase label used in metrics and health reports
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "Closed"),
            CircuitState::Open => write!(f, "Open"),
            CircuitState::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Minimum calls in the rolling window before the breaker may trip
    pub request_volume_threshold: u32,
    /// Failures in the rolling window that trip the breaker
    pub failure_threshold: u32,
    /// Consecutive half-open successes needed to close the circuit
    pub success_threshold: u32,
    /// Concurrent trial calls admitted while half-open
    pub half_open_max_calls: u32,
    /// How long the circuit stays open before admitting trial calls
    pub sleep_window: Duration,
    /// Upper bound on each admitted call
    pub timeout: Duration,
    /// Span of the closed-state statistics window
    pub rolling_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            request_volume_threshold: 1,
            failure_threshold: 1,
            success_threshold: 1,
            half_open_max_calls: 1,
            sleep_window: Duration::from_secs(30),
            timeout: Duration::from_secs(1),
            rolling_window: Duration::from_secs(10),
        }
    }
}

/// Circuit breaker error
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// Circuit is open - call rejected
    #[error("circuit breaker is open")]
    Open,
    /// Operation exceeded the configured timeout
    #[error("operation timed out")]
    Timeout,
    /// Inner operation failed
    #[error("operation failed: {0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open)
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    /// Every call, admitted or rejected
    pub total_operations: u64,
    pub successful_operations: u64,
    /// Failed operations, timeouts included
    pub failed_operations: u64,
    pub timed_out_operations: u64,
    pub rejected_operations: u64,
    /// Success rate as percentage of all operations
    pub success_rate: f64,
    /// Calls recorded in the current rolling window
    pub window_requests: u32,
    /// Failures recorded in the current rolling window
    pub window_failures: u32,
    /// Consecutive trial successes while half-open
    pub consecutive_successes: u32,
    pub time_since_last_state_change: Duration,
    /// Time until trial calls are admitted (if open)
    pub time_until_half_open: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    Timeout,
}

/// Internal circuit breaker state
#[derive(Debug)]
struct CircuitBreakerState {
    state: CircuitState,
    generation: u64,
    /// `(recorded_at, failed)` for closed-state calls inside the window
    window: VecDeque<(Instant, bool)>,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    last_state_change: Instant,
    /// Trial permits for the current half-open generation
    trial_permits: Option<Arc<Semaphore>>,
    total_operations: u64,
    successful_operations: u64,
    failed_operations: u64,
    timed_out_operations: u64,
    rejected_operations: u64,
}

impl CircuitBreakerState {
    fn new(generation: u64) -> Self {
        Self {
            state: CircuitState::Closed,
            generation,
            window: VecDeque::new(),
            consecutive_successes: 0,
            opened_at: None,
            last_state_change: Instant::now(),
            trial_permits: None,
            total_operations: 0,
            successful_operations: 0,
            failed_operations: 0,
            timed_out_operations: 0,
            rejected_operations: 0,
        }
    }

    fn prune_window(&mut self, now: Instant, span: Duration) {
        while let Some((recorded_at, _)) = self.window.front() {
            if now.saturating_duration_since(*recorded_at) > span {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn window_counts(&self) -> (u32, u32) {
        let requests = self.window.len() as u32;
        let failures = self.window.iter().filter(|(_, failed)| *failed).count() as u32;
        (requests, failures)
    }
}

/// Admission ticket for one call
struct Admission {
    generation: u64,
    /// Held for the duration of a half-open trial; released on drop
    _trial: Option<OwnedSemaphorePermit>,
}

/// Circuit breaker implementation
pub struct CircuitBreaker {
    name: Arc<str>,
    config: CircuitBreakerConfig,
    state: Arc<RwLock<CircuitBreakerState>>,
    registry: Option<Arc<MetricsRegistry>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    ///
    /// `name` identifies the protected dependency in logs and metrics.
    pub fn new(name: impl Into<Arc<str>>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        debug!(
            breaker = %name,
            request_volume_threshold = config.request_volume_threshold,
            failure_threshold = config.failure_threshold,
            success_threshold = config.success_threshold,
            half_open_max_calls = config.half_open_max_calls,
            sleep_window_ms = config.sleep_window.as_millis() as u64,
            timeout_ms = config.timeout.as_millis() as u64,
            "Creating circuit breaker"
        );

        Self {
            name,
            config,
            state: Arc::new(RwLock::new(CircuitBreakerState::new(0))),
            registry: None,
        }
    }

    /// Count state transitions in `registry`
    pub fn with_registry(mut self, registry: Arc<MetricsRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Execute an operation through the circuit breaker
    ///
    /// # Returns
    ///
    /// * `Ok(T)` - Operation succeeded
    /// * `Err(BreakerError::Open)` - Rejected without invoking `f`
    /// * `Err(BreakerError::Timeout)` - `f` did not finish within the timeout
    /// * `Err(BreakerError::Inner(e))` - `f` failed
    ///
    /// If the returned future is dropped while `f` is running, the call is
    /// counted as neither success nor failure.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let Some(admission) = self.admit().await else {
            debug!(breaker = %self.name, "Circuit breaker is open - rejecting call");
            return Err(BreakerError::Open);
        };

        let start = Instant::now();
        let result = tokio::time::timeout(self.config.timeout, f()).await;
        let duration = start.elapsed();

        match result {
            Ok(Ok(value)) => {
                self.record(&admission, Outcome::Success).await;
                debug!(
                    breaker = %self.name,
                    duration_ms = duration.as_millis() as u64,
                    "Circuit breaker: operation succeeded"
                );
                Ok(value)
            }
            Ok(Err(e)) => {
                self.record(&admission, Outcome::Failure).await;
                warn!(
                    breaker = %self.name,
                    error = %e,
                    duration_ms = duration.as_millis() as u64,
                    "Circuit breaker: operation failed"
                );
                Err(BreakerError::Inner(e))
            }
            Err(_) => {
                self.record(&admission, Outcome::Timeout).await;
                warn!(
                    breaker = %self.name,
                    timeout_ms = self.config.timeout.as_millis() as u64,
                    "Circuit breaker: operation timed out"
                );
                Err(BreakerError::Timeout)
            }
        }
    }

    /// Decide whether a call may proceed, moving Open → HalfOpen when due
    async fn admit(&self) -> Option<Admission> {
        let mut state = self.state.write().await;
        state.total_operations += 1;

        if state.state == CircuitState::Open {
            let due = state
                .opened_at
                .is_none_or(|opened_at| opened_at.elapsed() >= self.config.sleep_window);
            if !due {
                state.rejected_operations += 1;
                return None;
            }
            self.transition(&mut state, CircuitState::HalfOpen);
        }

        match state.state {
            CircuitState::Closed => Some(Admission {
                generation: state.generation,
                _trial: None,
            }),
            CircuitState::HalfOpen => {
                let permit = state
                    .trial_permits
                    .as_ref()
                    .and_then(|permits| Arc::clone(permits).try_acquire_owned().ok());
                match permit {
                    Some(permit) => Some(Admission {
                        generation: state.generation,
                        _trial: Some(permit),
                    }),
                    None => {
                        state.rejected_operations += 1;
                        None
                    }
                }
            }
            CircuitState::Open => {
                state.rejected_operations += 1;
                None
            }
        }
    }

    async fn record(&self, admission: &Admission, outcome: Outcome) {
        let mut state = self.state.write().await;

        match outcome {
            Outcome::Success => state.successful_operations += 1,
            Outcome::Failure => state.failed_operations += 1,
            Outcome::Timeout => {
                state.failed_operations += 1;
                state.timed_out_operations += 1;
            }
        }

        if admission.generation != state.generation {
            debug!(
                breaker = %self.name,
                admitted_generation = admission.generation,
                current_generation = state.generation,
                "Circuit breaker: ignoring outcome from earlier state"
            );
            return;
        }

        let failed = outcome != Outcome::Success;
        match state.state {
            CircuitState::Closed => {
                let now = Instant::now();
                state.window.push_back((now, failed));
                state.prune_window(now, self.config.rolling_window);

                let (requests, failures) = state.window_counts();
                if failed
                    && requests >= self.config.request_volume_threshold
                    && failures >= self.config.failure_threshold
                {
                    self.transition(&mut state, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                if failed {
                    self.transition(&mut state, CircuitState::Open);
                } else {
                    state.consecutive_successes += 1;
                    if state.consecutive_successes >= self.config.success_threshold {
                        self.transition(&mut state, CircuitState::Closed);
                    }
                }
            }
            CircuitState::Open => {}
        }
    }

    fn transition(&self, state: &mut CircuitBreakerState, to: CircuitState) {
        let from = state.state;
        if from == to {
            return;
        }

        let (window_requests, window_failures) = state.window_counts();
        match to {
            CircuitState::Open => warn!(
                breaker = %self.name,
                previous_state = %from,
                window_requests = window_requests,
                window_failures = window_failures,
                sleep_window_ms = self.config.sleep_window.as_millis() as u64,
                "Circuit breaker: transitioning to OPEN"
            ),
            CircuitState::HalfOpen => info!(
                breaker = %self.name,
                previous_state = %from,
                "Circuit breaker: transitioning to HALF-OPEN"
            ),
            CircuitState::Closed => info!(
                breaker = %self.name,
                previous_state = %from,
                consecutive_successes = state.consecutive_successes,
                "Circuit breaker: transitioning to CLOSED"
            ),
        }

        let now = Instant::now();
        state.state = to;
        state.generation += 1;
        state.last_state_change = now;
        state.consecutive_successes = 0;
        state.window.clear();
        state.opened_at = (to == CircuitState::Open).then_some(now);
        state.trial_permits = (to == CircuitState::HalfOpen).then(|| {
            Arc::new(Semaphore::new(self.config.half_open_max_calls.max(1) as usize))
        });

        if let Some(registry) = &self.registry {
            registry.record_breaker_transition(&self.name, to.as_str());
        }
    }

    /// Get current circuit breaker state
    ///
    /// An Open circuit whose sleep window has elapsed is still reported as
    /// Open until the next call moves it to HalfOpen.
    pub async fn state(&self) -> CircuitState {
        self.state.read().await.state
    }

    pub async fn is_open(&self) -> bool {
        self.state().await == CircuitState::Open
    }

    pub async fn is_closed(&self) -> bool {
        self.state().await == CircuitState::Closed
    }

    pub async fn stats(&self) -> CircuitBreakerStats {
        let state = self.state.read().await;

        let success_rate = if state.total_operations > 0 {
            (state.successful_operations as f64 / state.total_operations as f64) * 100.0
        } else {
            0.0
        };

        let time_until_half_open = match (state.state, state.opened_at) {
            (CircuitState::Open, Some(opened_at)) => {
                Some(self.config.sleep_window.saturating_sub(opened_at.elapsed()))
            }
            _ => None,
        };

        let (window_requests, window_failures) = state.window_counts();

        CircuitBreakerStats {
            state: state.state,
            total_operations: state.total_operations,
            successful_operations: state.successful_operations,
            failed_operations: state.failed_operations,
            timed_out_operations: state.timed_out_operations,
            rejected_operations: state.rejected_operations,
            success_rate,
            window_requests,
            window_failures,
            consecutive_successes: state.consecutive_successes,
            time_since_last_state_change: state.last_state_change.elapsed(),
            time_until_half_open,
        }
    }

    /// Reset to a fresh Closed state with zeroed counters
    ///
    /// Outcomes of calls admitted before the reset are ignored.
    pub async fn reset(&self) {
        let mut state = self.state.write().await;

        info!(
            breaker = %self.name,
            previous_state = %state.state,
            total_operations = state.total_operations,
            "Circuit breaker: manual reset"
        );

        let previous = state.state;
        *state = CircuitBreakerState::new(state.generation + 1);

        if previous != CircuitState::Closed {
            if let Some(registry) = &self.registry {
                registry.record_breaker_transition(&self.name, CircuitState::Closed.as_str());
            }
        }
    }
}

impl Clone for CircuitBreaker {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            config: self.config.clone(),
            state: Arc::clone(&self.state),
            registry: self.registry.clone(),
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
