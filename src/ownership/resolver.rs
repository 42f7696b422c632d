//! Bucket owner resolution with caching and circuit breaking
//!
//! Resolution never fails. Every problem along the way folds into the
//! sentinel owner `"-"` so that a measurement can always be recorded:
//!
//! 1. Empty or sentinel bucket names resolve to `"-"` without any lookup.
//! 2. A cached owner is returned immediately.
//! 3. On a miss, one admin-service call runs through the circuit breaker.
//! 4. Only successful lookups are cached. Failures are never cached, so the
//!    next request for the bucket tries again once the breaker allows it.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::models::OwnershipConfig;
use crate::helpers::identity::SENTINEL;
use crate::logging::sanitize_log_message;
use crate::middleware::circuit_breaker::{BreakerError, CircuitBreaker, CircuitBreakerConfig};
use crate::observability::registry::MetricsRegistry;

use super::cache::{ExpiringCache, Sweeper};
use super::client::{AdminClient, AdminClientConfig, AdminError, HttpAdminClient};

/// How a single resolution ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupOutcome {
    /// Served from cache
    Hit,
    /// Cache miss answered by the admin service
    MissResolved,
    /// Cache miss while the breaker was open
    Rejected,
    /// Cache miss and the lookup failed
    Failed,
    /// No lookup needed or resolution disabled
    Skipped,
}

impl LookupOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            LookupOutcome::Hit => "hit",
            LookupOutcome::MissResolved => "miss_resolved",
            LookupOutcome::Rejected => "rejected",
            LookupOutcome::Failed => "failed",
            LookupOutcome::Skipped => "skipped",
        }
    }
}

/// Resolves bucket names to owner ids
pub struct OwnershipResolver {
    client: Option<Arc<dyn AdminClient>>,
    cache: ExpiringCache<String, String>,
    breaker: CircuitBreaker,
    cache_ttl: Duration,
    registry: Option<Arc<MetricsRegistry>>,
}

impl OwnershipResolver {
    pub fn new(client: Arc<dyn AdminClient>, breaker: CircuitBreaker, cache_ttl: Duration) -> Self {
        Self {
            client: Some(client),
            cache: ExpiringCache::new(),
            breaker,
            cache_ttl,
            registry: None,
        }
    }

    /// A resolver that answers `"-"` for every bucket
    pub fn disabled() -> Self {
        Self {
            client: None,
            cache: ExpiringCache::new(),
            breaker: CircuitBreaker::new("admin", CircuitBreakerConfig::default()),
            cache_ttl: Duration::ZERO,
            registry: None,
        }
    }

    /// Build the production resolver from configuration
    ///
    /// Without an admin endpoint the resolver is disabled.
    pub fn from_config(
        config: &OwnershipConfig,
        registry: Arc<MetricsRegistry>,
    ) -> Result<Self, AdminError> {
        let Some(endpoint) = config.admin_endpoint.clone() else {
            debug!("No admin endpoint configured, bucket owner resolution disabled");
            return Ok(Self::disabled().with_registry(registry));
        };

        let client = HttpAdminClient::new(AdminClientConfig {
            endpoint,
            signing_secret: config.signing_secret.clone(),
            token_ttl: Duration::from_secs(config.token_ttl_seconds),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
        })?;

        let breaker = CircuitBreaker::new("admin", config.breaker.to_breaker_config())
            .with_registry(Arc::clone(&registry));

        Ok(Self::new(
            Arc::new(client),
            breaker,
            Duration::from_secs(config.cache_ttl_seconds),
        )
        .with_registry(registry))
    }

    /// Count lookup outcomes in `registry`
    ///
    /// The breaker is not touched; give it its own registry handle to count
    /// state transitions.
    pub fn with_registry(mut self, registry: Arc<MetricsRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.client.is_some()
    }

    pub fn cache(&self) -> &ExpiringCache<String, String> {
        &self.cache
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Start the periodic removal of expired owners
    pub fn start_sweeper(&self, interval: Duration) -> Sweeper {
        self.cache.start_sweeper(interval)
    }

    /// Owner id of `bucket`, or `"-"` when it cannot be determined
    pub async fn resolve_owner(&self, bucket: &str) -> String {
        let (owner, outcome) = self.resolve(bucket).await;
        if let Some(registry) = &self.registry {
            registry.record_ownership_lookup(outcome.as_str());
        }
        owner
    }

    async fn resolve(&self, bucket: &str) -> (String, LookupOutcome) {
        let bucket = bucket.trim();
        if bucket.is_empty() || bucket == SENTINEL {
            return (SENTINEL.to_string(), LookupOutcome::Skipped);
        }

        let Some(client) = &self.client else {
            return (SENTINEL.to_string(), LookupOutcome::Skipped);
        };

        if let Some(owner) = self.cache.get(bucket).await {
            return (owner, LookupOutcome::Hit);
        }

        let result = self
            .breaker
            .call(|| {
                let client = Arc::clone(client);
                let bucket = bucket.to_string();
                async move { client.lookup_owner(&bucket).await }
            })
            .await;

        match result {
            Ok(owner) => {
                debug!(bucket = %bucket, owner = %owner, "Resolved bucket owner");
                self.cache
                    .put(bucket.to_string(), owner.clone(), self.cache_ttl)
                    .await;
                (owner, LookupOutcome::MissResolved)
            }
            Err(BreakerError::Open) => {
                debug!(bucket = %bucket, "Admin service circuit open, owner unknown");
                (SENTINEL.to_string(), LookupOutcome::Rejected)
            }
            Err(e) => {
                warn!(
                    bucket = %bucket,
                    error = %sanitize_log_message(&e.to_string()),
                    "Bucket owner lookup failed"
                );
                (SENTINEL.to_string(), LookupOutcome::Failed)
            }
        }
    }
}

impl std::fmt::Debug for OwnershipResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnershipResolver")
            .field("enabled", &self.is_enabled())
            .field("breaker", &self.breaker)
            .field("cache_ttl", &self.cache_ttl)
            .finish_non_exhaustive()
    }
}
