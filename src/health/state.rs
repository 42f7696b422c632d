use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::info;

use crate::middleware::circuit_breaker::CircuitState;
use crate::ownership::resolver::OwnershipResolver;

/// Name under which the bucket-ownership resolver is reported
pub const OWNERSHIP_SERVICE: &str = "ownership";

/// Health status for individual services
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Service is fully operational
    Healthy,
    /// Service is operational but with reduced capacity
    Degraded,
    /// Service is not operational
    Unhealthy,
    /// Service is still starting up
    Starting,
}

/// Information about a service's health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub status: HealthStatus,
    pub message: String,
    pub last_checked: Option<std::time::SystemTime>,
    pub metadata: HashMap<String, String>,
}

/// Overall health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Worst status of all services
    pub status: HealthStatus,
    pub services: HashMap<String, ServiceHealth>,
    pub timestamp: std::time::SystemTime,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone)]
struct CachedHealth {
    response: HealthResponse,
    cached_at: Instant,
    ttl: Duration,
}

impl CachedHealth {
    fn new(response: HealthResponse, ttl: Duration) -> Self {
        Self {
            response,
            cached_at: Instant::now(),
            ttl,
        }
    }

    fn is_expired(&self) -> bool {
        self.cached_at.elapsed() > self.ttl
    }

    fn is_stale(&self, max_stale: Duration) -> bool {
        self.cached_at.elapsed() > (self.ttl + max_stale)
    }
}

/// Readiness state with a short-lived cached snapshot
///
/// Besides the services reported through [`HealthManager::update_service_health`],
/// every refresh probes the ownership resolver (when one is attached): its
/// breaker state decides whether bucket owners can currently be resolved,
/// and the owner cache size is reported alongside.
#[derive(Debug, Clone)]
pub struct HealthManager {
    services: Arc<RwLock<HashMap<String, ServiceHealth>>>,
    cache: Arc<RwLock<Option<CachedHealth>>>,
    resolver: Option<Arc<OwnershipResolver>>,
    startup_time: Instant,
    cache_ttl: Duration,
    max_stale_duration: Duration,
    startup_grace_period: Duration,
}

impl HealthManager {
    pub fn new() -> Self {
        let mut services = HashMap::new();
        services.insert(
            "api".to_string(),
            ServiceHealth {
                status: HealthStatus::Starting,
                message: "Gateway starting up".to_string(),
                last_checked: Some(std::time::SystemTime::now()),
                metadata: HashMap::new(),
            },
        );

        Self {
            services: Arc::new(RwLock::new(services)),
            cache: Arc::new(RwLock::new(None)),
            resolver: None,
            startup_time: Instant::now(),
            cache_ttl: Duration::from_secs(5),
            max_stale_duration: Duration::from_secs(30),
            startup_grace_period: Duration::from_secs(30),
        }
    }

    /// Report the ownership resolver's breaker and cache on every refresh
    pub fn with_resolver(mut self, resolver: Arc<OwnershipResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Mark the gateway as ready (called once the listener is bound)
    pub async fn mark_ready(&self) {
        let mut services = self.services.write().await;
        if let Some(api_service) = services.get_mut("api") {
            api_service.status = HealthStatus::Healthy;
            api_service.message = "Gateway is ready".to_string();
            api_service.last_checked = Some(std::time::SystemTime::now());
        }
        drop(services);

        *self.cache.write().await = None;
        info!("Gateway marked as ready");
    }

    pub async fn update_service_health(
        &self,
        service_name: &str,
        status: HealthStatus,
        message: String,
    ) {
        let mut services = self.services.write().await;
        let mut metadata = HashMap::new();
        metadata.insert("updated_at".to_string(), chrono::Utc::now().to_rfc3339());

        services.insert(
            service_name.to_string(),
            ServiceHealth {
                status: status.clone(),
                message,
                last_checked: Some(std::time::SystemTime::now()),
                metadata,
            },
        );
        drop(services);

        *self.cache.write().await = None;
        info!(service = service_name, ?status, "Updated service health");
    }

    /// Current health, served from the cached snapshot while it is fresh
    pub async fn get_health(&self) -> HealthResponse {
        let cache_guard = self.cache.read().await;
        if let Some(cached) = &*cache_guard {
            if !cached.is_expired() {
                return cached.response.clone();
            }
            // Expired but not stale: serve it and refresh in the background
            if !cached.is_stale(self.max_stale_duration) {
                let stale_response = cached.response.clone();
                drop(cache_guard);

                tokio::spawn({
                    let health_manager = self.clone();
                    async move {
                        health_manager.refresh_health().await;
                    }
                });

                return stale_response;
            }
        }
        drop(cache_guard);

        self.refresh_health().await
    }

    async fn refresh_health(&self) -> HealthResponse {
        let mut services = self.services.read().await.clone();

        if let Some(resolver) = &self.resolver {
            services.insert(
                OWNERSHIP_SERVICE.to_string(),
                ownership_health(resolver).await,
            );
        }

        let overall_status = services
            .values()
            .map(|s| &s.status)
            .min_by_key(|status| status_priority(status))
            .cloned()
            .unwrap_or(HealthStatus::Healthy);

        let response = HealthResponse {
            status: overall_status,
            services,
            timestamp: std::time::SystemTime::now(),
            uptime_seconds: self.startup_time.elapsed().as_secs(),
        };

        *self.cache.write().await = Some(CachedHealth::new(response.clone(), self.cache_ttl));

        response
    }

    pub fn is_in_startup_period(&self) -> bool {
        self.startup_time.elapsed() < self.startup_grace_period
    }
}

impl Default for HealthManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Lower is worse
fn status_priority(status: &HealthStatus) -> u8 {
    match status {
        HealthStatus::Unhealthy => 0,
        HealthStatus::Starting => 1,
        HealthStatus::Degraded => 2,
        HealthStatus::Healthy => 3,
    }
}

async fn ownership_health(resolver: &OwnershipResolver) -> ServiceHealth {
    let mut metadata = HashMap::new();

    if !resolver.is_enabled() {
        return ServiceHealth {
            status: HealthStatus::Healthy,
            message: "Bucket ownership resolution disabled".to_string(),
            last_checked: Some(std::time::SystemTime::now()),
            metadata,
        };
    }

    let breaker = resolver.breaker().stats().await;
    let cache = resolver.cache().stats().await;

    metadata.insert("breaker_state".to_string(), breaker.state.as_str().to_string());
    metadata.insert(
        "breaker_rejected".to_string(),
        breaker.rejected_operations.to_string(),
    );
    metadata.insert("cache_entries".to_string(), cache.entries.to_string());
    metadata.insert("cache_hits".to_string(), cache.hits.to_string());
    metadata.insert("cache_misses".to_string(), cache.misses.to_string());

    let (status, message) = match breaker.state {
        CircuitState::Closed => (
            HealthStatus::Healthy,
            "Admin service reachable".to_string(),
        ),
        CircuitState::Open => (
            HealthStatus::Degraded,
            match breaker.time_until_half_open {
                Some(wait) => format!(
                    "Admin service breaker open, retrying in {}s",
                    wait.as_secs()
                ),
                None => "Admin service breaker open".to_string(),
            },
        ),
        CircuitState::HalfOpen => (
            HealthStatus::Degraded,
            "Admin service breaker probing".to_string(),
        ),
    };

    ServiceHealth {
        status,
        message,
        last_checked: Some(std::time::SystemTime::now()),
        metadata,
    }
}
