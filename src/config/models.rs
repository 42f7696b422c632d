use std::time::Duration;

use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::helpers::network::{DEFAULT_PRIVATE_RANGES, NetworkClassifier};
use crate::middleware::circuit_breaker::CircuitBreakerConfig;

#[derive(Debug, Deserialize, Serialize, Validate, Default)]
pub struct AppConfig {
    #[garde(dive)]
    #[serde(default)]
    pub server: ServerConfig,

    #[garde(dive)]
    #[serde(default)]
    pub logging: LoggingConfig,

    #[garde(dive)]
    #[serde(default)]
    pub health: HealthConfig,

    #[garde(dive)]
    #[serde(default)]
    pub metrics: MetricsConfig,

    #[garde(dive)]
    #[serde(default)]
    pub s3: S3Config,

    #[garde(dive)]
    #[serde(default)]
    pub network: NetworkConfig,

    #[garde(dive)]
    #[serde(default)]
    pub ownership: OwnershipConfig,

    #[garde(skip)]
    #[serde(default)]
    pub environment: Environment,
}

#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct ServerConfig {
    #[garde(range(min = 1024, max = 65535))]
    pub port: u16,

    #[garde(length(min = 1), custom(validate_bind_address))]
    #[serde(default = "default_bind")]
    pub bind: String,

    #[garde(range(min = 1, max = 300))]
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64, // seconds

    /// S3 gateway that unmatched requests are forwarded to
    #[garde(custom(validate_optional_http_url))]
    #[serde(default)]
    pub upstream: Option<String>,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_shutdown_timeout() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            bind: "0.0.0.0".to_string(),
            shutdown_timeout: 30,
            upstream: None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct LoggingConfig {
    #[garde(length(min = 1))]
    #[serde(default = "default_log_level")]
    pub level: String, // trace, debug, info, warn, error

    #[garde(pattern(r"^(json|pretty)$"))]
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct HealthConfig {
    #[garde(length(min = 1), custom(validate_route_path))]
    #[serde(default = "default_liveness_path")]
    pub liveness_path: String,

    #[garde(length(min = 1), custom(validate_route_path))]
    #[serde(default = "default_readiness_path")]
    pub readiness_path: String,
}

fn default_liveness_path() -> String {
    "/health".to_string()
}

fn default_readiness_path() -> String {
    "/health/ready".to_string()
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            liveness_path: default_liveness_path(),
            readiness_path: default_readiness_path(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct MetricsConfig {
    /// Exposition path, served on `address` if set, otherwise on the main listener
    #[garde(length(min = 1), custom(validate_route_path))]
    pub path: String,

    /// Dedicated `ip:port` listener for the exposition endpoint
    #[garde(custom(validate_optional_socket_addr))]
    pub address: Option<String>,

    /// Fixed `host` label, overriding the request host
    #[garde(skip)]
    pub hostname: Option<String>,

    #[garde(pattern(r"^[a-zA-Z_]?[a-zA-Z0-9_]*$"))]
    pub namespace: String,

    #[garde(pattern(r"^[a-zA-Z_][a-zA-Z0-9_]*$"))]
    pub subsystem: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            path: "/metrics".to_string(),
            address: None,
            hostname: None,
            namespace: "gateway".to_string(),
            subsystem: "http".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Validate, Default)]
#[serde(default)]
pub struct S3Config {
    /// Service endpoint for virtual-hosted bucket addressing; empty disables it
    #[garde(skip)]
    pub endpoint: String,
}

#[derive(Debug, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct NetworkConfig {
    /// CIDR ranges whose peers are labelled `internal="y"`
    #[garde(custom(validate_cidrs))]
    pub private_ranges: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            private_ranges: DEFAULT_PRIVATE_RANGES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl NetworkConfig {
    pub fn classifier(&self) -> Result<NetworkClassifier, ipnet::AddrParseError> {
        NetworkClassifier::from_cidrs(&self.private_ranges)
    }
}

#[derive(Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct OwnershipConfig {
    /// Admin service lookup URL; resolution is disabled when unset
    #[garde(custom(validate_optional_http_url))]
    pub admin_endpoint: Option<String>,

    #[garde(custom(validate_signing_secret(&self.admin_endpoint)))]
    pub signing_secret: String,

    #[garde(range(min = 1, max = 3600))]
    pub token_ttl_seconds: u64,

    /// Owner cache TTL; 0 keeps entries forever
    #[garde(skip)]
    pub cache_ttl_seconds: u64,

    #[garde(range(min = 1, max = 86400))]
    pub cache_sweep_interval_seconds: u64,

    #[garde(range(min = 1, max = 60000))]
    pub request_timeout_ms: u64,

    #[garde(dive)]
    pub breaker: BreakerSettings,
}

impl Default for OwnershipConfig {
    fn default() -> Self {
        Self {
            admin_endpoint: None,
            signing_secret: String::new(),
            token_ttl_seconds: 60,
            cache_ttl_seconds: 300,
            cache_sweep_interval_seconds: 60,
            request_timeout_ms: 1000,
            breaker: BreakerSettings::default(),
        }
    }
}

impl std::fmt::Debug for OwnershipConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnershipConfig")
            .field("admin_endpoint", &self.admin_endpoint)
            .field("signing_secret", &"[REDACTED]")
            .field("token_ttl_seconds", &self.token_ttl_seconds)
            .field("cache_ttl_seconds", &self.cache_ttl_seconds)
            .field("cache_sweep_interval_seconds", &self.cache_sweep_interval_seconds)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("breaker", &self.breaker)
            .finish()
    }
}

#[derive(Debug, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct BreakerSettings {
    #[garde(range(min = 1))]
    pub request_volume_threshold: u32,

    #[garde(range(min = 1))]
    pub failure_threshold: u32,

    #[garde(range(min = 1))]
    pub success_threshold: u32,

    #[garde(range(min = 1))]
    pub half_open_max_calls: u32,

    #[garde(range(min = 1, max = 3600))]
    pub sleep_window_seconds: u64,

    #[garde(range(min = 1, max = 60000))]
    pub timeout_ms: u64,

    #[garde(range(min = 1, max = 3600))]
    pub rolling_window_seconds: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            request_volume_threshold: 1,
            failure_threshold: 1,
            success_threshold: 1,
            half_open_max_calls: 1,
            sleep_window_seconds: 30,
            timeout_ms: 1000,
            rolling_window_seconds: 10,
        }
    }
}

impl BreakerSettings {
    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            request_volume_threshold: self.request_volume_threshold,
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            half_open_max_calls: self.half_open_max_calls,
            sleep_window: Duration::from_secs(self.sleep_window_seconds),
            timeout: Duration::from_millis(self.timeout_ms),
            rolling_window: Duration::from_secs(self.rolling_window_seconds),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Staging,
    #[default]
    Production,
}

fn validate_bind_address(value: &str, _: &()) -> garde::Result {
    value
        .parse::<std::net::IpAddr>()
        .map(|_| ())
        .map_err(|_| garde::Error::new("Invalid IP address"))
}

fn validate_route_path(value: &str, _: &()) -> garde::Result {
    if value.starts_with('/') {
        Ok(())
    } else {
        Err(garde::Error::new("Path must start with '/'"))
    }
}

fn validate_optional_http_url(value: &Option<String>, _: &()) -> garde::Result {
    match value {
        None => Ok(()),
        Some(url) if url.starts_with("http://") || url.starts_with("https://") => Ok(()),
        Some(_) => Err(garde::Error::new("URL must use http or https")),
    }
}

fn validate_optional_socket_addr(value: &Option<String>, _: &()) -> garde::Result {
    match value {
        None => Ok(()),
        Some(addr) => addr
            .parse::<std::net::SocketAddr>()
            .map(|_| ())
            .map_err(|_| garde::Error::new("Invalid socket address")),
    }
}

fn validate_cidrs(value: &[String], _: &()) -> garde::Result {
    NetworkClassifier::from_cidrs(value)
        .map(|_| ())
        .map_err(|e| garde::Error::new(format!("Invalid network range: {}", e)))
}

fn validate_signing_secret(
    admin_endpoint: &Option<String>,
) -> impl FnOnce(&str, &()) -> garde::Result + '_ {
    move |secret, _| {
        if admin_endpoint.is_some() && secret.trim().is_empty() {
            Err(garde::Error::new(
                "Signing secret is required when admin_endpoint is set",
            ))
        } else {
            Ok(())
        }
    }
}
