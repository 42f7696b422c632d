//! Bucket and object identity extraction
//!
//! S3-style requests carry the bucket name in one of two places:
//!
//! 1. **Virtual-hosted style**: the bucket is a subdomain of the service
//!    endpoint, e.g. `mybucket.s3.example.com/key1`
//! 2. **Path style**: the bucket is the first path segment, e.g.
//!    `s3.example.com/mybucket/key1`
//!
//! Extraction never fails. Anything that cannot be classified yields empty
//! strings, and callers substitute [`SENTINEL`] before using the value as a
//! metric label so label cardinality stays bounded.
//!
//! # Usage
//!
//! ```rust
//! use bucket_telemetry::helpers::identity::{extract, bucket_label};
//!
//! let (bucket, object) = extract("s3.example.com", "mybucket.s3.example.com:8080", "/key1");
//! assert_eq!(bucket, "mybucket");
//! assert_eq!(object, "key1");
//!
//! let (bucket, _) = extract("s3.example.com", "s3.example.com", "/");
//! assert_eq!(bucket_label(&bucket), "-");
//! ```

/// Placeholder used for unknown or empty labels
pub const SENTINEL: &str = "-";

/// Extract `(bucket, object)` from a request host and path
///
/// # Arguments
///
/// * `endpoint_suffix` - Service endpoint used for virtual-hosted addressing
///   (e.g. `s3.example.com`). An empty suffix disables virtual-host matching.
/// * `host` - Request host, optionally with a port
/// * `path` - Request path (without the query string)
pub fn extract(endpoint_suffix: &str, host: &str, path: &str) -> (String, String) {
    let host = strip_port(host).to_ascii_lowercase();
    let trimmed = path.strip_prefix('/').unwrap_or(path);

    if let Some(bucket) = virtual_host_bucket(&host, endpoint_suffix) {
        return (bucket.to_string(), trimmed.to_string());
    }

    match trimmed.split_once('/') {
        Some((bucket, object)) => (bucket.to_string(), object.to_string()),
        None => (trimmed.to_string(), String::new()),
    }
}

/// Metric label for a bucket name, [`SENTINEL`] when empty
pub fn bucket_label(bucket: &str) -> String {
    let bucket = bucket.trim();
    if bucket.is_empty() {
        SENTINEL.to_string()
    } else {
        bucket.to_string()
    }
}

/// Metric label for a request host
///
/// Lowercases and strips the port. Returns [`SENTINEL`] for empty hosts and
/// for hosts that cannot be split into host and port (an unterminated IPv6
/// literal, or a bare IPv6 address without brackets).
pub fn host_label(host: &str) -> String {
    let host = host.trim();
    if host.is_empty() {
        return SENTINEL.to_string();
    }
    if host.starts_with('[') && !host.contains(']') {
        return SENTINEL.to_string();
    }
    if !host.starts_with('[') && host.matches(':').count() > 1 {
        return SENTINEL.to_string();
    }

    let stripped = strip_port(host);
    if stripped.is_empty() {
        SENTINEL.to_string()
    } else {
        stripped.to_ascii_lowercase()
    }
}

/// Remove a trailing `:port` from a host, keeping IPv6 literals intact
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    host.split(':').next().unwrap_or(host)
}

/// Bucket name for a virtual-hosted request, if the host matches the suffix
fn virtual_host_bucket<'a>(host: &'a str, endpoint_suffix: &str) -> Option<&'a str> {
    let endpoint_suffix = endpoint_suffix.trim().trim_start_matches('.');
    if endpoint_suffix.is_empty() {
        return None;
    }

    let suffix = format!(".{}", endpoint_suffix.to_ascii_lowercase());
    host.strip_suffix(suffix.as_str())
        .filter(|bucket| !bucket.is_empty())
}
