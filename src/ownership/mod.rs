//! Bucket-owner resolution: admin-service client, expiring cache and the
//! breaker-guarded resolver that ties them together

pub mod cache;
pub mod client;
pub mod resolver;

pub use cache::{CacheStats, ExpiringCache, Sweeper};
pub use client::{AdminClient, AdminClientConfig, AdminError, HttpAdminClient};
pub use resolver::{LookupOutcome, OwnershipResolver};
