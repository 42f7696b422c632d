//! Admin service client for bucket ownership lookups
//!
//! The admin service answers "who owns this bucket?". Each request carries a
//! short-lived HS256 JWT whose claims name the bucket:
//!
//! ```text
//! GET <admin_endpoint>
//! Authorization: Bearer <jwt {bucket, iat, exp}>
//!
//! 200 OK
//! {"Bucket": {"OwnerId": "acct-1", ...}}
//! ```
//!
//! [`AdminClient`] is the seam the resolver depends on, so resolution logic
//! can be exercised without a network.

use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::{EncodingKey, Header, encode};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Connection settings for the admin service
#[derive(Clone)]
pub struct AdminClientConfig {
    /// Full URL of the ownership lookup endpoint
    pub endpoint: String,
    /// Shared secret used to sign request tokens
    pub signing_secret: String,
    /// Lifetime of each request token
    pub token_ttl: Duration,
    /// Upper bound on a single HTTP request
    pub request_timeout: Duration,
}

impl std::fmt::Debug for AdminClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminClientConfig")
            .field("endpoint", &self.endpoint)
            .field("signing_secret", &"[REDACTED]")
            .field("token_ttl", &self.token_ttl)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Admin client errors
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("failed to sign admin token: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),

    #[error("admin service request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("admin service returned status {0}")]
    Status(u16),

    #[error("invalid admin service response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("admin service response carries no owner")]
    MissingOwner,
}

/// Claims of the token sent with each lookup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LookupClaims {
    pub bucket: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(rename = "Bucket")]
    bucket: Option<BucketInfo>,
}

#[derive(Debug, Deserialize)]
struct BucketInfo {
    #[serde(rename = "OwnerId", default)]
    owner_id: Option<String>,
}

/// Bucket owner lookup
#[async_trait]
pub trait AdminClient: Send + Sync {
    /// Owner id of `bucket`
    ///
    /// Returns an error for every unusable answer, including a 200 response
    /// whose owner is missing or empty.
    async fn lookup_owner(&self, bucket: &str) -> Result<String, AdminError>;
}

/// Production admin client over HTTP
#[derive(Clone)]
pub struct HttpAdminClient {
    http: reqwest::Client,
    endpoint: String,
    encoding_key: EncodingKey,
    token_ttl: Duration,
}

impl HttpAdminClient {
    pub fn new(config: AdminClientConfig) -> Result<Self, AdminError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        debug!(
            endpoint = %config.endpoint,
            token_ttl_secs = config.token_ttl.as_secs(),
            request_timeout_ms = config.request_timeout.as_millis() as u64,
            "Creating admin service client"
        );

        Ok(Self {
            http,
            endpoint: config.endpoint,
            encoding_key: EncodingKey::from_secret(config.signing_secret.as_bytes()),
            token_ttl: config.token_ttl,
        })
    }

    /// Sign a lookup token for `bucket`
    pub fn sign_token(&self, bucket: &str) -> Result<String, AdminError> {
        let now = chrono::Utc::now().timestamp();
        let claims = LookupClaims {
            bucket: bucket.to_string(),
            iat: now,
            exp: now + self.token_ttl.as_secs() as i64,
        };

        Ok(encode(&Header::default(), &claims, &self.encoding_key)?)
    }
}

#[async_trait]
impl AdminClient for HttpAdminClient {
    async fn lookup_owner(&self, bucket: &str) -> Result<String, AdminError> {
        let token = self.sign_token(bucket)?;

        let response = self
            .http
            .get(&self.endpoint)
            .bearer_auth(token)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(AdminError::Status(status.as_u16()));
        }

        let body = response.bytes().await?;
        parse_owner(&body)
    }
}

/// Extract `Bucket.OwnerId` from a lookup response body
fn parse_owner(body: &[u8]) -> Result<String, AdminError> {
    let response: LookupResponse = serde_json::from_slice(body)?;

    response
        .bucket
        .and_then(|bucket| bucket.owner_id)
        .map(|owner| owner.trim().to_string())
        .filter(|owner| !owner.is_empty())
        .ok_or(AdminError::MissingOwner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, http::HeaderMap, routing::get};
    use jsonwebtoken::{DecodingKey, Validation, decode};

    const SECRET: &str = "test-secret";

    fn config(endpoint: String) -> AdminClientConfig {
        AdminClientConfig {
            endpoint,
            signing_secret: SECRET.to_string(),
            token_ttl: Duration::from_secs(60),
            request_timeout: Duration::from_secs(2),
        }
    }

    fn claims_from(headers: &HeaderMap) -> Option<LookupClaims> {
        let token = headers
            .get("authorization")?
            .to_str()
            .ok()?
            .strip_prefix("Bearer ")?;
        decode::<LookupClaims>(
            token,
            &DecodingKey::from_secret(SECRET.as_bytes()),
            &Validation::default(),
        )
        .ok()
        .map(|data| data.claims)
    }

    async fn spawn_admin(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}/admin/bucket", addr)
    }

    #[test]
    fn test_parse_owner() {
        let body = br#"{"Bucket": {"OwnerId": "acct-1", "Name": "photos", "ACL": {}}}"#;
        assert_eq!(parse_owner(body).unwrap(), "acct-1");
    }

    #[test]
    fn test_parse_owner_rejects_missing_or_empty_owner() {
        assert!(matches!(
            parse_owner(br#"{"Bucket": {"OwnerId": ""}}"#),
            Err(AdminError::MissingOwner)
        ));
        assert!(matches!(
            parse_owner(br#"{"Bucket": {}}"#),
            Err(AdminError::MissingOwner)
        ));
        assert!(matches!(parse_owner(br#"{}"#), Err(AdminError::MissingOwner)));
        assert!(matches!(parse_owner(b"not json"), Err(AdminError::Decode(_))));
    }

    #[test]
    fn test_signed_token_carries_bucket_claims() {
        let client = HttpAdminClient::new(config("http://127.0.0.1:1/".into())).unwrap();
        let token = client.sign_token("photos").unwrap();

        let claims = decode::<LookupClaims>(
            &token,
            &DecodingKey::from_secret(SECRET.as_bytes()),
            &Validation::default(),
        )
        .unwrap()
        .claims;

        assert_eq!(claims.bucket, "photos");
        assert_eq!(claims.exp - claims.iat, 60);
    }

    #[tokio::test]
    async fn test_lookup_owner_sends_bearer_token() {
        let router = Router::new().route(
            "/admin/bucket",
            get(|headers: HeaderMap| async move {
                match claims_from(&headers) {
                    Some(claims) => (
                        axum::http::StatusCode::OK,
                        format!(r#"{{"Bucket": {{"OwnerId": "owner-of-{}"}}}}"#, claims.bucket),
                    ),
                    None => (axum::http::StatusCode::UNAUTHORIZED, String::new()),
                }
            }),
        );
        let endpoint = spawn_admin(router).await;
        let client = HttpAdminClient::new(config(endpoint)).unwrap();

        let owner = client.lookup_owner("photos").await.unwrap();
        assert_eq!(owner, "owner-of-photos");
    }

    #[tokio::test]
    async fn test_lookup_owner_non_200_is_error() {
        let router = Router::new().route(
            "/admin/bucket",
            get(|| async { (axum::http::StatusCode::NOT_FOUND, "no such bucket") }),
        );
        let endpoint = spawn_admin(router).await;
        let client = HttpAdminClient::new(config(endpoint)).unwrap();

        let result = client.lookup_owner("photos").await;
        assert!(matches!(result, Err(AdminError::Status(404))));
    }

    #[tokio::test]
    async fn test_lookup_owner_unreachable_is_transport_error() {
        // Bind then drop to get a port with nothing listening
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = HttpAdminClient::new(config(format!("http://{}/", addr))).unwrap();
        let result = client.lookup_owner("photos").await;
        assert!(matches!(result, Err(AdminError::Transport(_))));
    }
}
