use anyhow::Result;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Request, State},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
    routing::get,
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::timeout;

use bucket_telemetry::config::AppConfig;

const SECRET: &str = "integration-secret";
const S3_ENDPOINT: &str = "s3.example.com";

#[derive(Debug, Deserialize)]
struct Claims {
    bucket: String,
}

/// Admin service stand-in: verifies the token and answers from a fixed table
#[derive(Clone)]
struct AdminStandIn {
    owners: Arc<HashMap<String, String>>,
    down: Arc<AtomicBool>,
    calls: Arc<AtomicU32>,
}

async fn admin_lookup(State(admin): State<AdminStandIn>, headers: HeaderMap) -> Response {
    admin.calls.fetch_add(1, Ordering::SeqCst);

    if admin.down.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let Some(token) = headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
    else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let Ok(data) = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(SECRET.as_bytes()),
        &Validation::new(Algorithm::HS256),
    ) else {
        return StatusCode::FORBIDDEN.into_response();
    };

    match admin.owners.get(&data.claims.bucket) {
        Some(owner) => Json(serde_json::json!({
            "Bucket": { "Name": data.claims.bucket, "OwnerId": owner }
        }))
        .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn spawn(app: Router) -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(addr)
}

async fn spawn_admin() -> Result<(AdminStandIn, SocketAddr)> {
    let admin = AdminStandIn {
        owners: Arc::new(HashMap::from([
            ("photos".to_string(), "acct-photos".to_string()),
            ("docs".to_string(), "acct-docs".to_string()),
        ])),
        down: Arc::new(AtomicBool::new(false)),
        calls: Arc::new(AtomicU32::new(0)),
    };
    let app = Router::new()
        .route("/admin/bucket", get(admin_lookup))
        .with_state(admin.clone());
    let addr = spawn(app).await?;
    Ok((admin, addr))
}

/// S3 backend stand-in answering every request with 200
async fn spawn_backend() -> Result<SocketAddr> {
    let app = Router::new().fallback(|request: Request| async move {
        format!("stored {}", request.uri().path())
    });
    spawn(app).await
}

struct TestGateway {
    base: String,
    client: reqwest::Client,
    stop: Option<oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<Result<()>>,
}

impl TestGateway {
    async fn start(admin: SocketAddr, backend: SocketAddr) -> Result<Self> {
        let mut config = AppConfig::default();
        config.server.bind = "127.0.0.1".to_string();
        config.server.shutdown_timeout = 5;
        config.server.upstream = Some(format!("http://{backend}"));
        config.s3.endpoint = S3_ENDPOINT.to_string();
        config.ownership.admin_endpoint = Some(format!("http://{admin}/admin/bucket"));
        config.ownership.signing_secret = SECRET.to_string();
        config.ownership.breaker.sleep_window_seconds = 60;

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (stop, stopped) = oneshot::channel::<()>();

        let handle = tokio::spawn(bucket_telemetry::server::serve(config, listener, async move {
            let _ = stopped.await;
        }));

        Ok(Self {
            base: format!("http://{addr}"),
            client: reqwest::Client::new(),
            stop: Some(stop),
            handle,
        })
    }

    async fn get(&self, path: &str, host: Option<&str>) -> Result<(u16, String)> {
        let mut request = self.client.get(format!("{}{}", self.base, path));
        if let Some(host) = host {
            request = request.header("host", host);
        }
        let response = timeout(Duration::from_secs(5), request.send()).await??;
        let status = response.status().as_u16();
        Ok((status, response.text().await?))
    }

    async fn metrics(&self) -> Result<String> {
        Ok(self.get("/metrics", None).await?.1)
    }

    async fn shutdown(mut self) -> Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        timeout(Duration::from_secs(10), self.handle).await???;
        Ok(())
    }
}

fn tenant_lines<'a>(metrics: &'a str, bucket: &str) -> Vec<&'a str> {
    let bucket_label = format!("bucket_name=\"{bucket}\"");
    metrics
        .lines()
        .filter(|line| line.starts_with("bucket_response_count_total{"))
        .filter(|line| line.contains(&bucket_label))
        .collect()
}

#[tokio::test]
async fn test_requests_are_attributed_to_bucket_owners() -> Result<()> {
    let (admin, admin_addr) = spawn_admin().await?;
    let gateway = TestGateway::start(admin_addr, spawn_backend().await?).await?;

    // Virtual-hosted style
    let (status, body) = gateway
        .get("/summer/beach.jpg", Some("photos.s3.example.com"))
        .await?;
    assert_eq!(status, 200);
    assert_eq!(body, "stored /summer/beach.jpg");

    // Path style, twice; the second lookup is served from cache
    for _ in 0..2 {
        let (status, _) = gateway.get("/docs/readme.md", None).await?;
        assert_eq!(status, 200);
    }

    let metrics = gateway.metrics().await?;

    let photos = tenant_lines(&metrics, "photos");
    assert_eq!(photos.len(), 1);
    assert!(photos[0].contains("bucket_owner=\"acct-photos\""));
    assert!(photos[0].contains("internal=\"y\""));
    assert!(photos[0].contains("status=\"200\""));

    let docs = tenant_lines(&metrics, "docs");
    assert_eq!(docs.len(), 1);
    assert!(docs[0].contains("bucket_owner=\"acct-docs\""));
    assert!(docs[0].ends_with(" 2"));

    assert_eq!(admin.calls.load(Ordering::SeqCst), 2);

    gateway.shutdown().await
}

#[tokio::test]
async fn test_admin_outage_keeps_serving_with_unknown_owner() -> Result<()> {
    let (admin, admin_addr) = spawn_admin().await?;
    admin.down.store(true, Ordering::SeqCst);
    let gateway = TestGateway::start(admin_addr, spawn_backend().await?).await?;

    let (status, body) = gateway.get("/photos/key1", None).await?;
    assert_eq!(status, 200);
    assert_eq!(body, "stored /photos/key1");

    // The breaker is open now: no further admin calls
    let (status, _) = gateway.get("/photos/key2", None).await?;
    assert_eq!(status, 200);
    assert_eq!(admin.calls.load(Ordering::SeqCst), 1);

    let metrics = gateway.metrics().await?;
    let photos = tenant_lines(&metrics, "photos");
    assert_eq!(photos.len(), 1);
    assert!(photos[0].contains("bucket_owner=\"-\""));
    assert!(photos[0].ends_with(" 2"));

    assert!(metrics.contains("ownership_lookups_total{result=\"failed\"} 1"));
    assert!(metrics.contains("ownership_lookups_total{result=\"rejected\"} 1"));

    let (status, readiness) = gateway.get("/health/ready", None).await?;
    assert_eq!(status, 200);
    let readiness: serde_json::Value = serde_json::from_str(&readiness)?;
    assert_eq!(readiness["status"], "degraded");
    assert_eq!(
        readiness["services"]["ownership"]["metadata"]["breaker_state"],
        "open"
    );

    gateway.shutdown().await
}

#[tokio::test]
async fn test_health_endpoints_and_trace_ids() -> Result<()> {
    let (_admin, admin_addr) = spawn_admin().await?;
    let gateway = TestGateway::start(admin_addr, spawn_backend().await?).await?;

    let (status, body) = gateway.get("/health", None).await?;
    assert_eq!(status, 200);
    assert_eq!(body, "OK");

    let (status, body) = gateway.get("/health/ready", None).await?;
    assert_eq!(status, 200);
    let readiness: serde_json::Value = serde_json::from_str(&body)?;
    assert_eq!(readiness["status"], "healthy");
    assert_eq!(readiness["services"]["ownership"]["status"], "healthy");

    let response = gateway
        .client
        .get(format!("{}/health", gateway.base))
        .send()
        .await?;
    let trace_id = response.headers().get("x-trace-id").unwrap();
    assert_eq!(trace_id.len(), 36);

    // Probes are not attributed to a bucket
    let metrics = gateway.metrics().await?;
    assert!(tenant_lines(&metrics, "health").is_empty());

    gateway.shutdown().await
}

#[tokio::test]
async fn test_port_conflict_error() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    let mut config = AppConfig::default();
    config.server.bind = "127.0.0.1".to_string();
    config.server.port = port;

    let result = timeout(
        Duration::from_secs(5),
        bucket_telemetry::server::start_server(config),
    )
    .await?;
    let err = result.unwrap_err();
    assert!(err.to_string().contains("Failed to bind"));

    drop(listener);
    Ok(())
}
