//! Forwarding of unmatched requests to the S3 backend
//!
//! Request and response bodies are streamed in both directions, so object
//! size never limits what passes through and the metrics layer counts bytes
//! as they flow. Hop-by-hop headers are not forwarded; `Host` and
//! `Content-Length` are kept, so virtual-hosted requests reach the backend
//! under the name the client used and HEAD responses report the object size.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, HeaderName, header},
    response::Response,
};
use http_body::Body as _;
use tracing::{debug, warn};

use crate::error::AppError;
use crate::logging::sanitize_log_message;

const HOP_BY_HOP: &[HeaderName] = &[
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(name) || name.as_str().eq_ignore_ascii_case("keep-alive")
}

fn forwardable(headers: &HeaderMap) -> HeaderMap {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// HTTP client bound to one backend base URL
#[derive(Debug, Clone)]
pub struct UpstreamProxy {
    client: reqwest::Client,
    base: String,
}

impl UpstreamProxy {
    pub fn new(base: &str) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Backend URL for a request's path and query
    pub fn target_url(&self, request: &Request) -> String {
        let path_and_query = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        format!("{}{}", self.base, path_and_query)
    }

    pub async fn forward(&self, request: Request) -> Result<Response, AppError> {
        let url = self.target_url(&request);
        let (parts, body) = request.into_parts();

        debug!(method = %parts.method, url = %url, "Forwarding request upstream");

        let mut outgoing = self
            .client
            .request(parts.method, &url)
            .headers(forwardable(&parts.headers));
        // An empty body is not sent at all, so GET and HEAD stay bodiless
        if !body.is_end_stream() {
            outgoing = outgoing.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        let upstream = outgoing.send().await.map_err(|e| upstream_error(&url, e))?;

        let status = upstream.status();
        let headers = forwardable(upstream.headers());
        let mut response = Response::builder()
            .status(status)
            .body(Body::from_stream(upstream.bytes_stream()))
            .map_err(|e| AppError::Internal(e.into()))?;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

fn upstream_error(url: &str, error: reqwest::Error) -> AppError {
    let message = sanitize_log_message(&error.to_string());
    warn!(url = %sanitize_log_message(url), error = %message, "Upstream request failed");
    if error.is_builder() {
        AppError::InvalidInput(message)
    } else {
        AppError::Upstream(message)
    }
}

/// Fallback handler forwarding anything not served locally
pub async fn forward(
    State(proxy): State<Arc<UpstreamProxy>>,
    request: Request,
) -> Result<Response, AppError> {
    proxy.forward(request).await
}
