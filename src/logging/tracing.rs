use axum::{
    extract::Request,
    http::HeaderValue,
    middleware::Next,
    response::Response,
};
use tracing::{Instrument, info_span};
use uuid::Uuid;

/// Header carrying the request correlation id
pub const TRACE_ID_HEADER: &str = "x-trace-id";

/// Correlation id, stored in request extensions
#[derive(Clone, Debug)]
pub struct TraceId(pub String);

impl TraceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

pub fn generate_trace_id() -> String {
    Uuid::new_v4().to_string()
}

/// Runs the request inside an `http_request` span keyed by a trace id
///
/// An incoming `x-trace-id` is reused, otherwise a fresh one is generated.
/// The id is echoed back on the response.
pub async fn trace_requests(mut request: Request, next: Next) -> Response {
    let trace_id = request
        .headers()
        .get(TRACE_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(generate_trace_id);

    let span = info_span!(
        "http_request",
        trace_id = %trace_id,
        method = %request.method(),
        path = %request.uri().path(),
        version = ?request.version(),
    );

    request.extensions_mut().insert(TraceId(trace_id.clone()));

    let mut response = next.run(request).instrument(span).await;

    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert(TRACE_ID_HEADER, value);
    }

    response
}
