use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Internal error")]
    Internal(#[from] anyhow::Error),
}

/// Response extension marking a response produced from a handler error
///
/// The metrics middleware uses it to tell a failed handler apart from one
/// that deliberately returned an error status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    pub kind: &'static str,
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            AppError::InvalidInput(_) => "invalid_input",
            AppError::Upstream(_) => "upstream",
            AppError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Don't expose internal or upstream error details
        let body = match &self {
            AppError::Internal(_) => "Internal error".to_string(),
            AppError::Upstream(_) => "Bad gateway".to_string(),
            _ => self.to_string(),
        };

        let mut response = (status, body).into_response();
        response
            .extensions_mut()
            .insert(HandlerFailure { kind: self.kind() });
        response
    }
}
