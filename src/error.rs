use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Errors reported to the caller of a request.
///
/// A viewer disconnecting is deliberately absent: cancellation is an outcome,
/// not an error.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Bad provider/model id, empty prompt, mismatched ancestor path.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Network or vendor failure while talking to the provider.
    #[error("Vendor transport error: {0:#}")]
    VendorTransport(anyhow::Error),

    /// Structured output did not match the expected schema.
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Persistence error: {0:#}")]
    Persistence(anyhow::Error),
}

impl ChatError {
    pub fn status(&self) -> StatusCode {
        match self {
            ChatError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::VendorTransport(_) | ChatError::Schema(_) => StatusCode::BAD_GATEWAY,
            ChatError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ChatError::InvalidInput(_) => "invalid_input",
            ChatError::NotFound(_) => "not_found",
            ChatError::VendorTransport(_) => "vendor_transport",
            ChatError::Schema(_) => "schema",
            ChatError::Persistence(_) => "persistence",
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        if self.status().is_server_error() {
            log::error!("Request failed: {}", self);
        } else {
            log::warn!("Request rejected: {}", self);
        }
        let body = json!({ "code": self.code(), "message": self.to_string() });
        (self.status(), Json(body)).into_response()
    }
}
