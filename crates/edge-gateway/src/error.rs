//! Gateway errors

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use fleet_pki::{PkiError, VerifyError};
use fleet_store::StoreError;
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Errors returned by gateway handlers
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("malformed request: {0}")]
    BadRequest(String),

    #[error("authentication failed: {0}")]
    Unauthenticated(#[from] VerifyError),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A mandatory reference in the device configuration could not be resolved
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("PKI error: {0}")]
    Pki(#[from] PkiError),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("server error: {0}")]
    Server(String),
}

impl GatewayError {
    /// HTTP status for this error
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) | Self::Unauthenticated(VerifyError::NoCertificate) => {
                StatusCode::BAD_REQUEST
            }
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Store(e) if e.is_not_found() => StatusCode::NOT_FOUND,
            Self::Store(e) if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
            Self::Pki(PkiError::InvalidCsr(_)) => StatusCode::BAD_REQUEST,
            Self::Configuration(_)
            | Self::Store(_)
            | Self::Pki(_)
            | Self::Tls(_)
            | Self::Server(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Failure while assembling a device configuration
#[derive(Debug, Error)]
pub enum AssemblyError {
    /// Absent mandatory reference or malformed value; not retried
    #[error("{0}")]
    Configuration(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AssemblyError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_transient())
    }
}

impl From<AssemblyError> for GatewayError {
    fn from(e: AssemblyError) -> Self {
        match e {
            AssemblyError::Configuration(msg) => Self::Configuration(msg),
            AssemblyError::Store(e) => Self::Store(e),
        }
    }
}

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;
