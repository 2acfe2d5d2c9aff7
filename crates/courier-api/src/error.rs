//! Callback errors and their HTTP mapping.
//!
//! The platform only sees status codes and a `{errcode, errmsg}` body, so
//! every rejection is mapped here in one place.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use courier_core::CoreError;
use serde::Serialize;
use thiserror::Error;

/// Result type alias for callback processing.
pub type Result<T> = std::result::Result<T, CallbackError>;

/// Reasons a callback request is rejected.
#[derive(Debug, Error)]
pub enum CallbackError {
    /// A required query parameter is absent or empty.
    #[error("missing required parameter: {0}")]
    MissingParameter(&'static str),

    /// The request body could not be read as a callback envelope.
    #[error("malformed callback body: {0}")]
    MalformedBody(String),

    /// No tenant is configured under the requested account id.
    #[error("unknown account: {0}")]
    UnknownTenant(String),

    /// HTTP method other than GET or POST.
    #[error("method not allowed")]
    MethodNotAllowed,

    /// Verification, decryption, or parsing failure.
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Error body returned to the platform.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Always `-1` for rejections
    pub errcode: i64,
    /// Human-readable reason
    pub errmsg: String,
}

impl CallbackError {
    /// HTTP status for this rejection.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingParameter(_) | Self::MalformedBody(_) => StatusCode::BAD_REQUEST,
            Self::UnknownTenant(_) => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::Core(err) => match err {
                CoreError::SignatureMismatch => StatusCode::UNAUTHORIZED,
                CoreError::DecryptionFailed { .. } | CoreError::InvalidMessageFormat { .. } => {
                    StatusCode::BAD_REQUEST
                },
                CoreError::CredentialMissing { .. } => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for CallbackError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "callback failed");
        } else {
            tracing::warn!(error = %self, status = status.as_u16(), "callback rejected");
        }

        (status, Json(ErrorBody { errcode: -1, errmsg: self.to_string() })).into_response()
    }
}
