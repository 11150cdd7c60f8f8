//! Error types for the lookup service.
//!
//! [`LookupError`] is the per-request taxonomy surfaced to API callers.
//! [`Error`] covers startup, configuration and CLI failures.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::fmt;

/// Stable, machine-readable name of a lookup failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    BadRequest,
    DownloadFailure,
    DecodeFailure,
    InferenceFailure,
    InferenceResponseInvalid,
    SearchFailure,
    SigningFailure,
}

impl ErrorKind {
    /// Name used in error bodies and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "BadRequest",
            ErrorKind::DownloadFailure => "DownloadFailure",
            ErrorKind::DecodeFailure => "DecodeFailure",
            ErrorKind::InferenceFailure => "InferenceFailure",
            ErrorKind::InferenceResponseInvalid => "InferenceResponseInvalid",
            ErrorKind::SearchFailure => "SearchFailure",
            ErrorKind::SigningFailure => "SigningFailure",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single similarity lookup.
///
/// Every stage returns this type; nothing is retried or recovered, the
/// first error aborts the request.
#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    /// Request body is malformed or violates a field constraint.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Caller-supplied image URL could not be fetched.
    #[error("download failed: {0}")]
    DownloadFailure(String),

    /// Inline image payload is not valid base64.
    #[error("decode failed: {0}")]
    DecodeFailure(String),

    /// Inference endpoint could not be invoked.
    #[error("inference call failed: {0}")]
    InferenceFailure(String),

    /// Inference endpoint answered with something other than a feature vector.
    #[error("invalid inference response: {0}")]
    InferenceResponseInvalid(String),

    /// Vector index query failed.
    #[error("search failed: {reason}")]
    SearchFailure { reason: String, timed_out: bool },

    /// A download link could not be signed.
    #[error("signing failed: {0}")]
    SigningFailure(String),
}

impl LookupError {
    /// Search failure that is not a timeout.
    pub fn search(reason: impl Into<String>) -> Self {
        LookupError::SearchFailure {
            reason: reason.into(),
            timed_out: false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            LookupError::BadRequest(_) => ErrorKind::BadRequest,
            LookupError::DownloadFailure(_) => ErrorKind::DownloadFailure,
            LookupError::DecodeFailure(_) => ErrorKind::DecodeFailure,
            LookupError::InferenceFailure(_) => ErrorKind::InferenceFailure,
            LookupError::InferenceResponseInvalid(_) => ErrorKind::InferenceResponseInvalid,
            LookupError::SearchFailure { .. } => ErrorKind::SearchFailure,
            LookupError::SigningFailure(_) => ErrorKind::SigningFailure,
        }
    }

    /// HTTP status reported to the caller.
    ///
    /// Caller-input problems map to 4xx, backend problems to 5xx.
    pub fn status_code(&self) -> StatusCode {
        match self {
            LookupError::BadRequest(_) | LookupError::DecodeFailure(_) => StatusCode::BAD_REQUEST,
            LookupError::DownloadFailure(_) => StatusCode::UNPROCESSABLE_ENTITY,
            LookupError::InferenceFailure(_) | LookupError::InferenceResponseInvalid(_) => {
                StatusCode::BAD_GATEWAY
            }
            LookupError::SearchFailure { timed_out: true, .. } => StatusCode::GATEWAY_TIMEOUT,
            LookupError::SearchFailure { .. } => StatusCode::BAD_GATEWAY,
            LookupError::SigningFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the failure was caused by the caller's input.
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

/// JSON body returned for a failed lookup.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorKind,
    pub message: String,
}

impl IntoResponse for LookupError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.kind(),
            message: self.to_string(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}

/// Crate-level error for startup and CLI paths.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("API error: {0}")]
    Api(String),

    #[error("AWS error: {0}")]
    Aws(String),

    #[error(transparent)]
    Lookup(#[from] LookupError),
}

/// Result type for startup and CLI operations.
pub type Result<T> = std::result::Result<T, Error>;
