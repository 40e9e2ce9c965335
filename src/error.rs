//! # Error Handling
//!
//! Application error type and its conversion to HTTP responses.
//!
//! ## Error Categories:
//! - **ConfigInvalid**: a control frame or config update carried unusable
//!   values (400)
//! - **CredentialsUnavailable**: backend token missing or unreadable (500)
//! - **BackendStream**: the recognition backend could not be reached or the
//!   stream broke during setup (502)
//! - **DuplicateSession**: a second `start` for an already-live session (409)
//! - **Internal**: everything else server-side (500)
//!
//! Session-creation failures reach the client through the WebSocket error
//! frame; the HTTP mapping serves the REST surface.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

#[derive(Debug)]
pub enum AppError {
    /// Client supplied invalid session or runtime configuration
    ConfigInvalid(String),

    /// Backend API token is missing, unreadable or empty
    CredentialsUnavailable(String),

    /// The streaming connection to the recognition backend failed
    BackendStream(String),

    /// A session with this key is already active
    DuplicateSession(String),

    /// Internal server errors
    Internal(String),
}

impl AppError {
    /// Machine-readable error kind, shared by HTTP responses and WebSocket
    /// error frames.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::ConfigInvalid(_) => "config_invalid",
            AppError::CredentialsUnavailable(_) => "credentials_unavailable",
            AppError::BackendStream(_) => "backend_stream",
            AppError::DuplicateSession(_) => "duplicate_session",
            AppError::Internal(_) => "internal_error",
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::ConfigInvalid(msg) => write!(f, "Invalid configuration: {}", msg),
            AppError::CredentialsUnavailable(msg) => write!(f, "Credentials unavailable: {}", msg),
            AppError::BackendStream(msg) => write!(f, "Backend stream error: {}", msg),
            AppError::DuplicateSession(key) => write!(f, "Session already active: {}", key),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

/// Converts application errors into JSON HTTP responses.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "config_invalid",
///     "message": "sampleRateHz must be positive",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, message) = match self {
            AppError::ConfigInvalid(msg) => {
                (actix_web::http::StatusCode::BAD_REQUEST, msg.clone())
            }
            AppError::CredentialsUnavailable(msg) => {
                (actix_web::http::StatusCode::INTERNAL_SERVER_ERROR, msg.clone())
            }
            AppError::BackendStream(msg) => {
                (actix_web::http::StatusCode::BAD_GATEWAY, msg.clone())
            }
            AppError::DuplicateSession(key) => (
                actix_web::http::StatusCode::CONFLICT,
                format!("Session already active: {}", key),
            ),
            AppError::Internal(msg) => {
                (actix_web::http::StatusCode::INTERNAL_SERVER_ERROR, msg.clone())
            }
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": self.kind(),
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Malformed JSON from a client is a configuration problem, not a server one.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::ConfigInvalid(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Internal(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
