//! # Error Handling
//!
//! This module defines the two error families used across the backend:
//!
//! - **AppError**: errors raised by HTTP handlers, converted into JSON responses
//! - **CallError**: errors raised by the live call pipeline (session controller,
//!   audio devices, remote transport, tool calls and evaluation)
//!
//! ## Call Error Taxonomy:
//! | Variant | Fatal to the call | Typical source |
//! |---|---|---|
//! | `Configuration` | no (nothing acquired yet) | missing API credential |
//! | `Device` | yes, aborts `start()` back to idle | microphone denied / busy |
//! | `Transport` | yes, forces the call to end | remote session error or close |
//! | `ToolHandler` | no, sent back to the agent | business handler failure |
//! | `Evaluation` | no, call already ended | evaluation service failure |
//! | `InvalidState` / `Usage` | no, operation rejected | wrong lifecycle state |

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors returned by HTTP request handlers.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **NotFound**: Requested resource doesn't exist (404 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
/// - **Conflict**: Operation not allowed in the current call state (409 errors)
/// - **Unavailable**: Connection limit reached (503 errors)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    ConfigError(String),
    ValidationError(String),
    Conflict(String),
    Unavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

/// Converts handler errors into JSON HTTP responses.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "validation_error",
///     "message": "Frame size must be greater than 0",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;

        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg.clone()),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg.clone()),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg.clone()),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
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

/// JSON parsing errors are almost always caused by the client, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<CallError> for AppError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::Configuration(msg) => AppError::ConfigError(msg),
            CallError::InvalidState(msg) => AppError::Conflict(msg),
            CallError::Usage(msg) => AppError::BadRequest(msg),
            other => AppError::Internal(other.to_string()),
        }
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;

/// Errors produced by the live call pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum CallError {
    /// A required credential or setting is missing; detected before any resource is acquired
    Configuration(String),

    /// The microphone or the playback device could not be acquired
    Device(String),

    /// The remote session reported an error or went away
    Transport(String),

    /// A business tool handler failed while servicing a tool call
    ToolHandler(String),

    /// The post-call evaluation service failed
    Evaluation(String),

    /// The operation is not allowed in the current lifecycle state
    InvalidState(String),

    /// The operation was called with unusable input
    Usage(String),
}

impl CallError {
    /// Whether this error terminates the call it occurred in.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CallError::Device(_) | CallError::Transport(_))
    }

    /// Machine-readable code sent to WebSocket clients.
    pub fn code(&self) -> &'static str {
        match self {
            CallError::Configuration(_) => "configuration_error",
            CallError::Device(_) => "device_error",
            CallError::Transport(_) => "transport_error",
            CallError::ToolHandler(_) => "tool_handler_error",
            CallError::Evaluation(_) => "evaluation_error",
            CallError::InvalidState(_) => "invalid_state",
            CallError::Usage(_) => "usage_error",
        }
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            CallError::Device(msg) => write!(f, "Audio device error: {}", msg),
            CallError::Transport(msg) => write!(f, "Transport error: {}", msg),
            CallError::ToolHandler(msg) => write!(f, "Tool handler error: {}", msg),
            CallError::Evaluation(msg) => write!(f, "Evaluation error: {}", msg),
            CallError::InvalidState(msg) => write!(f, "Invalid call state: {}", msg),
            CallError::Usage(msg) => write!(f, "Usage error: {}", msg),
        }
    }
}

impl std::error::Error for CallError {}

impl From<cpal::BuildStreamError> for CallError {
    fn from(err: cpal::BuildStreamError) -> Self {
        CallError::Device(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for CallError {
    fn from(err: cpal::PlayStreamError) -> Self {
        CallError::Device(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for CallError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        CallError::Device(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for CallError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        CallError::Transport(err.to_string())
    }
}

pub type CallResult<T> = Result<T, CallError>;
