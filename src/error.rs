//! # Error Handling
//!
//! Error taxonomy for the kiosk voice engine and its conversion to HTTP
//! responses for the local status/control API.
//!
//! ## What is (and is not) an error:
//! - **DeviceUnavailable**: microphone or speaker cannot be opened. Reported to
//!   the caller, never retried internally.
//! - **TransportClosed**: the server connection is gone. Audio degrades to
//!   silence / no-op instead of failing.
//! - **MalformedControlMessage**: an unparseable control message. Logged and
//!   dropped, session state unchanged.
//! - Playback buffer overflow and underrun are *not* errors. They are handled by
//!   the overwrite and silence-fill policies and only show up as counters.
//!
//! Nothing in this module is ever constructed inside a real-time audio callback.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors surfaced to the control context.
///
/// ## Usage Example:
/// ```rust
/// use kiosk_voice_engine::error::KioskError;
/// let err = KioskError::DeviceUnavailable("no default input device".to_string());
/// assert!(err.is_device_failure());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum KioskError {
    /// Microphone or speaker could not be acquired
    DeviceUnavailable(String),

    /// The transport is closed; no audio can be sent or received
    TransportClosed(String),

    /// A control message could not be parsed
    MalformedControlMessage(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// An operation was requested in a state that does not allow it
    BadRequest(String),

    /// Anything else
    Internal(String),
}

impl KioskError {
    /// Machine-readable name used in logs and JSON error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            KioskError::DeviceUnavailable(_) => "device_unavailable",
            KioskError::TransportClosed(_) => "transport_closed",
            KioskError::MalformedControlMessage(_) => "malformed_control_message",
            KioskError::ConfigError(_) => "config_error",
            KioskError::BadRequest(_) => "bad_request",
            KioskError::Internal(_) => "internal_error",
        }
    }

    /// Device acquisition failures are the only actionable audio failures.
    pub fn is_device_failure(&self) -> bool {
        matches!(self, KioskError::DeviceUnavailable(_))
    }
}

impl fmt::Display for KioskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KioskError::DeviceUnavailable(msg) => write!(f, "Audio device unavailable: {}", msg),
            KioskError::TransportClosed(msg) => write!(f, "Transport closed: {}", msg),
            KioskError::MalformedControlMessage(msg) => write!(f, "Malformed control message: {}", msg),
            KioskError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            KioskError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            KioskError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for KioskError {}

/// Maps each error onto an HTTP status for the local control API.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "bad_request",
///     "message": "Bad request: payment can only be requested during PAYMENT_CONFIRMATION",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for KioskError {
    fn error_response(&self) -> HttpResponse {
        let status = match self {
            KioskError::DeviceUnavailable(_) | KioskError::TransportClosed(_) => {
                actix_web::http::StatusCode::SERVICE_UNAVAILABLE // 503
            }
            KioskError::MalformedControlMessage(_) | KioskError::BadRequest(_) => {
                actix_web::http::StatusCode::BAD_REQUEST // 400
            }
            KioskError::ConfigError(_) | KioskError::Internal(_) => {
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR // 500
            }
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": self.kind(),
                "message": self.to_string(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for KioskError {
    fn from(err: anyhow::Error) -> Self {
        KioskError::Internal(err.to_string())
    }
}

/// JSON errors only come from control messages, so they are malformed-message errors.
impl From<serde_json::Error> for KioskError {
    fn from(err: serde_json::Error) -> Self {
        KioskError::MalformedControlMessage(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for KioskError {
    fn from(err: config::ConfigError) -> Self {
        KioskError::ConfigError(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for KioskError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        KioskError::TransportClosed(err.to_string())
    }
}

/// Shorthand for `Result<T, KioskError>`.
pub type AppResult<T> = Result<T, KioskError>;
