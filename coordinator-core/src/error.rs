//! Crate-wide error type.
//!
//! Every fallible operation in the coordinator returns `Result<T>`. The
//! Façade is the only place a `CoordinatorError` is converted into an HTTP
//! envelope — nothing else should format one into a response body.

use axum::http::StatusCode;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone)]
pub enum CoordinatorError {
    /// Malformed request body, bad query params, invalid ids. Never retried.
    InvalidInput(String),
    /// Missing or invalid credentials.
    Unauthenticated(String),
    /// Valid credentials, insufficient permission.
    Unauthorized(String),
    /// No such session/sandbox/message/etc.
    NotFound(String),
    /// The resource existed but has permanently transitioned away (stopped/stale sandbox).
    Gone(String),
    /// Externally-deduplicated conflict; caller should treat as success.
    Conflict(String),
    /// Retryable infra failure (network error, 502/503/504). Drives the circuit breaker.
    Transient(String),
    /// Non-retryable infra failure (4xx, unrecognized 5xx, config error). Opens the breaker.
    Permanent(String),
    /// Business-rule violation (e.g. PR requested with no processing message).
    Logical(String),
    /// Persistent-store I/O or (de)serialization failure.
    Storage(String),
    /// Outbound HTTP transport failure not yet classified transient/permanent.
    Http(String),
    /// Auth subsystem internal failure (bad key material, encoding error).
    Auth(String),
    /// Input failed semantic validation.
    Validation(String),
}

impl fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInput(m) => write!(f, "invalid input: {m}"),
            Self::Unauthenticated(m) => write!(f, "unauthenticated: {m}"),
            Self::Unauthorized(m) => write!(f, "unauthorized: {m}"),
            Self::NotFound(m) => write!(f, "not found: {m}"),
            Self::Gone(m) => write!(f, "gone: {m}"),
            Self::Conflict(m) => write!(f, "conflict: {m}"),
            Self::Transient(m) => write!(f, "transient failure: {m}"),
            Self::Permanent(m) => write!(f, "permanent failure: {m}"),
            Self::Logical(m) => write!(f, "{m}"),
            Self::Storage(m) => write!(f, "storage error: {m}"),
            Self::Http(m) => write!(f, "http error: {m}"),
            Self::Auth(m) => write!(f, "auth error: {m}"),
            Self::Validation(m) => write!(f, "{m}"),
        }
    }
}

impl std::error::Error for CoordinatorError {}

pub type Result<T> = std::result::Result<T, CoordinatorError>;

impl CoordinatorError {
    /// Is this a classification the sandbox provider client / circuit breaker cares about?
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) | Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Unauthorized(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Gone(_) => StatusCode::GONE,
            Self::Conflict(_) => StatusCode::OK,
            Self::Logical(_) => StatusCode::CONFLICT,
            Self::Transient(_) | Self::Permanent(_) | Self::Http(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Storage(_) | Self::Auth(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn to_envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            error: self.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: String,
}

impl From<std::io::Error> for CoordinatorError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for CoordinatorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(format!("json: {err}"))
    }
}

impl From<reqwest::Error> for CoordinatorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            Self::Transient(err.to_string())
        } else {
            Self::Http(err.to_string())
        }
    }
}
