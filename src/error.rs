//! Error Types
//!
//! Per-attempt provider errors and the terminal errors surfaced to callers.

use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Classification of a failed provider call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 401/403: the credential was rejected
    Auth,

    /// 429 scoped to the key
    RateLimited,

    /// 429 whose message reports a provider-wide overload
    Overloaded,

    /// 5xx
    Server,

    /// The attempt exceeded its timeout
    Timeout,

    /// Connection could not be established or was dropped
    Connection,

    /// 400/422: the request itself is malformed
    Validation,

    /// Any other non-success status or undecodable response
    Unexpected,
}

impl ErrorKind {
    /// Whether another attempt (usually on another key) may succeed
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited
                | ErrorKind::Overloaded
                | ErrorKind::Server
                | ErrorKind::Timeout
                | ErrorKind::Connection
        )
    }

    /// Whether the failure is attributed to the key's upstream health
    pub fn trips_breaker(self) -> bool {
        matches!(
            self,
            ErrorKind::Server | ErrorKind::Timeout | ErrorKind::Connection
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Auth => "auth",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Overloaded => "overloaded",
            ErrorKind::Server => "server",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Connection => "connection",
            ErrorKind::Validation => "validation",
            ErrorKind::Unexpected => "unexpected",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure of a single provider call
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind} error{}: {message}", .status_code.map(|s| format!(" ({})", s)).unwrap_or_default())]
pub struct ApiError {
    pub kind: ErrorKind,
    pub status_code: Option<u16>,
    pub retry_after: Option<Duration>,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status_code: None,
            retry_after: None,
            message: message.into(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message).with_status(401)
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
            .with_status(429)
            .with_retry_after(retry_after)
    }

    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Server, message).with_status(status)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message).with_status(422)
    }

    /// Map a non-success HTTP status and provider message to an error
    pub fn from_status(status: u16, message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let message = message.into();
        let kind = match status {
            401 | 403 => ErrorKind::Auth,
            429 if is_overload_message(&message) => ErrorKind::Overloaded,
            429 => ErrorKind::RateLimited,
            400 | 422 => ErrorKind::Validation,
            500..=599 => ErrorKind::Server,
            _ => ErrorKind::Unexpected,
        };

        Self::new(kind, message)
            .with_status(status)
            .with_retry_after(retry_after)
    }
}

fn is_overload_message(message: &str) -> bool {
    message.to_lowercase().contains("overloaded")
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::timeout(format!("Request timed out: {}", err))
        } else if err.is_connect() || err.is_request() {
            ApiError::connection(format!("Connection failed: {}", err))
        } else if err.is_decode() {
            ApiError::new(
                ErrorKind::Unexpected,
                format!("Failed to decode response: {}", err),
            )
        } else {
            ApiError::connection(err.to_string())
        }
    }
}

/// Errors surfaced to callers of the pool client
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Invalid or missing configuration, detected at construction
    #[error("Configuration error: {0}")]
    Config(String),

    /// A non-retryable provider error (auth, validation, unexpected status)
    #[error(transparent)]
    Api(ApiError),

    /// No key could serve the request
    #[error("Service unavailable: {reason} (attempts: {attempts}, keys tried: {})", .keys_tried.len())]
    ServiceUnavailable {
        reason: String,
        attempts: u32,
        keys_tried: Vec<String>,
        last_error: Option<ApiError>,
    },

    /// Every allowed attempt failed with a retryable error
    #[error("Request failed after {attempts} attempt(s) across {} key(s): {last_error}", .keys_tried.len())]
    RetriesExhausted {
        attempts: u32,
        keys_tried: Vec<String>,
        last_error: ApiError,
    },

    /// The provider answered but the payload was not what we expected
    #[error("Response error: {0}")]
    Response(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PoolError {
    fn api_error(&self) -> Option<&ApiError> {
        match self {
            PoolError::Api(err) => Some(err),
            PoolError::RetriesExhausted { last_error, .. } => Some(last_error),
            PoolError::ServiceUnavailable { last_error, .. } => last_error.as_ref(),
            _ => None,
        }
    }

    /// Kind of the underlying provider error, if any
    pub fn kind(&self) -> Option<ErrorKind> {
        self.api_error().map(|e| e.kind)
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            PoolError::ServiceUnavailable { .. } => Some(503),
            _ => self.api_error().and_then(|e| e.status_code),
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.api_error().and_then(|e| e.retry_after)
    }

    pub fn is_service_unavailable(&self) -> bool {
        matches!(self, PoolError::ServiceUnavailable { .. })
    }
}

impl From<ApiError> for PoolError {
    fn from(err: ApiError) -> Self {
        PoolError::Api(err)
    }
}

impl From<serde_json::Error> for PoolError {
    fn from(err: serde_json::Error) -> Self {
        PoolError::Response(format!("JSON parsing error: {}", err))
    }
}

impl From<std::io::Error> for PoolError {
    fn from(err: std::io::Error) -> Self {
        PoolError::Config(format!("IO error: {}", err))
    }
}

#[cfg(feature = "python")]
impl From<PoolError> for pyo3::PyErr {
    fn from(err: PoolError) -> pyo3::PyErr {
        use pyo3::exceptions::{PyConnectionError, PyPermissionError, PyRuntimeError, PyValueError};

        let msg = err.to_string();
        match err.kind() {
            _ if matches!(err, PoolError::Config(_)) => PyValueError::new_err(msg),
            Some(ErrorKind::Auth) => PyPermissionError::new_err(msg),
            Some(ErrorKind::Validation) => PyValueError::new_err(msg),
            Some(ErrorKind::Timeout) | Some(ErrorKind::Connection) => {
                PyConnectionError::new_err(msg)
            }
            _ => PyRuntimeError::new_err(msg),
        }
    }
}

/// Result type alias for pool operations
pub type Result<T> = std::result::Result<T, PoolError>;
