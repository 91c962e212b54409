//! Error types for the orchestration engine

use serde_json::Value;
use std::time::SystemTime;
use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, CallError>;

/// Snapshot of the call that produced an error
#[derive(Debug, Clone)]
pub struct ErrorContext {
    /// Registered method name
    pub method: String,
    /// Params the call was made with
    pub params: Value,
    /// Wall-clock time at which the call failed
    pub timestamp: SystemTime,
}

/// Coarse classification of a [`CallError`], looking through context wrappers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Network,
    Timeout,
    Cancelled,
    Http,
    CircuitOpen,
    Validation,
    MethodNotFound,
    Destroyed,
    QueueFull,
    Config,
    Unknown,
}

/// Error types that can occur while orchestrating a call
///
/// Errors are `Clone` so that every caller coalesced onto one execution
/// observes the same failure.
#[derive(Error, Debug, Clone)]
pub enum CallError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Request cancelled: {0}")]
    Cancelled(String),

    #[error("HTTP error {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Circuit breaker is open for method '{method}', retry in {retry_after_ms}ms")]
    CircuitOpen { method: String, retry_after_ms: u64 },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Orchestrator has been destroyed")]
    Destroyed,

    #[error("Request queue is full ({capacity} tasks waiting)")]
    QueueFull { capacity: usize },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unknown error: {0}")]
    Unknown(String),

    #[error("Call to '{}' failed: {source}", .context.method)]
    Call {
        context: Box<ErrorContext>,
        source: Box<CallError>,
    },
}

impl CallError {
    /// Determine if this error is worth retrying
    ///
    /// Transient failures are retried:
    /// - network errors and timeouts
    /// - 5xx responses, 408 Request Timeout and 429 Too Many Requests
    ///
    /// Everything else is permanent: other 4xx statuses, validation failures,
    /// open circuits, cancellations and configuration problems.
    pub fn should_retry(&self) -> bool {
        match self {
            CallError::Network(_) => true,
            CallError::Timeout(_) => true,
            CallError::Http { status, .. } => {
                (500..600).contains(status) || *status == 408 || *status == 429
            }
            CallError::Call { source, .. } => source.should_retry(),
            CallError::Cancelled(_)
            | CallError::CircuitOpen { .. }
            | CallError::Validation(_)
            | CallError::MethodNotFound(_)
            | CallError::Destroyed
            | CallError::QueueFull { .. }
            | CallError::ConfigError(_)
            | CallError::Unknown(_) => false,
        }
    }

    /// Errors that a custom `retry_on` predicate cannot make retryable
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Validation
                | ErrorKind::CircuitOpen
                | ErrorKind::Cancelled
                | ErrorKind::Destroyed
                | ErrorKind::MethodNotFound
        )
    }

    /// Classify the error, unwrapping any call context
    pub fn kind(&self) -> ErrorKind {
        match self.root() {
            CallError::Network(_) => ErrorKind::Network,
            CallError::Timeout(_) => ErrorKind::Timeout,
            CallError::Cancelled(_) => ErrorKind::Cancelled,
            CallError::Http { .. } => ErrorKind::Http,
            CallError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            CallError::Validation(_) => ErrorKind::Validation,
            CallError::MethodNotFound(_) => ErrorKind::MethodNotFound,
            CallError::Destroyed => ErrorKind::Destroyed,
            CallError::QueueFull { .. } => ErrorKind::QueueFull,
            CallError::ConfigError(_) => ErrorKind::Config,
            CallError::Unknown(_) | CallError::Call { .. } => ErrorKind::Unknown,
        }
    }

    /// The innermost error, skipping context wrappers
    pub fn root(&self) -> &CallError {
        let mut current = self;
        while let CallError::Call { source, .. } = current {
            current = source;
        }
        current
    }

    /// Call context attached when the error left the orchestrator
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            CallError::Call { context, .. } => Some(context),
            _ => None,
        }
    }

    /// HTTP status reported by the transport, if any
    pub fn status(&self) -> Option<u16> {
        match self.root() {
            CallError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.kind() == ErrorKind::Destroyed
    }

    pub fn is_circuit_open(&self) -> bool {
        self.kind() == ErrorKind::CircuitOpen
    }

    /// Attach call context, leaving already-wrapped errors untouched
    pub fn with_context(self, method: impl Into<String>, params: &Value) -> Self {
        if matches!(self, CallError::Call { .. }) {
            return self;
        }
        CallError::Call {
            context: Box::new(ErrorContext {
                method: method.into(),
                params: params.clone(),
                timestamp: SystemTime::now(),
            }),
            source: Box::new(self),
        }
    }

    /// Create an error from a non-success HTTP status code
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        CallError::Http {
            status,
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for CallError {
    fn from(err: serde_json::Error) -> Self {
        CallError::Validation(format!("Failed to decode response data: {}", err))
    }
}
