//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context. Errors that are local to one directive
//! never escape as `Err` into the turn loop; they are folded into that
//! directive's `ExecutionResult` instead.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the agent runtime.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or inconsistent configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Provider or tool process unreachable. Recoverable via restart/retry.
    #[error("connection error: {0}")]
    Connection(String),

    /// Blocked entity, denying rule or server permission flag.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Rate window exhausted for a provider.
    #[error("rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// Suspended outcome awaiting human resolution (not a failure).
    #[error("approval required: {approval_id}")]
    ApprovalRequired { approval_id: String },

    /// Deadline exceeded (subprocess, RPC request).
    #[error("timeout: {0}")]
    Timeout(String),

    /// Execution failed (non-zero exit, tool reported an error).
    #[error("execution error: {0}")]
    Execution(String),

    /// Malformed directive or protocol payload.
    #[error("parse error: {0}")]
    Parse(String),

    /// Unknown server, tool, resource or approval.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid lifecycle state transition.
    #[error("state transition error: {0}")]
    StateTransition(String),

    /// Cancelled by the caller.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Capability not offered by a backend.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Internal errors (including recovered panics).
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable machine-readable code for logs and execution results.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "CONFIGURATION",
            Error::Connection(_) => "CONNECTION",
            Error::PermissionDenied(_) => "PERMISSION_DENIED",
            Error::RateLimitExceeded(_) => "RATE_LIMIT_EXCEEDED",
            Error::ApprovalRequired { .. } => "APPROVAL_REQUIRED",
            Error::Timeout(_) => "EXECUTION_TIMEOUT",
            Error::Execution(_) => "EXECUTION_ERROR",
            Error::Parse(_) => "PARSE_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::StateTransition(_) => "STATE_TRANSITION",
            Error::Cancelled(_) => "CANCELLED",
            Error::Unsupported(_) => "UNSUPPORTED",
            Error::Internal(_) => "INTERNAL",
            Error::Serialization(_) => "SERIALIZATION",
            Error::Io(_) => "IO",
        }
    }

    /// Whether a retry (restart, fallback path) can reasonably succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Connection(_) | Error::Timeout(_) | Error::Io(_) | Error::Internal(_)
        )
    }
}

// Convenience constructors
impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    pub fn rate_limited(msg: impl Into<String>) -> Self {
        Self::RateLimitExceeded(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn state_transition(msg: impl Into<String>) -> Self {
        Self::StateTransition(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
