//! Error types for Neural Bridge.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using the bridge's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Machine-readable error classification carried on results and responses.
///
/// The front-end renders messages from this value; it never parses free text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    PoolExhausted,
    StartupTimeout,
    ProcessSpawnFailed,
    HealthCheckFailed,
    CoordinationUnavailable,
    Timeout,
    SecurityRejected,
    RateLimited,
    SessionExpired,
    PermissionDenied,
    InvalidPayload,
    /// The tool ran and reported failure (non-zero exit).
    ToolExecutionFailed,
    NotFound,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PoolExhausted => "PoolExhausted",
            Self::StartupTimeout => "StartupTimeout",
            Self::ProcessSpawnFailed => "ProcessSpawnFailed",
            Self::HealthCheckFailed => "HealthCheckFailed",
            Self::CoordinationUnavailable => "CoordinationUnavailable",
            Self::Timeout => "Timeout",
            Self::SecurityRejected => "SecurityRejected",
            Self::RateLimited => "RateLimited",
            Self::SessionExpired => "SessionExpired",
            Self::PermissionDenied => "PermissionDenied",
            Self::InvalidPayload => "InvalidPayload",
            Self::ToolExecutionFailed => "ToolExecutionFailed",
            Self::NotFound => "NotFound",
            Self::Internal => "Internal",
        }
    }

    /// Whether this kind originates from the security gate.
    pub fn is_security(&self) -> bool {
        matches!(
            self,
            Self::SecurityRejected
                | Self::RateLimited
                | Self::SessionExpired
                | Self::PermissionDenied
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejections produced by the IPC security gate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecurityError {
    #[error("payload of {size} bytes exceeds the {limit} byte ceiling")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("payload rejected by content filter")]
    MaliciousPayload { pattern: String },

    #[error("unknown session")]
    UnknownSession,

    #[error("session expired")]
    SessionExpired,

    #[error("command '{command}' is not permitted for this session")]
    PermissionDenied { command: String },

    #[error("rate limit exceeded for '{command_class}', retry after {retry_after_ms}ms")]
    RateLimited {
        command_class: String,
        retry_after_ms: u64,
    },
}

impl SecurityError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PayloadTooLarge { .. } => ErrorKind::InvalidPayload,
            Self::MaliciousPayload { .. } | Self::UnknownSession => ErrorKind::SecurityRejected,
            Self::SessionExpired => ErrorKind::SessionExpired,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
        }
    }

    /// Short reason code used in audit records and logs.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::MaliciousPayload { .. } => "malicious_payload",
            Self::UnknownSession => "unknown_session",
            Self::SessionExpired => "session_expired",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::RateLimited { .. } => "rate_limited",
        }
    }
}

/// Core error type for Neural Bridge.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Sandbox Errors
    // =========================================================================
    #[error("Port pool exhausted: all {capacity} ports are leased")]
    PoolExhausted { capacity: usize },

    #[error("Sandbox {id} did not become healthy within {timeout_secs}s")]
    StartupTimeout { id: String, timeout_secs: u64 },

    #[error("Process spawn failed: {0}")]
    ProcessSpawnFailed(String),

    #[error("Health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("Sandbox not found: {0}")]
    SandboxNotFound(String),

    // =========================================================================
    // Orchestration Errors
    // =========================================================================
    #[error("Coordination endpoint unavailable: {0}")]
    CoordinationUnavailable(String),

    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    // =========================================================================
    // Security / Gateway Errors
    // =========================================================================
    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    // =========================================================================
    // Generic Errors
    // =========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Classify the error for the response envelope.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            Self::StartupTimeout { .. } => ErrorKind::StartupTimeout,
            Self::ProcessSpawnFailed(_) => ErrorKind::ProcessSpawnFailed,
            Self::HealthCheckFailed(_) => ErrorKind::HealthCheckFailed,
            Self::SandboxNotFound(_) | Self::UnknownCommand(_) => ErrorKind::NotFound,
            Self::CoordinationUnavailable(_) => ErrorKind::CoordinationUnavailable,
            Self::ToolExecution(_) => ErrorKind::ToolExecutionFailed,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Security(e) => e.kind(),
            Self::InvalidPayload(_) | Self::Serialization(_) => ErrorKind::InvalidPayload,
            Self::Config(_) | Self::Internal(_) | Self::Other(_) => ErrorKind::Internal,
        }
    }

    /// Create a process spawn error.
    pub fn spawn_failed(msg: impl Into<String>) -> Self {
        Self::ProcessSpawnFailed(msg.into())
    }

    /// Create a coordination error.
    pub fn coordination(msg: impl Into<String>) -> Self {
        Self::CoordinationUnavailable(msg.into())
    }

    /// Create an invalid payload error.
    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Self::InvalidPayload(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
