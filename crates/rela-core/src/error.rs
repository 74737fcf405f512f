// SPDX-License-Identifier: Apache-2.0

//! Normalized error types for the dispatch layer
//!
//! All engine-specific errors are mapped to these unified error types so that
//! generic callers can branch on the kind and on retryability without knowing
//! which native client produced the failure. The engine's own message is
//! always preserved.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for all dispatch operations
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
pub enum EngineError {
    #[error("Malformed connection URI: {message}")]
    MalformedUri { message: String },

    #[error("Unknown engine for scheme '{scheme}'")]
    UnknownEngine { scheme: String },

    #[error("Conflicting engine registration: {message}")]
    EngineConflict { message: String },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Authentication failed: {message}")]
    AuthFailed { message: String },

    #[error("Operation timed out after {timeout_ms}ms: {message}")]
    Timeout { message: String, timeout_ms: u64 },

    #[error("Query syntax error: {message}")]
    SyntaxError { message: String },

    #[error("Query execution error: {message}")]
    ExecutionError { message: String, retryable: bool },

    #[error("Capability not supported: {message}")]
    UnsupportedCapability { message: String },

    #[error("Connection pool exhausted: {message}")]
    PoolExhausted { message: String },
}

/// Discriminant of [`EngineError`], convenient for assertions and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MalformedUri,
    UnknownEngine,
    EngineConflict,
    ConnectionFailed,
    AuthFailed,
    Timeout,
    SyntaxError,
    ExecutionError,
    UnsupportedCapability,
    PoolExhausted,
}

impl EngineError {
    pub fn malformed_uri(msg: impl Into<String>) -> Self {
        Self::MalformedUri { message: msg.into() }
    }

    pub fn unknown_engine(scheme: impl Into<String>) -> Self {
        Self::UnknownEngine { scheme: scheme.into() }
    }

    pub fn engine_conflict(msg: impl Into<String>) -> Self {
        Self::EngineConflict { message: msg.into() }
    }

    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed { message: msg.into() }
    }

    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::AuthFailed { message: msg.into() }
    }

    pub fn timeout(msg: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            message: msg.into(),
            timeout_ms,
        }
    }

    pub fn syntax_error(msg: impl Into<String>) -> Self {
        Self::SyntaxError { message: msg.into() }
    }

    /// Execution failure that retrying will not fix.
    pub fn execution_error(msg: impl Into<String>) -> Self {
        Self::ExecutionError {
            message: msg.into(),
            retryable: false,
        }
    }

    /// Execution failure caused by something transient (cancellation, a
    /// dropped session, a busy server).
    pub fn execution_retryable(msg: impl Into<String>) -> Self {
        Self::ExecutionError {
            message: msg.into(),
            retryable: true,
        }
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedCapability { message: msg.into() }
    }

    pub fn pool_exhausted(msg: impl Into<String>) -> Self {
        Self::PoolExhausted { message: msg.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedUri { .. } => ErrorKind::MalformedUri,
            Self::UnknownEngine { .. } => ErrorKind::UnknownEngine,
            Self::EngineConflict { .. } => ErrorKind::EngineConflict,
            Self::ConnectionFailed { .. } => ErrorKind::ConnectionFailed,
            Self::AuthFailed { .. } => ErrorKind::AuthFailed,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::SyntaxError { .. } => ErrorKind::SyntaxError,
            Self::ExecutionError { .. } => ErrorKind::ExecutionError,
            Self::UnsupportedCapability { .. } => ErrorKind::UnsupportedCapability,
            Self::PoolExhausted { .. } => ErrorKind::PoolExhausted,
        }
    }

    /// Whether the caller may reasonably retry the operation.
    ///
    /// The layer never retries on its own; this is advisory only.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionFailed { .. } | Self::Timeout { .. } | Self::PoolExhausted { .. } => {
                true
            }
            Self::ExecutionError { retryable, .. } => *retryable,
            Self::MalformedUri { .. }
            | Self::UnknownEngine { .. }
            | Self::EngineConflict { .. }
            | Self::AuthFailed { .. }
            | Self::SyntaxError { .. }
            | Self::UnsupportedCapability { .. } => false,
        }
    }

    /// The underlying message, as reported by the engine where one exists.
    pub fn message(&self) -> &str {
        match self {
            Self::UnknownEngine { scheme } => scheme,
            Self::MalformedUri { message }
            | Self::EngineConflict { message }
            | Self::ConnectionFailed { message }
            | Self::AuthFailed { message }
            | Self::Timeout { message, .. }
            | Self::SyntaxError { message }
            | Self::ExecutionError { message, .. }
            | Self::UnsupportedCapability { message }
            | Self::PoolExhausted { message } => message,
        }
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
