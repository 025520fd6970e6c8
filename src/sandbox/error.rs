//! Domain-specific error types for sandbox operations.
//!
//! Typed errors enable callers to match on specific failure modes
//! rather than parsing error message strings.

use std::time::Duration;

/// Errors that can occur during sandbox operations.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Orchestrator (Docker daemon, kubectl) is not running or not accessible.
    #[error("Orchestrator is not available: {message}")]
    Unavailable { message: String },

    /// Sandbox did not become ready in time.
    #[error("Sandbox {name} not ready after {timeout_secs} seconds")]
    Timeout { name: String, timeout_secs: u64 },

    /// Sandbox is in an unrecoverable state (exited, dead, removing, etc.).
    #[error("Sandbox {name} is unhealthy: {message}")]
    Unhealthy { name: String, message: String },

    /// Sandbox does not exist.
    #[error("Sandbox not found: {name}")]
    NotFound { name: String },

    /// Orchestrator operation failed (create, exec, copy, tunnel, etc.).
    #[error("Sandbox operation '{operation}' failed: {message}")]
    OperationFailed { operation: String, message: String },
}

impl SandboxError {
    /// Creates an `Unavailable` error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Creates a `Timeout` error from a `Duration`.
    pub fn timeout(name: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            name: name.into(),
            timeout_secs: duration.as_secs(),
        }
    }

    /// Creates an `Unhealthy` error.
    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unhealthy {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Creates a `NotFound` error.
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    /// Creates an `OperationFailed` error.
    pub fn failed(operation: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::OperationFailed {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Returns true if this is a readiness timeout.
    #[allow(dead_code)] // Public API for callers
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true if the orchestrator could not be reached.
    #[allow(dead_code)] // Public API for callers
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    /// Returns true if the sandbox does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
