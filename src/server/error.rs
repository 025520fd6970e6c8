//! Errors raised while serving a request, and their wire error codes.

use std::io;

use crate::lease::LeaseError;
use crate::paths::PathError;
use crate::protocol::{
    RpcError, ERR_CANCELLED, ERR_INTERNAL, ERR_INVALID_PARAMS, ERR_IO, ERR_LAUNCH,
    ERR_LEASE_HELD, ERR_LEASE_REQUIRED, ERR_METHOD_NOT_FOUND, ERR_NOT_FOUND, ERR_PATH_ESCAPE,
};

/// Errors that can occur while the agent handles a call.
#[derive(Debug, thiserror::Error)]
pub(crate) enum AgentError {
    /// Request parameters did not match the method.
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// Unknown method name.
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// Relative path could not be resolved inside the root.
    #[error(transparent)]
    Path(#[from] PathError),

    /// Requested file does not exist.
    #[error("File not found: {path}")]
    NotFound { path: String },

    /// Filesystem operation failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    /// `task/run` was called with an empty command line.
    #[error("Task command line is empty")]
    EmptyCommand,

    /// The task process could not be started.
    #[error("Failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The task was cancelled before it finished.
    #[error("Task was cancelled")]
    Cancelled,

    /// Lease acquisition failed.
    #[error(transparent)]
    Lease(#[from] LeaseError),

    /// A mutating call arrived without this connection's lease token.
    #[error("This call requires the session lease")]
    LeaseRequired,
}

impl AgentError {
    /// Creates an `Io` error, mapping `NotFound` to its own variant.
    pub fn io(path: impl Into<String>, source: io::Error) -> Self {
        let path = path.into();
        if source.kind() == io::ErrorKind::NotFound {
            Self::NotFound { path }
        } else {
            Self::Io { path, source }
        }
    }

    /// Creates an `InvalidParams` error.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams(message.into())
    }

    /// Returns true if the task process could not be started.
    #[allow(dead_code)] // Public API for callers
    pub fn is_launch_failure(&self) -> bool {
        matches!(self, Self::Launch { .. })
    }

    /// Wire error code for this error.
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidParams(_) | Self::EmptyCommand | Self::Path(PathError::Empty) => {
                ERR_INVALID_PARAMS
            }
            Self::MethodNotFound(_) => ERR_METHOD_NOT_FOUND,
            Self::Path(PathError::Escapes { .. }) => ERR_PATH_ESCAPE,
            Self::Path(PathError::Io { .. }) | Self::Io { .. } => ERR_IO,
            Self::NotFound { .. } => ERR_NOT_FOUND,
            Self::Launch { .. } => ERR_LAUNCH,
            Self::Cancelled => ERR_CANCELLED,
            Self::Lease(LeaseError::Held { .. }) => ERR_LEASE_HELD,
            Self::Lease(LeaseError::Io { .. }) => ERR_INTERNAL,
            Self::LeaseRequired => ERR_LEASE_REQUIRED,
        }
    }

    /// Converts into the wire error object.
    pub fn to_rpc(&self) -> RpcError {
        RpcError {
            code: self.code(),
            message: self.to_string(),
        }
    }
}
