//! Error types for beacon service discovery.

/// Main error type for discovery operations.
///
/// Errors fall into two classes. Setup errors ([`InvalidArgument`],
/// [`ConnectionSetup`]) are returned to the caller and never retried.
/// Everything else is raised while talking to a coordination store and is
/// absorbed by the heartbeat and watch loops, which log and retry.
///
/// [`InvalidArgument`]: DiscoveryError::InvalidArgument
/// [`ConnectionSetup`]: DiscoveryError::ConnectionSetup
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiscoveryError {
    /// A caller supplied an unusable value (empty service name, zero port, ...)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The store client could not be built (malformed address list, ...)
    #[error("connection setup failed: {0}")]
    ConnectionSetup(String),

    /// Network-level failure talking to the store
    #[error("transport error: {0}")]
    Transport(String),

    /// The store did not answer in time
    #[error("request to coordination store timed out")]
    Timeout,

    /// The store answered with an unexpected status code
    #[error("store returned status {status}: {message}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Body or error message returned by the store
        message: String,
    },

    /// The store reports the requested key or record as missing
    #[error("not found: {0}")]
    NotFound(String),

    /// The store response could not be decoded
    #[error("malformed store response: {0}")]
    Decode(String),
}

impl DiscoveryError {
    /// Create an invalid argument error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Create a connection setup error.
    #[must_use]
    pub fn connection_setup(message: impl Into<String>) -> Self {
        Self::ConnectionSetup(message.into())
    }

    /// Check if this error is a setup error that must be returned to the caller.
    #[must_use]
    pub fn is_setup(&self) -> bool {
        matches!(self, Self::InvalidArgument(_) | Self::ConnectionSetup(_))
    }

    /// Check if retrying the same request later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Check if the store reported the target as missing.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T, E = DiscoveryError> = std::result::Result<T, E>;
