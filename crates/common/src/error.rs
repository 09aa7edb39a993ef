use thiserror::Error;

/// Common error types for VeilNet
#[derive(Debug, Error)]
pub enum VeilNetError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("No shared key for client {0}")]
    MissingSharedKey(String),

    #[error("Router already registered")]
    DuplicateRouter,

    #[error("Circuit construction failed: {0}")]
    CircuitInitFailed(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Circuit teardown failed: {0}")]
    TeardownFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type for VeilNet operations
pub type Result<T> = std::result::Result<T, VeilNetError>;

impl VeilNetError {
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn crypto(msg: impl Into<String>) -> Self {
        Self::Crypto(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
