//! WolfHA Error Types

use thiserror::Error;

use crate::state::{DomainId, NodeId};

/// Result type alias for WolfHA operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfHA error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Duplicate node id {0} in domain")]
    DuplicateNodeId(NodeId),

    #[error("Node id 0 is reserved")]
    ReservedNodeId,

    #[error("Invalid follower address: {0}")]
    InvalidAddress(String),

    // Membership errors
    #[error("Node not found: {0}")]
    UnknownNode(NodeId),

    #[error("Message for domain {actual} received in domain {expected}")]
    DomainMismatch { expected: DomainId, actual: DomainId },

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Message checksum mismatch")]
    ChecksumMismatch,

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON encoding error: {0}")]
    Json(#[from] serde_json::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Lifecycle errors
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is a transient transport failure worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Network(_)
                | Error::ConnectionFailed { .. }
                | Error::ChecksumMismatch
                | Error::Io(_)
        )
    }

    /// Check if this error was caused by bad configuration
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::ConfigParse(_)
                | Error::DuplicateNodeId(_)
                | Error::ReservedNodeId
                | Error::InvalidAddress(_)
        )
    }
}
