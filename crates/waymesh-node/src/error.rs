//! Error types for the Waymesh node.

use thiserror::Error;

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in node operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Network error
    #[error("Network error: {0}")]
    Network(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] waymesh_protocols::Error),

    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rocksdb::Error> for Error {
    fn from(e: rocksdb::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<waymesh_transfer::SendError> for Error {
    fn from(e: waymesh_transfer::SendError) -> Self {
        Error::Network(e.to_string())
    }
}

impl From<waymesh_peers::Error> for Error {
    fn from(e: waymesh_peers::Error) -> Self {
        Error::Storage(e.to_string())
    }
}
