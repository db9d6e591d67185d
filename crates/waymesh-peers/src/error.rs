//! Error types for waymesh-peers.

use thiserror::Error;

/// Result type for peer bookkeeping operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while handling identities and addresses.
#[derive(Debug, Error)]
pub enum Error {
    /// The overlay address could not be parsed.
    #[error("invalid overlay address: {0}")]
    InvalidAddress(String),

    /// The public key is not 64 hex characters.
    #[error("invalid public key: {0}")]
    InvalidKey(String),

    /// The persisted book could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backing store rejected a read or write.
    #[error("store error: {0}")]
    Store(String),
}
