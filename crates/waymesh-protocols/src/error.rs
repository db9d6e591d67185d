//! Error types for waymesh-protocols.

use thiserror::Error;
use waymesh_peers::PeerKey;

/// Result type for protocol operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during protocol operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The payload is not a well-formed message.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Encoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An outbound teleport request to this peer is already pending.
    #[error("teleport request to {0} already pending")]
    TicketPending(PeerKey),

    /// No pending inbound teleport request from this peer.
    #[error("no pending teleport request from {0}")]
    UnknownTicket(PeerKey),
}
