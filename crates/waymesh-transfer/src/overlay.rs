//! Transport abstraction for the overlay.
//!
//! The node only talks to [`Overlay`] and [`Session`]; production uses
//! [`UdpOverlay`](crate::UdpOverlay), tests and simulations use
//! [`MemoryOverlay`](crate::MemoryOverlay). Inbound traffic from both
//! datagrams and sessions arrives on the single `mpsc::Receiver<Inbound>`
//! handed out when the overlay is created.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// A payload received from the overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    /// Overlay address of the sender as reported by the transport.
    pub src: String,
    pub payload: Bytes,
}

/// A reliable, ordered stream to one remote address.
#[async_trait]
pub trait Session: Send + Sync + fmt::Debug {
    /// Address this session was dialed to.
    fn remote(&self) -> &str;

    fn is_alive(&self) -> bool;

    async fn send(&self, payload: &[u8]) -> Result<()>;
}

/// Address-addressable messaging substrate.
#[async_trait]
pub trait Overlay: Send + Sync + 'static {
    /// This endpoint's overlay address, `<identifier>.<publicKey>`.
    fn local_address(&self) -> String;

    /// Best-effort datagram. No delivery acknowledgement.
    async fn send(&self, to: &str, payload: &[u8]) -> Result<()>;

    /// Open a reliable session.
    async fn dial(&self, to: &str) -> Result<Arc<dyn Session>>;
}
