//! External collaborators the mesh talks to.
//!
//! - [`Terrain`]: elevation lookups for received geo-referenced poses.
//! - [`Rendezvous`]: room-scoped discovery that seeds the peer table
//!   independently of direct messaging. Its events arrive on an
//!   `mpsc::Receiver<RendezvousEvent>` handed to [`MeshNode::run`](crate::MeshNode::run).
//! - [`Host`]: the application that offers and applies teleport destinations.

use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use waymesh_peers::PeerKey;
use waymesh_protocols::Destination;

use crate::error::Result;

/// Batch elevation source.
#[async_trait]
pub trait Terrain: Send + Sync {
    /// Ground height for each `(lat, lon)`, in order. `None` where the
    /// service has no data.
    async fn query_batch(&self, points: &[(f64, f64)], timeout: Duration)
        -> Result<Vec<Option<f64>>>;
}

/// Metadata exchanged through the rendezvous service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RendezvousMeta {
    /// Overlay address the peer can be reached at.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub ts: Option<u64>,
}

/// Connection state of the rendezvous client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RendezvousEvent {
    /// A peer announced presence in the room.
    Peer { key: PeerKey, meta: RendezvousMeta },
    /// Persisted room snapshot, delivered on (re)join.
    Snapshot { peers: Vec<(PeerKey, RendezvousMeta)> },
    /// A peer handshaked us directly.
    Handshake {
        key: PeerKey,
        meta: RendezvousMeta,
        want_ack: bool,
    },
    /// A peer acknowledged our handshake.
    HandshakeAck { key: PeerKey, meta: RendezvousMeta },
    Status(ConnectionState),
}

/// Discovery service client.
#[async_trait]
pub trait Rendezvous: Send + Sync {
    async fn presence(&self, meta: &RendezvousMeta) -> Result<()>;

    async fn handshake(&self, peer: PeerKey, meta: &RendezvousMeta, want_ack: bool) -> Result<()>;

    async fn handshake_all(&self, meta: &RendezvousMeta, want_ack: bool) -> Result<()>;
}

/// The application embedding the mesh.
pub trait Host: Send + Sync {
    /// Where a peer accepted for teleport would land, if anywhere.
    fn destination_offer(&self) -> Option<Destination>;

    /// Move the local user. Returns whether it succeeded.
    fn apply_destination(&self, dest: &Destination) -> bool;
}

/// A host holding a settable offer and recording applied destinations.
#[derive(Debug, Default)]
pub struct MemoryHost {
    offer: RwLock<Option<Destination>>,
    applied: Mutex<Vec<Destination>>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offer(&self, offer: Option<Destination>) {
        *self.offer.write().unwrap_or_else(PoisonError::into_inner) = offer;
    }

    pub fn applied(&self) -> Vec<Destination> {
        self.applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Host for MemoryHost {
    fn destination_offer(&self) -> Option<Destination> {
        *self.offer.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply_destination(&self, dest: &Destination) -> bool {
        self.applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(*dest);
        true
    }
}
