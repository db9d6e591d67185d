//! Waymesh Node - Peer Mesh Presence
//!
//! A peer-to-peer node that keeps a small group of users aware of each other:
//! who is around, where their avatars are, and whether they want to teleport
//! to one another. Built on the Waymesh overlay.
//!
//! # Architecture
//!
//! - **Mesh**: [`MeshState`] state machine (presence, health, pose sync,
//!   teleport, rendezvous bridge) driven by [`MeshNode`]
//! - **Storage**: RocksDB-backed identity seed and address book
//! - **Terrain**: elevation lookups for geo-referenced remote poses
//! - **API**: HTTP endpoints and a WebSocket event stream for the local client
//!
//! # Example
//!
//! ```no_run
//! use waymesh_node::{NodeConfig, WaymeshNode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NodeConfig::from_env()?;
//!     let node = WaymeshNode::new(config)?;
//!     node.run().await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod clock;
pub mod collaborators;
pub mod error;
pub mod events;
pub mod mesh;
pub mod node;
pub mod storage;
pub mod terrain;
pub mod ws;

pub use clock::{Clock, ManualClock, SystemClock};
pub use collaborators::{
    ConnectionState, Host, MemoryHost, Rendezvous, RendezvousEvent, RendezvousMeta, Terrain,
};
pub use error::{Error, Result};
pub use events::{Discovery, NodeEvent, PeerView, StatusLevel, StatusReport};
pub use mesh::{Effects, MeshConfig, MeshNode, MeshState, MeshStats, Outbound};
pub use node::{NodeConfig, WaymeshNode};
pub use storage::Storage;
