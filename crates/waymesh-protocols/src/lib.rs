//! Waymesh Protocols - Wire Messages, Pose Gating and Teleport Negotiation
//!
//! # Overview
//!
//! ## Messages
//!
//! [`Message`] is the single tagged envelope exchanged over the overlay. Every
//! handler in the node matches on it exhaustively, so adding a message type
//! is a compile error until each dispatcher handles it.
//!
//! ## Pose
//!
//! [`PoseGate`] decides whether a local pose tick goes out (rate + delta
//! gates, jump bypass). Snapshots carry a [`GeoRef`] so receivers can rebuild
//! height on their own terrain via [`resolve_height`].
//!
//! ## Teleport
//!
//! [`TeleportCoordinator`] owns the request/response ticket table. It is a
//! plain state machine: callers pass `now`, it returns the message to send
//! and never touches the network itself.
//!
//! # Example
//!
//! ```rust
//! use waymesh_peers::PeerKey;
//! use waymesh_protocols::{TeleportConfig, TeleportCoordinator, TicketStatus, Direction};
//!
//! let me = PeerKey([1; 32]);
//! let them = PeerKey([2; 32]);
//! let mut coordinator = TeleportCoordinator::new(me, TeleportConfig::default());
//!
//! let _req = coordinator.request(them, 0).unwrap();
//! assert_eq!(
//!     coordinator.status(them, Direction::Outbound, 50_000),
//!     Some(TicketStatus::Expired),
//! );
//! ```

mod error;
mod handshake;
mod message;
mod pose;

pub use error::{Error, Result};
pub use handshake::{
    Destination, Direction, ResponseOutcome, TeleportConfig, TeleportCoordinator, TeleportTicket,
    TicketStatus, REASON_DECLINED, REASON_TIMEOUT, REASON_UNAVAILABLE,
};
pub use message::{Message, MAX_MESSAGE_BYTES};
pub use pose::{
    quat_angle, resolve_height, yaw_quat, GateDecision, GeoRef, PoseExtras, PoseGate,
    PoseGateConfig, PoseSnapshot, PoseWire, XrHeadState,
};
