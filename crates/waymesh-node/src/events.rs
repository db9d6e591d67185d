//! Events and read-only views exposed to the presentation layer.

use serde::Serialize;
use waymesh_peers::PeerKey;
use waymesh_protocols::{Direction, GeoRef, TicketStatus, XrHeadState};

/// Coarse health indicator. Ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusLevel {
    Info,
    Warn,
    Error,
}

/// How a peer came to our attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Discovery {
    Direct,
    Roster,
    Rendezvous,
}

/// Something the presentation layer may want to react to.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeEvent {
    /// First hello from a peer during this process lifetime.
    PeerJoined {
        #[serde(rename = "pub")]
        key: PeerKey,
        alias: Option<String>,
    },
    /// A peer should exist as a remote entity.
    PeerSurfaced {
        #[serde(rename = "pub")]
        key: PeerKey,
        addr: Option<String>,
        via: Discovery,
    },
    AliasChanged {
        #[serde(rename = "pub")]
        key: PeerKey,
        alias: Option<String>,
    },
    /// A remote pose, with height already placed on local terrain.
    RemotePose {
        #[serde(rename = "pub")]
        key: PeerKey,
        ts: u64,
        position: [f64; 3],
        orientation: [f64; 4],
        crouch: bool,
        jump: bool,
        xr: Option<XrHeadState>,
        geo: Option<GeoRef>,
    },
    TeleportRequested {
        #[serde(rename = "pub")]
        key: PeerKey,
    },
    TeleportResolved {
        #[serde(rename = "pub")]
        key: PeerKey,
        direction: Direction,
        status: TicketStatus,
        reason: Option<String>,
    },
    Status {
        level: StatusLevel,
        detail: String,
    },
}

/// One row of the peer list.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerView {
    #[serde(rename = "pub")]
    pub key: PeerKey,
    pub alias: Option<String>,
    pub online: bool,
    pub last_seen: u64,
    pub geo: Option<GeoRef>,
    pub incoming_ticket_status: Option<TicketStatus>,
    pub outgoing_ticket_status: Option<TicketStatus>,
}

/// Node-level status.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub public_key: PeerKey,
    pub address: String,
    pub relay_healthy: bool,
    pub status: StatusLevel,
    pub detail: String,
    pub sent: u64,
    pub dropped: u64,
    pub peers: usize,
    pub online: usize,
}
