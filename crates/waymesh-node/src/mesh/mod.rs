//! Mesh service: presence, health, pose sync and teleport over the overlay.
//!
//! [`MeshState`] holds every piece of peer state and is driven purely by
//! `(message, now)` and timer ticks; each call returns [`Effects`] describing
//! what to send and emit. [`MeshNode`] owns the state behind one lock, the
//! overlay, and the collaborators, and executes those effects after the lock
//! is released.

mod health;
mod node;
mod pose_sync;
mod presence;
mod rendezvous;
mod state;
mod teleport;

pub use node::{MeshNode, MeshStats};
pub use state::{Effects, MeshState, Outbound, RemotePose, Sender};

use waymesh_peers::DEFAULT_DEBOUNCE_MS;
use waymesh_protocols::{PoseGateConfig, TeleportConfig};
use waymesh_transfer::RetryPolicy;

/// Heartbeat period.
pub const HEARTBEAT_INTERVAL_MS: u64 = 6_000;
/// An address is healthy if it acked within this window.
pub const HEALTH_WINDOW_MS: u64 = 18_000;
/// Address book sweep period while the relay is unhealthy.
pub const SWEEP_INTERVAL_MS: u64 = 5_000;
/// Roster refresh period.
pub const ROSTER_REFRESH_MS: u64 = 15_000;
/// A peer is online if any of its addresses acked within this window.
pub const ONLINE_WINDOW_MS: u64 = 15_000;
/// How often the book flush deadline is checked.
pub const FLUSH_TICK_MS: u64 = 200;
/// Timeout for one terrain lookup.
pub const TERRAIN_TIMEOUT_MS: u64 = 1_500;

/// Mesh configuration.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub heartbeat_interval_ms: u64,
    pub health_window_ms: u64,
    pub sweep_interval_ms: u64,
    pub roster_refresh_ms: u64,
    pub online_window_ms: u64,
    pub debounce_ms: u64,
    pub flush_tick_ms: u64,
    pub terrain_timeout_ms: u64,
    pub teleport: TeleportConfig,
    pub pose_gate: PoseGateConfig,
    pub retry: RetryPolicy,
    /// Well-known relay address, used as last-resort route.
    pub relay: Option<String>,
    /// Our display name.
    pub alias: Option<String>,
    /// Addresses probed at startup and during sweeps.
    pub bootstrap: Vec<String>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: HEARTBEAT_INTERVAL_MS,
            health_window_ms: HEALTH_WINDOW_MS,
            sweep_interval_ms: SWEEP_INTERVAL_MS,
            roster_refresh_ms: ROSTER_REFRESH_MS,
            online_window_ms: ONLINE_WINDOW_MS,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            flush_tick_ms: FLUSH_TICK_MS,
            terrain_timeout_ms: TERRAIN_TIMEOUT_MS,
            teleport: TeleportConfig::default(),
            pose_gate: PoseGateConfig::default(),
            retry: RetryPolicy::default(),
            relay: None,
            alias: None,
            bootstrap: Vec::new(),
        }
    }
}

impl MeshConfig {
    pub fn with_relay(mut self, relay: impl Into<String>) -> Self {
        self.relay = Some(relay.into());
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_bootstrap(mut self, bootstrap: Vec<String>) -> Self {
        self.bootstrap = bootstrap;
        self
    }
}
