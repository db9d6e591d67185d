//! Waymesh Peers
//!
//! Identity and address bookkeeping for the Waymesh overlay.
//!
//! # Design
//!
//! A peer is its ed25519 public key. Each peer may be reachable under several
//! overlay addresses (`<identifier>.<publicKey>`), and every address carries
//! its own quality metrics measured by heartbeats.
//!
//! - [`AddressBook`]: persisted, versioned ledger of every peer ever seen.
//! - [`PeerDirectory`]: live table, bootstrapped from the book.
//! - [`MetricPool`]: per-address RTT / ack / probe bookkeeping.
//! - [`best_addresses`]: deterministic address ranking (RTT ascending,
//!   then most recent ack).
//! - [`Registry`]: the three views kept consistent behind one API.
//!
//! # Conflict Resolution
//!
//! Messages arrive unordered. Every merge is last-timestamp-wins, so a late
//! datagram can never roll a peer's state back.

mod address;
mod book;
mod directory;
mod error;
mod identity;
mod metric;
mod registry;
mod resolver;

pub use address::{Address, PeerKey, KEY_HEX_LEN};
pub use book::{
    AddressBook, BookSnapshot, BookStore, FlushGate, MemoryBookStore, PeerRecord, BOOK_VERSION,
    DEFAULT_DEBOUNCE_MS,
};
pub use directory::{PeerDirectory, PeerRuntime};
pub use error::{Error, Result};
pub use identity::{generate_seed, NodeIdentity, Seed};
pub use metric::{AddressMetric, MetricPool};
pub use registry::{Registry, RosterEntry};
pub use resolver::{best_addresses, compare_rank, Rank};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in unix milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_past_2020() {
        assert!(now_ms() > 1_577_836_800_000);
    }
}
