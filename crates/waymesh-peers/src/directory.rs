//! Live in-memory peer table.
//!
//! Bootstrapped from the address book, then kept current by every protocol
//! message. Merges are last-timestamp-wins so out-of-order delivery never
//! rolls a peer back.

use std::collections::HashMap;

use serde::Serialize;

use crate::address::PeerKey;
use crate::book::PeerRecord;

/// Live view of one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRuntime {
    #[serde(rename = "pub")]
    pub key: PeerKey,
    /// Most recently observed address for this peer.
    pub candidate_addr: Option<String>,
    /// Last time the peer was heard from (unix millis).
    pub last_seen_ts: u64,
    /// Display name.
    pub alias: Option<String>,
}

impl PeerRuntime {
    /// Fresh entry.
    pub fn new(key: PeerKey) -> Self {
        Self {
            key,
            candidate_addr: None,
            last_seen_ts: 0,
            alias: None,
        }
    }
}

/// The live peer table.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: HashMap<PeerKey, PeerRuntime>,
}

impl PeerDirectory {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry for `key`.
    pub fn get(&self, key: &PeerKey) -> Option<&PeerRuntime> {
        self.peers.get(key)
    }

    /// Whether `key` is known.
    pub fn contains(&self, key: &PeerKey) -> bool {
        self.peers.contains_key(key)
    }

    /// Entry for `key`, created if missing.
    pub fn upsert(&mut self, key: PeerKey) -> &mut PeerRuntime {
        self.peers.entry(key).or_insert_with(|| PeerRuntime::new(key))
    }

    /// Superset-merge a persisted record into the live entry.
    pub fn absorb_record(&mut self, record: &PeerRecord) {
        let entry = self.upsert(record.key);
        entry.last_seen_ts = entry.last_seen_ts.max(record.last_seen_ts);
        if entry.candidate_addr.is_none() {
            entry.candidate_addr = record.addresses.first().map(|m| m.addr.clone());
        }
    }

    /// Observation of `key` at `addr` stamped `ts`.
    ///
    /// The candidate address only moves forward in time: a stale observation
    /// never replaces a fresher one.
    pub fn touch(&mut self, key: PeerKey, addr: Option<&str>, ts: u64) {
        let entry = self.upsert(key);
        if let Some(addr) = addr {
            if entry.candidate_addr.is_none() || ts >= entry.last_seen_ts {
                entry.candidate_addr = Some(addr.to_string());
            }
        }
        entry.last_seen_ts = entry.last_seen_ts.max(ts);
    }

    /// Update the display name. Returns `true` if it changed.
    pub fn set_alias(&mut self, key: PeerKey, alias: Option<String>) -> bool {
        let alias = alias.map(|a| a.trim().to_string()).filter(|a| !a.is_empty());
        let entry = self.upsert(key);
        if entry.alias == alias {
            return false;
        }
        entry.alias = alias;
        true
    }

    /// All entries.
    pub fn iter(&self) -> impl Iterator<Item = &PeerRuntime> {
        self.peers.values()
    }

    /// Number of peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether the directory is empty.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::AddressMetric;

    fn key(b: u8) -> PeerKey {
        PeerKey([b; 32])
    }

    #[test]
    fn touch_is_last_timestamp_wins() {
        let mut dir = PeerDirectory::new();
        dir.touch(key(1), Some("new"), 200);
        dir.touch(key(1), Some("old"), 100);
        let p = dir.get(&key(1)).unwrap();
        assert_eq!(p.candidate_addr.as_deref(), Some("new"));
        assert_eq!(p.last_seen_ts, 200);
    }

    #[test]
    fn absorb_record_is_superset_merge() {
        let mut dir = PeerDirectory::new();
        dir.touch(key(1), Some("live"), 900);
        dir.set_alias(key(1), Some("ada".into()));

        let mut record = PeerRecord::new(key(1));
        record.last_seen_ts = 500;
        record.addresses.push(AddressMetric::new("persisted"));
        dir.absorb_record(&record);

        let p = dir.get(&key(1)).unwrap();
        assert_eq!(p.last_seen_ts, 900);
        assert_eq!(p.candidate_addr.as_deref(), Some("live"));
        assert_eq!(p.alias.as_deref(), Some("ada"));
    }

    #[test]
    fn alias_changes_are_reported() {
        let mut dir = PeerDirectory::new();
        assert!(dir.set_alias(key(1), Some("  bo ".into())));
        assert_eq!(dir.get(&key(1)).unwrap().alias.as_deref(), Some("bo"));
        assert!(!dir.set_alias(key(1), Some("bo".into())));
        assert!(dir.set_alias(key(1), Some("".into())));
        assert_eq!(dir.get(&key(1)).unwrap().alias, None);
    }
}
