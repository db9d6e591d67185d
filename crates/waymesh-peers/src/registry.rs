//! The combined peer registry: persisted book, live directory and metric pool.
//!
//! Every protocol handler goes through [`Registry::touch`] or
//! [`Registry::merge_roster`], which keep the three views consistent and arm
//! the debounced book flush.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::address::{Address, PeerKey};
use crate::book::{AddressBook, BookStore};
use crate::directory::{PeerDirectory, PeerRuntime};
use crate::metric::MetricPool;
use crate::resolver;

/// One entry of a roster reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    #[serde(rename = "pub")]
    pub key: PeerKey,
    #[serde(default)]
    pub ids: Vec<String>,
    #[serde(default)]
    pub addr: Option<String>,
    #[serde(default)]
    pub last_seen: u64,
    #[serde(default)]
    pub alias: Option<String>,
}

impl RosterEntry {
    /// The advertised address, if it embeds this entry's key.
    pub fn own_addr(&self) -> Option<&str> {
        self.addr
            .as_deref()
            .filter(|a| Address::parse(a).is_ok_and(|p| p.key == self.key))
    }
}

/// Peer state owned by one node.
#[derive(Debug)]
pub struct Registry {
    self_key: PeerKey,
    book: AddressBook,
    directory: PeerDirectory,
    metrics: MetricPool,
}

impl Registry {
    /// Empty registry.
    pub fn new(self_key: PeerKey, debounce_ms: u64) -> Self {
        Self {
            self_key,
            book: AddressBook::new(self_key, debounce_ms),
            directory: PeerDirectory::new(),
            metrics: MetricPool::new(),
        }
    }

    /// Load the book from `store` and bootstrap the live views from it.
    pub fn load(store: &dyn BookStore, self_key: PeerKey, debounce_ms: u64) -> Self {
        let book = AddressBook::load(store, self_key, debounce_ms);
        let mut directory = PeerDirectory::new();
        let mut metrics = MetricPool::new();
        book.bootstrap(&mut directory, &mut metrics);
        Self {
            self_key,
            book,
            directory,
            metrics,
        }
    }

    /// Public key of the owning node.
    pub fn self_key(&self) -> PeerKey {
        self.self_key
    }

    pub fn book(&self) -> &AddressBook {
        &self.book
    }

    pub fn directory(&self) -> &PeerDirectory {
        &self.directory
    }

    pub fn metrics(&self) -> &MetricPool {
        &self.metrics
    }

    pub fn metrics_mut(&mut self) -> &mut MetricPool {
        &mut self.metrics
    }

    /// A message from `key`, optionally arriving via `addr`, stamped `ts`.
    ///
    /// Returns `false` (and changes nothing) for self.
    pub fn touch(&mut self, key: PeerKey, addr: Option<&str>, ts: u64, now: u64) -> bool {
        if key == self.self_key {
            return false;
        }
        self.directory.touch(key, addr, ts);
        if let Some(record) = self.book.upsert(key) {
            record.touch(ts);
            if let Some(addr) = addr {
                record.note_address(addr);
            }
        }
        if let Some(addr) = addr {
            self.metrics.record_message(addr, now);
        }
        self.book.persist_soon(now);
        true
    }

    /// Update a display name without touching address metrics.
    pub fn set_alias(&mut self, key: PeerKey, alias: Option<String>) -> bool {
        if key == self.self_key {
            return false;
        }
        self.directory.set_alias(key, alias)
    }

    /// Merge one roster item. Returns `false` for self.
    pub fn merge_roster(&mut self, entry: &RosterEntry, now: u64) -> bool {
        if entry.key == self.self_key {
            return false;
        }
        // A roster may only route a peer to addresses carrying its own key.
        let addr = entry.own_addr();
        self.directory.touch(entry.key, addr, entry.last_seen);
        if entry.alias.is_some() {
            self.directory.set_alias(entry.key, entry.alias.clone());
        }
        if let Some(record) = self.book.upsert(entry.key) {
            record.touch(entry.last_seen);
            record.ids.extend(entry.ids.iter().cloned());
            if let Some(addr) = addr {
                record.note_address(addr);
            }
        }
        self.book.persist_soon(now);
        true
    }

    /// Full roster as known to this node.
    pub fn roster(&self) -> Vec<RosterEntry> {
        let mut out: Vec<RosterEntry> = self
            .known_peers()
            .into_iter()
            .map(|key| {
                let runtime = self.directory.get(&key);
                let record = self.book.get(&key);
                let ids = record
                    .map(|r| r.ids.iter().cloned().collect())
                    .unwrap_or_default();
                let addr = runtime
                    .and_then(|p| p.candidate_addr.clone())
                    .or_else(|| record.and_then(|r| r.addresses.first().map(|m| m.addr.clone())));
                let last_seen = runtime
                    .map(|p| p.last_seen_ts)
                    .max(record.map(|r| r.last_seen_ts))
                    .unwrap_or(0);
                RosterEntry {
                    key,
                    ids,
                    addr,
                    last_seen,
                    alias: runtime.and_then(|p| p.alias.clone()),
                }
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Every peer in either the directory or the book.
    pub fn known_peers(&self) -> Vec<PeerKey> {
        let keys: BTreeSet<PeerKey> = self
            .directory
            .iter()
            .map(|p| p.key)
            .chain(self.book.records().map(|r| r.key))
            .filter(|k| *k != self.self_key)
            .collect();
        keys.into_iter().collect()
    }

    /// Live entry for `key`.
    pub fn peer(&self, key: &PeerKey) -> Option<&PeerRuntime> {
        self.directory.get(key)
    }

    /// Ranked candidate addresses for `key`.
    pub fn best_addresses(&self, key: &PeerKey) -> Vec<String> {
        resolver::best_addresses(key, &self.book, &self.directory, &self.metrics)
    }

    /// A peer is online when any of its addresses acked within `window_ms`.
    pub fn is_online(&self, key: &PeerKey, now: u64, window_ms: u64) -> bool {
        self.best_addresses(key)
            .iter()
            .any(|addr| self.metrics.acked_within(addr, now, window_ms))
    }

    /// All online peers.
    pub fn online_peers(&self, now: u64, window_ms: u64) -> Vec<PeerKey> {
        self.known_peers()
            .into_iter()
            .filter(|k| self.is_online(k, now, window_ms))
            .collect()
    }

    /// Every address worth probing: book addresses plus live candidates.
    pub fn probe_targets(&self) -> Vec<String> {
        let mut targets: BTreeSet<String> = self.book.all_addresses().into_iter().collect();
        for p in self.directory.iter() {
            if let Some(addr) = &p.candidate_addr {
                targets.insert(addr.clone());
            }
        }
        targets
            .into_iter()
            .filter(|a| Address::parse(a).map_or(true, |p| p.key != self.self_key))
            .collect()
    }

    /// Flush the book if its debounce deadline passed.
    pub fn flush_if_due(&mut self, now: u64, store: &dyn BookStore) -> bool {
        if !self.book.flush_if_due(now, store, &self.metrics) {
            return false;
        }
        self.prune_metrics();
        true
    }

    /// Flush the book now.
    pub fn flush(&mut self, now: u64, store: &dyn BookStore) {
        self.book.flush(now, store, &self.metrics);
        self.prune_metrics();
    }

    /// Forget metrics of addresses that belong to no known peer.
    fn prune_metrics(&mut self) {
        let self_key = self.self_key;
        let (book, directory) = (&self.book, &self.directory);
        let dropped = self.metrics.retain_keys(|key| {
            *key != self_key && (book.get(key).is_some() || directory.contains(key))
        });
        if dropped > 0 {
            debug!(dropped, "pruned address metrics");
        }
    }

    /// Whether a book flush is pending.
    pub fn is_dirty(&self) -> bool {
        self.book.is_dirty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::MemoryBookStore;

    fn key(b: u8) -> PeerKey {
        PeerKey([b; 32])
    }

    #[test]
    fn touch_ignores_self() {
        let mut reg = Registry::new(key(0), 800);
        assert!(!reg.touch(key(0), None, 1, 1));
        assert!(reg.known_peers().is_empty());
        assert!(!reg.is_dirty());
    }

    #[test]
    fn touch_updates_all_views() {
        let mut reg = Registry::new(key(0), 800);
        let addr = format!("pose.{}", key(1));
        assert!(reg.touch(key(1), Some(&addr), 100, 100));
        assert_eq!(reg.peer(&key(1)).unwrap().candidate_addr.as_deref(), Some(addr.as_str()));
        assert!(reg.book().get(&key(1)).unwrap().ids.contains("pose"));
        assert_eq!(reg.metrics().get(&addr).unwrap().last_msg, 100);
        assert!(reg.is_dirty());
    }

    #[test]
    fn roster_merge_unions_addresses() {
        let mut a = Registry::new(key(0), 800);
        a.touch(key(1), Some(&format!("pose.{}", key(1))), 10, 10);
        a.set_alias(key(1), Some("one".into()));
        let roster = a.roster();

        let mut b = Registry::new(key(2), 800);
        b.touch(key(1), Some(&format!("other.{}", key(1))), 5, 5);
        for entry in &roster {
            b.merge_roster(entry, 20);
        }
        let ranked = b.best_addresses(&key(1));
        assert!(ranked.contains(&format!("pose.{}", key(1))));
        assert!(ranked.contains(&format!("other.{}", key(1))));
        assert_eq!(b.peer(&key(1)).unwrap().alias.as_deref(), Some("one"));
    }

    #[test]
    fn roster_merge_skips_self() {
        let mut reg = Registry::new(key(0), 800);
        let entry = RosterEntry {
            key: key(0),
            ids: vec!["pose".into()],
            addr: None,
            last_seen: 1,
            alias: None,
        };
        assert!(!reg.merge_roster(&entry, 1));
        assert!(reg.known_peers().is_empty());
    }

    #[test]
    fn roster_merge_rejects_foreign_address() {
        let mut reg = Registry::new(key(0), 800);
        let foreign = format!("pose.{}", key(9));
        let entry = RosterEntry {
            key: key(1),
            ids: vec![],
            addr: Some(foreign.clone()),
            last_seen: 10,
            alias: None,
        };
        assert_eq!(entry.own_addr(), None);
        assert!(reg.merge_roster(&entry, 10));

        assert!(reg.known_peers().contains(&key(1)));
        assert!(reg.best_addresses(&key(1)).is_empty());
        assert_eq!(reg.peer(&key(1)).unwrap().candidate_addr, None);
        assert!(!reg.probe_targets().contains(&foreign));
    }

    #[test]
    fn flush_prunes_metrics_of_unknown_peers() {
        let store = MemoryBookStore::new();
        let mut reg = Registry::new(key(0), 800);
        let known = format!("pose.{}", key(1));
        let stray = format!("pose.{}", key(5));
        let own = format!("pose.{}", key(0));
        reg.touch(key(1), Some(&known), 10, 10);
        reg.metrics_mut().record_probe(&stray, 10);
        reg.metrics_mut().record_probe(&own, 10);
        reg.metrics_mut().record_probe("bootstrap.example:7400", 10);

        reg.flush(20, &store);
        assert!(reg.metrics().get(&known).is_some());
        assert!(reg.metrics().get(&stray).is_none());
        assert!(reg.metrics().get(&own).is_none());
        assert!(reg.metrics().get("bootstrap.example:7400").is_some());
    }

    #[test]
    fn online_requires_recent_ack() {
        let mut reg = Registry::new(key(0), 800);
        let addr = format!("pose.{}", key(1));
        reg.touch(key(1), Some(&addr), 0, 0);
        assert!(!reg.is_online(&key(1), 1_000, 15_000));
        reg.metrics_mut().record_ack(&addr, 12, 1_000);
        assert!(reg.is_online(&key(1), 10_000, 15_000));
        assert!(!reg.is_online(&key(1), 20_000, 15_000));
        assert_eq!(reg.online_peers(10_000, 15_000), vec![key(1)]);
    }

    #[test]
    fn load_bootstraps_from_store() {
        let store = MemoryBookStore::new();
        let mut reg = Registry::new(key(0), 800);
        reg.touch(key(7), Some(&format!("pose.{}", key(7))), 50, 50);
        reg.flush(60, &store);

        let reloaded = Registry::load(&store, key(0), 800);
        assert_eq!(reloaded.known_peers(), vec![key(7)]);
        assert_eq!(reloaded.peer(&key(7)).unwrap().last_seen_ts, 50);
        assert_eq!(reloaded.probe_targets(), vec![format!("pose.{}", key(7))]);
    }
}
