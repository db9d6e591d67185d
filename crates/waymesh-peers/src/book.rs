//! Persisted, versioned ledger of every peer ever seen.
//!
//! The book is written as one JSON document:
//!
//! ```text
//! { version, updatedAt, peers: [{ pub, lastSeenTs, ids[], addresses[{addr, lastAck, lastProbe, rttMs}] }] }
//! ```
//!
//! Writes are coalesced by a [`FlushGate`]: the first mutation arms a single
//! deadline and every mutation before that deadline rides along in the same
//! flush. Persistence is best effort. A store or serialization failure is
//! logged and dropped, and an unreadable or mismatched-version document loads
//! as an empty book.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::address::{Address, PeerKey};
use crate::directory::PeerDirectory;
use crate::error::{Error, Result};
use crate::metric::{AddressMetric, MetricPool};

/// Current on-disk schema version.
pub const BOOK_VERSION: u32 = 1;

/// Default debounce window for book writes.
pub const DEFAULT_DEBOUNCE_MS: u64 = 800;

/// One persisted peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    /// The peer's public key.
    #[serde(rename = "pub")]
    pub key: PeerKey,
    /// Last time the peer was heard from (unix millis).
    #[serde(default)]
    pub last_seen_ts: u64,
    /// Sub-client identifiers the peer has been seen with.
    #[serde(default)]
    pub ids: BTreeSet<String>,
    /// Known concrete addresses and their metrics.
    #[serde(default)]
    pub addresses: Vec<AddressMetric>,
}

impl PeerRecord {
    /// Empty record for `key`.
    pub fn new(key: PeerKey) -> Self {
        Self {
            key,
            last_seen_ts: 0,
            ids: BTreeSet::new(),
            addresses: Vec::new(),
        }
    }

    /// Remember a concrete address (and its identifier) for this peer.
    pub fn note_address(&mut self, addr: &str) {
        if let Ok(parsed) = Address::parse(addr) {
            if parsed.key != self.key {
                return;
            }
            if let Some(id) = parsed.identifier {
                self.ids.insert(id);
            }
        }
        if !self.addresses.iter().any(|m| m.addr == addr) {
            self.addresses.push(AddressMetric::new(addr));
        }
    }

    /// Advance `last_seen_ts`; never moves backwards.
    pub fn touch(&mut self, ts: u64) {
        self.last_seen_ts = self.last_seen_ts.max(ts);
    }
}

/// The serialized form of the whole book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookSnapshot {
    pub version: u32,
    pub updated_at: u64,
    pub peers: Vec<PeerRecord>,
}

/// Backing store for the serialized book.
pub trait BookStore: Send + Sync {
    /// Read the last saved document, if any.
    fn load_book(&self) -> Result<Option<Vec<u8>>>;

    /// Replace the saved document.
    fn save_book(&self, bytes: &[u8]) -> Result<()>;
}

/// In-memory store, used by tests and ephemeral nodes.
#[derive(Debug, Default)]
pub struct MemoryBookStore {
    data: Mutex<Option<Vec<u8>>>,
    writes: Mutex<usize>,
}

impl MemoryBookStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful saves.
    pub fn write_count(&self) -> usize {
        self.writes.lock().map(|w| *w).unwrap_or(0)
    }

    /// Raw saved bytes.
    pub fn raw(&self) -> Option<Vec<u8>> {
        self.data.lock().ok().and_then(|d| d.clone())
    }
}

impl BookStore for MemoryBookStore {
    fn load_book(&self) -> Result<Option<Vec<u8>>> {
        let data = self.data.lock().map_err(|e| Error::Store(e.to_string()))?;
        Ok(data.clone())
    }

    fn save_book(&self, bytes: &[u8]) -> Result<()> {
        *self.data.lock().map_err(|e| Error::Store(e.to_string()))? = Some(bytes.to_vec());
        if let Ok(mut w) = self.writes.lock() {
            *w += 1;
        }
        Ok(())
    }
}

/// Dirty flag with a single debounce deadline.
#[derive(Debug, Clone)]
pub struct FlushGate {
    debounce_ms: u64,
    deadline: Option<u64>,
}

impl FlushGate {
    /// Gate with the given debounce window.
    pub fn new(debounce_ms: u64) -> Self {
        Self {
            debounce_ms,
            deadline: None,
        }
    }

    /// Mark dirty. Returns `true` if this armed a new deadline.
    pub fn mark_dirty(&mut self, now: u64) -> bool {
        if self.deadline.is_some() {
            return false;
        }
        self.deadline = Some(now + self.debounce_ms);
        true
    }

    /// Whether a flush is pending.
    pub fn is_dirty(&self) -> bool {
        self.deadline.is_some()
    }

    /// Whether the pending flush is due.
    pub fn is_due(&self, now: u64) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }

    /// Clear the pending flush.
    pub fn clear(&mut self) {
        self.deadline = None;
    }
}

impl Default for FlushGate {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE_MS)
    }
}

/// The persisted address book.
#[derive(Debug)]
pub struct AddressBook {
    self_key: PeerKey,
    records: HashMap<PeerKey, PeerRecord>,
    gate: FlushGate,
}

impl AddressBook {
    /// Empty book for the node identified by `self_key`.
    pub fn new(self_key: PeerKey, debounce_ms: u64) -> Self {
        Self {
            self_key,
            records: HashMap::new(),
            gate: FlushGate::new(debounce_ms),
        }
    }

    /// Load from `store`. Any failure resets to an empty book.
    pub fn load(store: &dyn BookStore, self_key: PeerKey, debounce_ms: u64) -> Self {
        let mut book = Self::new(self_key, debounce_ms);
        let bytes = match store.load_book() {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return book,
            Err(e) => {
                warn!(error = %e, "address book unreadable, starting empty");
                return book;
            }
        };
        match Self::decode(&bytes) {
            Some(peers) => {
                for record in peers {
                    if record.key != self_key {
                        book.records.insert(record.key, record);
                    }
                }
                debug!(peers = book.records.len(), "address book loaded");
            }
            None => warn!("address book version mismatch or corrupt, starting empty"),
        }
        book
    }

    /// Decode a document; `None` on version mismatch or malformed data.
    pub fn decode(bytes: &[u8]) -> Option<Vec<PeerRecord>> {
        let snapshot: BookSnapshot = serde_json::from_slice(bytes).ok()?;
        (snapshot.version == BOOK_VERSION).then_some(snapshot.peers)
    }

    /// Seed the live directory and metric pool from persisted records.
    pub fn bootstrap(&self, directory: &mut PeerDirectory, metrics: &mut MetricPool) {
        for record in self.records.values() {
            directory.absorb_record(record);
            for metric in &record.addresses {
                metrics.seed(metric);
            }
        }
    }

    /// Record for `key`, if known.
    pub fn get(&self, key: &PeerKey) -> Option<&PeerRecord> {
        self.records.get(key)
    }

    /// Record for `key`, created on first contact. `None` for self.
    pub fn upsert(&mut self, key: PeerKey) -> Option<&mut PeerRecord> {
        if key == self.self_key {
            return None;
        }
        Some(self.records.entry(key).or_insert_with(|| PeerRecord::new(key)))
    }

    /// All records.
    pub fn records(&self) -> impl Iterator<Item = &PeerRecord> {
        self.records.values()
    }

    /// Every concrete address any record lists, plus synthesized ones.
    pub fn all_addresses(&self) -> Vec<String> {
        let mut out = BTreeSet::new();
        for record in self.records.values() {
            for id in &record.ids {
                out.insert(Address::new(id.clone(), record.key).to_string());
            }
            for m in &record.addresses {
                out.insert(m.addr.clone());
            }
        }
        out.into_iter().collect()
    }

    /// Number of peers.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the book is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Schedule a coalesced flush.
    pub fn persist_soon(&mut self, now: u64) {
        self.gate.mark_dirty(now);
    }

    /// Whether a flush is pending.
    pub fn is_dirty(&self) -> bool {
        self.gate.is_dirty()
    }

    /// Build the serializable snapshot, refreshing address metrics from the pool.
    pub fn snapshot(&self, now: u64, metrics: &MetricPool) -> BookSnapshot {
        let mut by_key: HashMap<PeerKey, Vec<&AddressMetric>> = HashMap::new();
        for addr in metrics.addresses() {
            if let (Ok(parsed), Some(m)) = (Address::parse(addr), metrics.get(addr)) {
                by_key.entry(parsed.key).or_default().push(m);
            }
        }

        let mut peers: Vec<PeerRecord> = self
            .records
            .values()
            .map(|record| {
                let mut record = record.clone();
                for m in by_key.get(&record.key).into_iter().flatten() {
                    match record.addresses.iter_mut().find(|a| a.addr == m.addr) {
                        Some(existing) => existing.absorb(m),
                        None => record.addresses.push((*m).clone()),
                    }
                }
                record.addresses.sort_by(|a, b| a.addr.cmp(&b.addr));
                record
            })
            .collect();
        peers.sort_by(|a, b| a.key.cmp(&b.key));

        BookSnapshot {
            version: BOOK_VERSION,
            updated_at: now,
            peers,
        }
    }

    /// Flush if the debounce deadline passed. Returns whether a write was attempted.
    pub fn flush_if_due(&mut self, now: u64, store: &dyn BookStore, metrics: &MetricPool) -> bool {
        if !self.gate.is_due(now) {
            return false;
        }
        self.flush(now, store, metrics);
        true
    }

    /// Write immediately and clear the pending flag. Errors are logged and ignored.
    pub fn flush(&mut self, now: u64, store: &dyn BookStore, metrics: &MetricPool) {
        self.gate.clear();
        let snapshot = self.snapshot(now, metrics);
        let bytes = match serde_json::to_vec(&snapshot) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "address book serialization failed");
                return;
            }
        };
        match store.save_book(&bytes) {
            Ok(()) => debug!(peers = snapshot.peers.len(), "address book flushed"),
            Err(e) => warn!(error = %e, "address book write failed"),
        }
    }
}
