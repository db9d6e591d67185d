//! Per-address quality metrics.
//!
//! Metrics are keyed by the concrete address string. `rtt_ms` stays `None`
//! until a heartbeat acknowledgement arrives for that address.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::address::{Address, PeerKey};

/// Quality metric for one concrete address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressMetric {
    /// The concrete overlay address.
    pub addr: String,
    /// Last heartbeat acknowledgement (unix millis, 0 = never).
    #[serde(default)]
    pub last_ack: u64,
    /// Last heartbeat probe sent (unix millis, 0 = never).
    #[serde(default)]
    pub last_probe: u64,
    /// Measured round-trip time.
    #[serde(default)]
    pub rtt_ms: Option<u64>,
    /// Last inbound message of any kind. Not persisted.
    #[serde(default, skip_serializing)]
    pub last_msg: u64,
}

impl AddressMetric {
    /// Fresh metric with nothing measured.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            last_ack: 0,
            last_probe: 0,
            rtt_ms: None,
            last_msg: 0,
        }
    }

    /// Whether an ack arrived within `window_ms` of `now`.
    pub fn acked_within(&self, now: u64, window_ms: u64) -> bool {
        self.last_ack > 0 && now.saturating_sub(self.last_ack) <= window_ms
    }

    /// Fold another observation of the same address in, keeping the freshest values.
    pub fn absorb(&mut self, other: &AddressMetric) {
        if other.last_ack > self.last_ack {
            self.last_ack = other.last_ack;
            if other.rtt_ms.is_some() {
                self.rtt_ms = other.rtt_ms;
            }
        } else if self.rtt_ms.is_none() {
            self.rtt_ms = other.rtt_ms;
        }
        self.last_probe = self.last_probe.max(other.last_probe);
        self.last_msg = self.last_msg.max(other.last_msg);
    }
}

/// Pool of metrics for every address this node has probed or heard from.
#[derive(Debug, Default)]
pub struct MetricPool {
    metrics: HashMap<String, AddressMetric>,
}

impl MetricPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Metric for `addr`, if tracked.
    pub fn get(&self, addr: &str) -> Option<&AddressMetric> {
        self.metrics.get(addr)
    }

    /// Metric for `addr`, created on first use.
    pub fn entry(&mut self, addr: &str) -> &mut AddressMetric {
        self.metrics
            .entry(addr.to_string())
            .or_insert_with(|| AddressMetric::new(addr))
    }

    /// Seed from a persisted metric, merging with anything already known.
    pub fn seed(&mut self, metric: &AddressMetric) {
        match self.metrics.get_mut(&metric.addr) {
            Some(existing) => existing.absorb(metric),
            None => {
                self.metrics.insert(metric.addr.clone(), metric.clone());
            }
        }
    }

    /// A heartbeat probe was sent to `addr`.
    pub fn record_probe(&mut self, addr: &str, now: u64) {
        self.entry(addr).last_probe = now;
    }

    /// A heartbeat ack arrived from `addr`.
    pub fn record_ack(&mut self, addr: &str, rtt_ms: u64, now: u64) {
        let m = self.entry(addr);
        m.rtt_ms = Some(rtt_ms);
        m.last_ack = now;
    }

    /// Any message arrived from `addr`.
    pub fn record_message(&mut self, addr: &str, now: u64) {
        self.entry(addr).last_msg = now;
    }

    /// Whether `addr` acked within `window_ms`.
    pub fn acked_within(&self, addr: &str, now: u64, window_ms: u64) -> bool {
        self.metrics
            .get(addr)
            .is_some_and(|m| m.acked_within(now, window_ms))
    }

    /// All tracked addresses.
    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.metrics.keys().map(String::as_str)
    }

    /// Metrics whose address embeds `key`.
    pub fn for_key(&self, key: &PeerKey) -> Vec<&AddressMetric> {
        self.metrics
            .values()
            .filter(|m| Address::parse(&m.addr).is_ok_and(|a| a.key == *key))
            .collect()
    }

    /// Drop metrics for addresses whose embedded key fails `keep`.
    /// Addresses without a key are kept. Returns how many were dropped.
    pub fn retain_keys(&mut self, keep: impl Fn(&PeerKey) -> bool) -> usize {
        let before = self.metrics.len();
        self.metrics
            .retain(|addr, _| Address::parse(addr).map_or(true, |a| keep(&a.key)));
        before - self.metrics.len()
    }

    /// Number of tracked addresses.
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtt_unknown_until_ack() {
        let mut pool = MetricPool::new();
        pool.record_probe("a", 100);
        assert_eq!(pool.get("a").unwrap().rtt_ms, None);
        pool.record_ack("a", 42, 150);
        let m = pool.get("a").unwrap();
        assert_eq!(m.rtt_ms, Some(42));
        assert_eq!(m.last_ack, 150);
        assert_eq!(m.last_probe, 100);
    }

    #[test]
    fn acked_within_window() {
        let mut pool = MetricPool::new();
        assert!(!pool.acked_within("a", 1_000, 500));
        pool.record_ack("a", 10, 1_000);
        assert!(pool.acked_within("a", 1_400, 500));
        assert!(!pool.acked_within("a", 1_600, 500));
    }

    #[test]
    fn seed_keeps_freshest_ack() {
        let mut pool = MetricPool::new();
        pool.record_ack("a", 80, 2_000);
        let mut stale = AddressMetric::new("a");
        stale.last_ack = 1_000;
        stale.rtt_ms = Some(5);
        pool.seed(&stale);
        assert_eq!(pool.get("a").unwrap().rtt_ms, Some(80));
        assert_eq!(pool.get("a").unwrap().last_ack, 2_000);
    }

    #[test]
    fn retain_keys_keeps_bare_addresses() {
        let mut pool = MetricPool::new();
        let kept = format!("pose.{}", PeerKey([1; 32]));
        let gone = format!("pose.{}", PeerKey([2; 32]));
        pool.record_probe(&kept, 1);
        pool.record_probe(&gone, 1);
        pool.record_probe("10.0.0.1:7400", 1);

        assert_eq!(pool.retain_keys(|k| *k == PeerKey([1; 32])), 1);
        assert!(pool.get(&kept).is_some());
        assert!(pool.get(&gone).is_none());
        assert!(pool.get("10.0.0.1:7400").is_some());
    }

    #[test]
    fn last_msg_is_not_persisted() {
        let mut m = AddressMetric::new("a");
        m.last_msg = 99;
        let json = serde_json::to_value(&m).unwrap();
        assert!(json.get("lastMsg").is_none());
        assert!(json.get("rttMs").is_some());
    }
}
