//! Per-peer reliable sessions.
//!
//! [`SessionPool::open`] is idempotent under concurrent callers: each peer has
//! one async slot, so a second caller waits for the first dial and then reuses
//! its session instead of dialing again.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;
use waymesh_peers::PeerKey;

use crate::error::{Result, SendError};
use crate::overlay::{Overlay, Session};

type Slot = Arc<Mutex<Option<Arc<dyn Session>>>>;

pub struct SessionPool {
    overlay: Arc<dyn Overlay>,
    slots: Mutex<HashMap<PeerKey, Slot>>,
}

impl SessionPool {
    pub fn new(overlay: Arc<dyn Overlay>) -> Self {
        Self {
            overlay,
            slots: Mutex::new(HashMap::new()),
        }
    }

    async fn slot(&self, key: PeerKey) -> Slot {
        self.slots.lock().await.entry(key).or_default().clone()
    }

    /// Session to `key`: the live one if any, otherwise the first of
    /// `candidates` (in order) that dials, otherwise `relay`.
    pub async fn open(
        &self,
        key: PeerKey,
        candidates: &[String],
        relay: Option<&str>,
    ) -> Result<Arc<dyn Session>> {
        let slot = self.slot(key).await;
        let mut current = slot.lock().await;
        if let Some(session) = current.as_ref() {
            if session.is_alive() {
                return Ok(session.clone());
            }
        }
        *current = None;

        let mut last_err = None;
        for addr in candidates.iter().map(String::as_str).chain(relay) {
            match self.overlay.dial(addr).await {
                Ok(session) => {
                    debug!(peer = %key.short(), %addr, "session open");
                    *current = Some(session.clone());
                    return Ok(session);
                }
                Err(e) => {
                    debug!(peer = %key.short(), %addr, error = %e, "dial failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| SendError::Unreachable(format!("no address for {key}"))))
    }

    /// Drop the session to `key`, if any.
    pub async fn close(&self, key: &PeerKey) {
        self.slots.lock().await.remove(key);
    }

    /// Number of peers with a live session.
    pub async fn live(&self) -> usize {
        let slots: Vec<Slot> = self.slots.lock().await.values().cloned().collect();
        let mut n = 0;
        for slot in slots {
            if slot.lock().await.as_ref().is_some_and(|s| s.is_alive()) {
                n += 1;
            }
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNetwork;

    fn key(b: u8) -> PeerKey {
        PeerKey([b; 32])
    }

    #[tokio::test]
    async fn reuses_live_session() {
        let net = MemoryNetwork::new();
        let (a, _rx_a) = net.join("a");
        let (_b, _rx_b) = net.join("b");
        let pool = SessionPool::new(Arc::new(a));

        let candidates = vec!["b".to_string()];
        let s1 = pool.open(key(1), &candidates, None).await.unwrap();
        let s2 = pool.open(key(1), &candidates, None).await.unwrap();
        assert!(Arc::ptr_eq(&s1, &s2));
        assert_eq!(net.dials_to("b"), 1);
        assert_eq!(pool.live().await, 1);
    }

    #[tokio::test]
    async fn concurrent_opens_dial_once() {
        let net = MemoryNetwork::new();
        let (a, _rx_a) = net.join("a");
        let (_b, _rx_b) = net.join("b");
        let pool = Arc::new(SessionPool::new(Arc::new(a)));

        let candidates = vec!["b".to_string()];
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let candidates = candidates.clone();
                tokio::spawn(async move { pool.open(key(1), &candidates, None).await.is_ok() })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap());
        }
        assert_eq!(net.dials_to("b"), 1);
    }

    #[tokio::test]
    async fn candidates_in_order_then_relay() {
        let net = MemoryNetwork::new();
        let (a, _rx_a) = net.join("a");
        let (_relay, _rx_r) = net.join("relay");
        let pool = SessionPool::new(Arc::new(a));

        let candidates = vec!["x".to_string(), "y".to_string()];
        let session = pool.open(key(1), &candidates, Some("relay")).await.unwrap();
        assert_eq!(session.remote(), "relay");
        assert_eq!(net.dials_to("x"), 1);
        assert_eq!(net.dials_to("y"), 1);
    }

    #[tokio::test]
    async fn redials_after_session_dies() {
        let net = MemoryNetwork::new();
        let (a, _rx_a) = net.join("a");
        let (_b, _rx_b) = net.join("b");
        let pool = SessionPool::new(Arc::new(a));
        let candidates = vec!["b".to_string(), "c".to_string()];

        pool.open(key(1), &candidates, None).await.unwrap();
        net.leave("b");
        let (_c, _rx_c) = net.join("c");
        let session = pool.open(key(1), &candidates, None).await.unwrap();
        assert_eq!(session.remote(), "c");
    }

    #[tokio::test]
    async fn exhausted_candidates_fail() {
        let net = MemoryNetwork::new();
        let (a, _rx_a) = net.join("a");
        let pool = SessionPool::new(Arc::new(a));
        assert!(pool.open(key(1), &[], None).await.is_err());
        assert!(pool.open(key(1), &["x".to_string()], Some("y")).await.is_err());
    }
}
