//! In-memory overlay.
//!
//! A shared [`MemoryNetwork`] routes payloads between [`MemoryOverlay`]
//! endpoints by exact address string. Faults can be injected per address:
//! a number of "not ready" rejections, or permanent unreachability. Every
//! send and dial attempt is counted so tests can observe probing behaviour.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{Result, SendError};
use crate::overlay::{Inbound, Overlay, Session};

const INBOUND_QUEUE: usize = 1024;

#[derive(Debug, Default)]
struct NetState {
    endpoints: HashMap<String, mpsc::Sender<Inbound>>,
    not_ready: HashMap<String, u32>,
    unreachable: HashSet<String>,
    sends: HashMap<String, usize>,
    dials: HashMap<String, usize>,
}

impl NetState {
    fn check_faults(&mut self, to: &str) -> Result<()> {
        if self.unreachable.contains(to) {
            return Err(SendError::Unreachable(to.to_string()));
        }
        if let Some(remaining) = self.not_ready.get_mut(to) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SendError::NotReady(to.to_string()));
            }
        }
        Ok(())
    }

    fn deliver(&self, from: &str, to: &str, payload: &[u8]) -> Result<()> {
        let tx = self
            .endpoints
            .get(to)
            .ok_or_else(|| SendError::Unreachable(to.to_string()))?;
        let inbound = Inbound {
            src: from.to_string(),
            payload: Bytes::copy_from_slice(payload),
        };
        tx.try_send(inbound).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::NotReady(to.to_string()),
            mpsc::error::TrySendError::Closed(_) => SendError::Unreachable(to.to_string()),
        })
    }
}

/// Shared broker connecting [`MemoryOverlay`]s.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, NetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an endpoint at `address`.
    pub fn join(&self, address: impl Into<String>) -> (MemoryOverlay, mpsc::Receiver<Inbound>) {
        let address = address.into();
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        self.state().endpoints.insert(address.clone(), tx);
        (
            MemoryOverlay {
                network: self.clone(),
                address,
            },
            rx,
        )
    }

    /// Remove the endpoint at `address`.
    pub fn leave(&self, address: &str) {
        self.state().endpoints.remove(address);
    }

    /// Reject the next `count` sends and dials to `address` as not ready.
    pub fn set_not_ready(&self, address: &str, count: u32) {
        self.state().not_ready.insert(address.to_string(), count);
    }

    pub fn set_unreachable(&self, address: &str, unreachable: bool) {
        let mut state = self.state();
        if unreachable {
            state.unreachable.insert(address.to_string());
        } else {
            state.unreachable.remove(address);
        }
    }

    /// Datagram send attempts to `address`, successful or not.
    pub fn sends_to(&self, address: &str) -> usize {
        self.state().sends.get(address).copied().unwrap_or(0)
    }

    /// Dial attempts to `address`, successful or not.
    pub fn dials_to(&self, address: &str) -> usize {
        self.state().dials.get(address).copied().unwrap_or(0)
    }

    /// Forget all recorded attempts.
    pub fn reset_counters(&self) {
        let mut state = self.state();
        state.sends.clear();
        state.dials.clear();
    }
}

/// One endpoint on a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemoryOverlay {
    network: MemoryNetwork,
    address: String,
}

#[async_trait]
impl Overlay for MemoryOverlay {
    fn local_address(&self) -> String {
        self.address.clone()
    }

    async fn send(&self, to: &str, payload: &[u8]) -> Result<()> {
        let mut state = self.network.state();
        *state.sends.entry(to.to_string()).or_default() += 1;
        state.check_faults(to)?;
        state.deliver(&self.address, to, payload)?;
        trace!(from = %self.address, %to, bytes = payload.len(), "memory datagram");
        Ok(())
    }

    async fn dial(&self, to: &str) -> Result<Arc<dyn Session>> {
        let mut state = self.network.state();
        *state.dials.entry(to.to_string()).or_default() += 1;
        state.check_faults(to)?;
        if !state.endpoints.contains_key(to) {
            return Err(SendError::Unreachable(to.to_string()));
        }
        Ok(Arc::new(MemorySession {
            network: self.network.clone(),
            local: self.address.clone(),
            remote: to.to_string(),
            alive: AtomicBool::new(true),
        }))
    }
}

#[derive(Debug)]
struct MemorySession {
    network: MemoryNetwork,
    local: String,
    remote: String,
    alive: AtomicBool,
}

#[async_trait]
impl Session for MemorySession {
    fn remote(&self) -> &str {
        &self.remote
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed) && self.network.state().endpoints.contains_key(&self.remote)
    }

    async fn send(&self, payload: &[u8]) -> Result<()> {
        if !self.is_alive() {
            self.alive.store(false, Ordering::Relaxed);
            return Err(SendError::Closed);
        }
        self.network.state().deliver(&self.local, &self.remote, payload)
    }
}
