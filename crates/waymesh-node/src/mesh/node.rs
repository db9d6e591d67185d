//! Async driver: owns the state lock, the overlay and the collaborators.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};
use waymesh_peers::{BookStore, NodeIdentity, PeerKey, Registry};
use waymesh_protocols::{
    resolve_height, Direction, GateDecision, PoseExtras, PoseSnapshot, TicketStatus,
};
use waymesh_transfer::{send_with_retry, Inbound, Overlay, SendError, SessionPool};

use super::state::{Effects, MeshState, Outbound, RemotePose};
use super::MeshConfig;
use crate::clock::{Clock, SystemClock};
use crate::collaborators::{Host, MemoryHost, Rendezvous, RendezvousEvent, Terrain};
use crate::error::{Error, Result};
use crate::events::{NodeEvent, PeerView, StatusReport};
use crate::terrain::GroundResolver;

/// Event fan-out capacity; slow subscribers lag and skip.
const EVENT_CAPACITY: usize = 1024;

/// Delivery counters.
#[derive(Debug, Default)]
pub struct MeshStats {
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl MeshStats {
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn record(&self, ok: bool) {
        let counter = if ok { &self.sent } else { &self.dropped };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// A running mesh participant.
pub struct MeshNode {
    key: PeerKey,
    address: String,
    config: MeshConfig,
    /// Mesh state. Never held across a send.
    state: Arc<RwLock<MeshState>>,
    overlay: Arc<dyn Overlay>,
    sessions: SessionPool,
    store: Arc<dyn BookStore>,
    rendezvous: Option<Arc<dyn Rendezvous>>,
    host: Arc<dyn Host>,
    ground: GroundResolver,
    clock: Arc<dyn Clock>,
    events_tx: broadcast::Sender<NodeEvent>,
    stats: MeshStats,
}

impl MeshNode {
    /// Create a node bound to `overlay`, loading the address book from `store`.
    pub fn new(
        identity: NodeIdentity,
        config: MeshConfig,
        overlay: Arc<dyn Overlay>,
        store: Arc<dyn BookStore>,
    ) -> Self {
        let key = identity.key();
        let address = overlay.local_address();
        let registry = Registry::load(store.as_ref(), key, config.debounce_ms);
        info!("Node key: {}", key);
        info!("Loaded {} peers from address book", registry.book().len());

        let state = MeshState::new(identity, address.clone(), config.clone(), registry);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            key,
            address,
            sessions: SessionPool::new(overlay.clone()),
            ground: GroundResolver::new(None, Duration::from_millis(config.terrain_timeout_ms)),
            config,
            state: Arc::new(RwLock::new(state)),
            overlay,
            store,
            rendezvous: None,
            host: Arc::new(MemoryHost::new()),
            clock: Arc::new(SystemClock),
            events_tx,
            stats: MeshStats::default(),
        }
    }

    pub fn with_rendezvous(mut self, rendezvous: Arc<dyn Rendezvous>) -> Self {
        self.rendezvous = Some(rendezvous);
        self
    }

    pub fn with_host(mut self, host: Arc<dyn Host>) -> Self {
        self.host = host;
        self
    }

    pub fn with_terrain(mut self, terrain: Arc<dyn Terrain>) -> Self {
        self.ground = GroundResolver::new(
            Some(terrain),
            Duration::from_millis(self.config.terrain_timeout_ms),
        );
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn key(&self) -> PeerKey {
        self.key
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn stats(&self) -> &MeshStats {
        &self.stats
    }

    /// Shared handle to the mesh state.
    pub fn mesh_state(&self) -> Arc<RwLock<MeshState>> {
        Arc::clone(&self.state)
    }

    /// Subscribe to node events.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events_tx.subscribe()
    }

    fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    fn emit(&self, event: NodeEvent) {
        // No subscribers is fine.
        let _ = self.events_tx.send(event);
    }

    // --- Inputs ---

    /// Handle one inbound message and wait for everything it triggers.
    pub async fn handle_inbound(&self, inbound: Inbound) {
        let fx = self.inbound_effects(inbound).await;
        self.execute(fx).await;
    }

    pub async fn handle_rendezvous(&self, event: RendezvousEvent) {
        let fx = self.rendezvous_effects(event).await;
        self.execute(fx).await;
    }

    async fn inbound_effects(&self, inbound: Inbound) -> Effects {
        let now = self.now();
        self.state
            .write()
            .await
            .handle_payload(&inbound.src, &inbound.payload, now)
    }

    async fn rendezvous_effects(&self, event: RendezvousEvent) -> Effects {
        let now = self.now();
        self.state.write().await.on_rendezvous(event, now)
    }

    /// Gate a local pose tick and fan it out to online peers.
    #[allow(clippy::too_many_arguments)]
    pub async fn send_pose_if_changed(
        &self,
        position: [f64; 3],
        orientation: [f64; 4],
        ground_override: Option<f64>,
        jump_event: bool,
        crouch: bool,
        extras: PoseExtras,
    ) -> GateDecision {
        let now = self.now();
        let snapshot = PoseSnapshot::from_tick(
            position,
            orientation,
            ground_override,
            jump_event,
            crouch,
            extras,
            now,
        );
        let (decision, fx) = self.state.write().await.local_pose(snapshot, now);
        self.execute(fx).await;
        decision
    }

    /// Ask `key` for a teleport. Returns the ticket status after sending.
    pub async fn request_teleport(&self, key: PeerKey) -> Result<TicketStatus> {
        let now = self.now();
        let send = self.state.write().await.request_teleport(key, now)?;
        match self.deliver(send).await {
            Ok(()) => {
                self.stats.record(true);
                Ok(TicketStatus::Pending)
            }
            Err(e) => {
                self.stats.record(false);
                warn!("Teleport request to {} failed: {}", key.short(), e);
                let fx = self
                    .state
                    .write()
                    .await
                    .teleport_send_failed(key, &e.to_string(), self.now());
                self.execute(fx).await;
                Ok(TicketStatus::Error)
            }
        }
    }

    /// Answer a pending request from `key`. On accept the host is asked for
    /// a destination; without one the answer is `unavailable`.
    pub async fn respond_teleport(&self, key: PeerKey, accept: bool) -> Result<TicketStatus> {
        let offer = if accept {
            self.host.destination_offer()
        } else {
            None
        };
        let now = self.now();
        let (send, fx) = {
            let mut state = self.state.write().await;
            state.respond_teleport(key, accept, offer, now)?
        };
        let status = fx
            .events
            .iter()
            .find_map(|e| match e {
                NodeEvent::TeleportResolved {
                    direction: Direction::Inbound,
                    status,
                    ..
                } => Some(*status),
                _ => None,
            })
            .unwrap_or(TicketStatus::Error);
        self.execute(fx).await;
        let delivered = self.deliver(send).await;
        if let Err(e) = &delivered {
            warn!("Teleport answer to {} failed: {}", key.short(), e);
        }
        self.stats.record(delivered.is_ok());
        Ok(status)
    }

    /// Set our display name and announce it.
    pub async fn set_alias(&self, alias: Option<String>) {
        let now = self.now();
        let fx = self.state.write().await.set_alias(alias, now);
        self.execute(fx).await;
    }

    // --- Reads ---

    pub async fn peers(&self) -> Vec<PeerView> {
        let now = self.now();
        let (views, fx) = self.state.write().await.peer_views(now);
        self.execute(fx).await;
        views
    }

    pub async fn status(&self) -> StatusReport {
        let now = self.now();
        let state = self.state.read().await;
        let (level, detail) = state.status();
        StatusReport {
            public_key: self.key,
            address: self.address.clone(),
            relay_healthy: state.relay_healthy(now),
            status: level,
            detail: detail.to_string(),
            sent: self.stats.sent(),
            dropped: self.stats.dropped(),
            peers: state.registry().known_peers().len(),
            online: state
                .registry()
                .online_peers(now, self.config.online_window_ms)
                .len(),
        }
    }

    // --- Timers ---

    pub async fn heartbeat(&self) {
        let now = self.now();
        let fx = self.state.write().await.heartbeat_tick(now);
        self.execute(fx).await;
    }

    pub async fn sweep(&self) {
        let now = self.now();
        let fx = self.state.write().await.sweep_tick(now);
        self.execute(fx).await;
    }

    pub async fn refresh_roster(&self) {
        let now = self.now();
        let fx = self.state.write().await.roster_tick(now);
        self.execute(fx).await;
    }

    pub async fn flush_if_due(&self) -> bool {
        let now = self.now();
        self.state
            .write()
            .await
            .flush_if_due(now, self.store.as_ref())
    }

    /// Final book flush.
    pub async fn shutdown(&self) {
        let now = self.now();
        self.state.write().await.flush(now, self.store.as_ref());
        info!("Mesh node {} stopped", self.key.short());
    }

    /// Run until the inbound channel closes.
    pub async fn run(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<Inbound>,
        mut rendezvous_events: Option<mpsc::Receiver<RendezvousEvent>>,
    ) {
        info!("Starting mesh node {} at {}", self.key.short(), self.address);
        if let Some(rendezvous) = &self.rendezvous {
            let meta = self.state.read().await.rendezvous_meta(self.now());
            if let Err(e) = rendezvous.presence(&meta).await {
                warn!("Rendezvous presence failed: {}", e);
            }
        }

        let cfg = &self.config;
        let tickers = [
            self.spawn_ticker(cfg.heartbeat_interval_ms, |n| async move { n.heartbeat().await }),
            self.spawn_ticker(cfg.sweep_interval_ms, |n| async move { n.sweep().await }),
            self.spawn_ticker(cfg.roster_refresh_ms, |n| async move { n.refresh_roster().await }),
            self.spawn_ticker(cfg.flush_tick_ms, |n| async move {
                n.flush_if_due().await;
            }),
        ];

        let mut rendezvous_open = rendezvous_events.is_some();
        loop {
            // State changes stay in arrival order; the I/O they trigger does not
            // hold up the next message.
            tokio::select! {
                msg = inbound.recv() => match msg {
                    Some(msg) => {
                        let fx = self.inbound_effects(msg).await;
                        self.spawn_execute(fx);
                    }
                    None => break,
                },
                event = next_event(&mut rendezvous_events), if rendezvous_open => match event {
                    Some(event) => {
                        let fx = self.rendezvous_effects(event).await;
                        self.spawn_execute(fx);
                    }
                    None => rendezvous_open = false,
                },
            }
        }

        for ticker in tickers {
            ticker.abort();
        }
        self.shutdown().await;
    }

    fn spawn_ticker<F, Fut>(self: &Arc<Self>, period_ms: u64, tick: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(period_ms.max(1)));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                tick(Arc::clone(&node)).await;
            }
        })
    }

    // --- Effects ---

    /// Publish events now, run sends and terrain placement on their own task.
    fn spawn_execute(self: &Arc<Self>, mut fx: Effects) {
        for event in std::mem::take(&mut fx.events) {
            self.emit(event);
        }
        if fx.is_empty() {
            return;
        }
        let node = Arc::clone(self);
        tokio::spawn(async move { node.execute(fx).await });
    }

    async fn execute(&self, fx: Effects) {
        let Effects {
            outbound,
            events,
            poses,
            apply,
            handshakes,
            handshake_acks,
            handshake_all,
            presence,
        } = fx;

        for event in events {
            self.emit(event);
        }

        if let Some((key, dest)) = apply {
            let applied = self.host.apply_destination(&dest);
            if !applied {
                warn!("Host could not apply teleport destination from {}", key.short());
            }
            let fx = self.state.write().await.finish_apply(key, applied, self.now());
            for event in fx.events {
                self.emit(event);
            }
        }

        if let Some(rendezvous) = &self.rendezvous {
            if !handshakes.is_empty() || !handshake_acks.is_empty() || handshake_all || presence {
                let meta = self.state.read().await.rendezvous_meta(self.now());
                for key in handshakes {
                    if let Err(e) = rendezvous.handshake(key, &meta, true).await {
                        debug!("Rendezvous handshake to {} failed: {}", key.short(), e);
                    }
                }
                for key in handshake_acks {
                    if let Err(e) = rendezvous.handshake(key, &meta, false).await {
                        debug!("Rendezvous handshake ack to {} failed: {}", key.short(), e);
                    }
                }
                if handshake_all {
                    if let Err(e) = rendezvous.handshake_all(&meta, true).await {
                        warn!("Rendezvous re-handshake failed: {}", e);
                    }
                }
                if presence {
                    if let Err(e) = rendezvous.presence(&meta).await {
                        debug!("Rendezvous presence failed: {}", e);
                    }
                }
            }
        }

        let results = join_all(outbound.into_iter().map(|out| async move {
            let kind = out.message().kind();
            let result = self.deliver(out).await;
            if let Err(e) = &result {
                debug!("Dropped {} send: {}", kind, e);
            }
            result.is_ok()
        }))
        .await;
        for ok in results {
            self.stats.record(ok);
        }

        for pose in poses {
            self.surface_pose(pose).await;
        }
    }

    /// Place a remote pose on local terrain and publish it.
    async fn surface_pose(&self, remote: RemotePose) {
        let RemotePose { key, ts, pose, geo } = remote;
        let mut position = pose.p;
        if let Some(geo) = &geo {
            let local_ground = self.ground.ground_at(geo.lat, geo.lon).await;
            position[1] = resolve_height(position[1], Some(geo), local_ground);
        }
        self.emit(NodeEvent::RemotePose {
            key,
            ts,
            position,
            orientation: pose.q,
            crouch: pose.c,
            jump: pose.j,
            xr: pose.xr,
            geo,
        });
    }

    async fn deliver(&self, out: Outbound) -> Result<()> {
        match out {
            Outbound::Direct { to, msg } => {
                let payload = msg.encode()?;
                self.send_datagram(&to, &payload).await?;
                Ok(())
            }
            Outbound::Peer {
                key,
                candidates,
                msg,
                relay_fallback,
            } => {
                let payload = msg.encode()?;
                let mut last_err = None;
                for addr in &candidates {
                    match self.send_datagram(addr, &payload).await {
                        Ok(()) => return Ok(()),
                        Err(e) => last_err = Some(e),
                    }
                }
                let relay = self
                    .config
                    .relay
                    .as_ref()
                    .filter(|r| relay_fallback && !candidates.contains(r));
                if let Some(relay) = relay {
                    trace!("Relaying {} to {}", msg.kind(), key.short());
                    let wrapped = msg.relayed(self.key, key).encode()?;
                    self.send_datagram(relay, &wrapped).await?;
                    return Ok(());
                }
                Err(last_err
                    .unwrap_or_else(|| SendError::Unreachable(format!("no route to {key}")))
                    .into())
            }
            Outbound::Session {
                key,
                candidates,
                msg,
            } => {
                let session = self
                    .sessions
                    .open(key, &candidates, self.config.relay.as_deref())
                    .await?;
                let via_relay = !candidates.iter().any(|c| c == session.remote());
                let msg = if via_relay {
                    msg.relayed(self.key, key)
                } else {
                    msg
                };
                let payload = msg.encode()?;
                if let Err(e) = session.send(&payload).await {
                    self.sessions.close(&key).await;
                    return Err(Error::from(e));
                }
                Ok(())
            }
        }
    }

    async fn send_datagram(&self, to: &str, payload: &[u8]) -> std::result::Result<(), SendError> {
        send_with_retry(self.overlay.as_ref(), to, payload, &self.config.retry).await
    }
}

async fn next_event<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
