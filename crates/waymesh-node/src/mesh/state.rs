//! Mesh state and message dispatch.

use std::collections::{HashMap, HashSet};

use tracing::{debug, trace};
use waymesh_peers::{Address, NodeIdentity, PeerKey, Registry};
use waymesh_protocols::{
    Destination, GeoRef, Message, PoseGate, PoseSnapshot, PoseWire, TeleportCoordinator,
};

use super::MeshConfig;
use crate::collaborators::ConnectionState;
use crate::events::{NodeEvent, StatusLevel};

/// Who a message is attributed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sender {
    pub key: PeerKey,
    /// Address the message arrived from. `None` when it came through the
    /// relay, whose address says nothing about the original sender.
    pub addr: Option<String>,
}

/// A send the node should perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// One datagram to a concrete address.
    Direct { to: String, msg: Message },
    /// One datagram to a peer: the first candidate that takes it, then the
    /// relay if `relay_fallback` is set.
    Peer {
        key: PeerKey,
        candidates: Vec<String>,
        msg: Message,
        relay_fallback: bool,
    },
    /// Over the peer's reliable session.
    Session {
        key: PeerKey,
        candidates: Vec<String>,
        msg: Message,
    },
}

impl Outbound {
    pub fn message(&self) -> &Message {
        match self {
            Outbound::Direct { msg, .. }
            | Outbound::Peer { msg, .. }
            | Outbound::Session { msg, .. } => msg,
        }
    }
}

/// A received pose whose height still has to be placed on local terrain.
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePose {
    pub key: PeerKey,
    pub ts: u64,
    pub pose: PoseWire,
    pub geo: Option<GeoRef>,
}

/// Everything a state transition asks the node to do.
#[derive(Debug, Default)]
pub struct Effects {
    pub outbound: Vec<Outbound>,
    pub events: Vec<NodeEvent>,
    pub poses: Vec<RemotePose>,
    /// An accepted teleport destination to apply.
    pub apply: Option<(PeerKey, Destination)>,
    /// Rendezvous handshakes to request, expecting an ack.
    pub handshakes: Vec<PeerKey>,
    /// Rendezvous handshakes to acknowledge.
    pub handshake_acks: Vec<PeerKey>,
    /// Re-handshake the whole room.
    pub handshake_all: bool,
    /// Re-announce presence to the rendezvous room.
    pub presence: bool,
}

impl Effects {
    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty()
            && self.events.is_empty()
            && self.poses.is_empty()
            && self.apply.is_none()
            && self.handshakes.is_empty()
            && self.handshake_acks.is_empty()
            && !self.handshake_all
            && !self.presence
    }

    pub fn extend(&mut self, other: Effects) {
        self.outbound.extend(other.outbound);
        self.events.extend(other.events);
        self.poses.extend(other.poses);
        if other.apply.is_some() {
            self.apply = other.apply;
        }
        self.handshakes.extend(other.handshakes);
        self.handshake_acks.extend(other.handshake_acks);
        self.handshake_all |= other.handshake_all;
        self.presence |= other.presence;
    }

    /// Messages of one type, in order.
    pub fn sent(&self, kind: &str) -> Vec<&Outbound> {
        self.outbound
            .iter()
            .filter(|o| o.message().kind() == kind)
            .collect()
    }
}

/// What we last heard from a peer's pose stream.
#[derive(Debug, Clone, Default)]
pub(super) struct RemoteState {
    pub last_pose_ts: Option<u64>,
    pub geo: Option<GeoRef>,
}

/// All mesh state of one node.
pub struct MeshState {
    pub(super) identity: NodeIdentity,
    pub(super) local_address: String,
    pub(super) config: MeshConfig,
    pub(super) registry: Registry,
    pub(super) teleport: TeleportCoordinator,
    pub(super) gate: PoseGate,
    pub(super) alias: Option<String>,
    /// Last pose that passed the gate, replayed to peers as they appear.
    pub(super) last_pose: Option<PoseSnapshot>,
    /// Peers that said hello during this process lifetime.
    pub(super) joined: HashSet<PeerKey>,
    pub(super) rendezvous_seen: HashSet<PeerKey>,
    pub(super) remote: HashMap<PeerKey, RemoteState>,
    pub(super) relay_key: Option<PeerKey>,
    pub(super) relay_last_ack: Option<u64>,
    /// Last reported relay health, for transition logging.
    pub(super) healthy: Option<bool>,
    pub(super) connection: Option<ConnectionState>,
    /// Set when the rendezvous link drops, cleared by the next connect.
    pub(super) rendezvous_lost: bool,
    pub(super) status: (StatusLevel, String),
}

impl MeshState {
    pub fn new(
        identity: NodeIdentity,
        local_address: impl Into<String>,
        config: MeshConfig,
        registry: Registry,
    ) -> Self {
        let key = identity.key();
        let relay_key = config
            .relay
            .as_deref()
            .and_then(|r| Address::parse(r).ok())
            .map(|a| a.key);
        Self {
            teleport: TeleportCoordinator::new(key, config.teleport),
            gate: PoseGate::new(config.pose_gate),
            alias: config.alias.clone(),
            identity,
            local_address: local_address.into(),
            config,
            registry,
            last_pose: None,
            joined: HashSet::new(),
            rendezvous_seen: HashSet::new(),
            remote: HashMap::new(),
            relay_key,
            relay_last_ack: None,
            healthy: None,
            connection: None,
            rendezvous_lost: false,
            status: (StatusLevel::Info, "starting".to_string()),
        }
    }

    pub fn key(&self) -> PeerKey {
        self.identity.key()
    }

    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    pub fn last_pose(&self) -> Option<&PoseSnapshot> {
        self.last_pose.as_ref()
    }

    pub fn has_joined(&self, key: &PeerKey) -> bool {
        self.joined.contains(key)
    }

    pub(super) fn is_relay(&self, key: &PeerKey) -> bool {
        self.relay_key.as_ref() == Some(key)
    }

    /// Decode and dispatch one inbound payload. Malformed payloads are dropped.
    pub fn handle_payload(&mut self, src: &str, payload: &[u8], now: u64) -> Effects {
        match Message::decode(payload) {
            Ok(msg) => self.dispatch(src, msg, now),
            Err(e) => {
                trace!(%src, error = %e, "dropping malformed payload");
                Effects::default()
            }
        }
    }

    /// Dispatch one message received from transport address `src`.
    pub fn dispatch(&mut self, src: &str, msg: Message, now: u64) -> Effects {
        let mut fx = Effects::default();
        if let Message::Relay { from, to, payload } = msg {
            self.on_relay(src, from, to, *payload, now, &mut fx);
            return fx;
        }
        let Some(sender) = self.attribute(src, &msg) else {
            trace!(%src, kind = msg.kind(), "dropping unattributable message");
            return fx;
        };
        self.handle(sender, msg, now, &mut fx);
        fx
    }

    /// The transport address wins, except for traffic arriving from the
    /// relay: there the claimed `from` names the original sender.
    pub fn attribute(&self, src: &str, msg: &Message) -> Option<Sender> {
        let claimed = msg.from();
        match Address::parse(src) {
            Ok(addr) if self.is_relay(&addr.key) => match claimed {
                Some(key) if key != addr.key => Some(Sender { key, addr: None }),
                _ => Some(Sender {
                    key: addr.key,
                    addr: Some(src.to_string()),
                }),
            },
            Ok(addr) => Some(Sender {
                key: addr.key,
                addr: Some(src.to_string()),
            }),
            Err(_) => claimed.map(|key| Sender { key, addr: None }),
        }
    }

    pub(super) fn handle(&mut self, sender: Sender, msg: Message, now: u64, fx: &mut Effects) {
        if sender.key == self.key() {
            return;
        }
        trace!(peer = %sender.key.short(), kind = msg.kind(), "message");
        match msg {
            Message::Hello { alias, ts, .. } => self.on_hello(&sender, alias, ts, now, fx),
            Message::Hb { t_client, .. } => self.on_hb(&sender, t_client, now, fx),
            Message::HbAck { t_client, .. } => self.on_hb_ack(&sender, t_client, now, fx),
            Message::PeersReq { ts, .. } => self.on_peers_req(&sender, ts, now, fx),
            Message::Peers { items, .. } => self.on_peers(&sender, items, now, fx),
            Message::Alias { alias, .. } => self.on_alias(&sender, alias, fx),
            Message::Pose { ts, pose, geo, .. } => self.on_pose(&sender, ts, pose, geo, now, fx),
            Message::TeleportReq { to, ts, .. } => self.on_teleport_req(&sender, to, ts, now, fx),
            Message::TeleportRsp {
                to,
                ts,
                accepted,
                dest,
                reason,
                ..
            } => self.on_teleport_rsp(&sender, to, ts, accepted, dest, reason, now, fx),
            Message::Relay { .. } => trace!(peer = %sender.key.short(), "dropping nested relay envelope"),
        }
    }

    /// Unwrap a relay envelope: handle it if it is for us, otherwise pass the
    /// payload on one hop, without falling back to a relay again.
    ///
    /// Only the configured relay may vouch for someone else's envelope. Any
    /// other source must be the envelope's own `from`, and is then treated as
    /// that peer talking directly.
    fn on_relay(
        &mut self,
        src: &str,
        from: PeerKey,
        to: PeerKey,
        payload: Message,
        now: u64,
        fx: &mut Effects,
    ) {
        let origin = Address::parse(src).ok().map(|a| a.key);
        let consistent = payload.from().map_or(true, |k| k == from);
        if to == self.key() {
            let sender = match origin {
                Some(key) if self.is_relay(&key) => Sender {
                    key: payload.from().unwrap_or(from),
                    addr: None,
                },
                Some(key) if key == from && consistent => Sender {
                    key,
                    addr: Some(src.to_string()),
                },
                _ => {
                    debug!(%src, from = %from.short(), "dropping envelope with unverified sender");
                    return;
                }
            };
            self.handle(sender, payload, now, fx);
            return;
        }
        if origin != Some(from) || !consistent || from == self.key() {
            debug!(%src, from = %from.short(), "refusing to forward envelope for another sender");
            return;
        }
        let candidates = self.registry.best_addresses(&to);
        if candidates.is_empty() {
            debug!(to = %to.short(), kind = payload.kind(), "no route for relayed message");
            return;
        }
        fx.outbound.push(Outbound::Peer {
            key: to,
            candidates,
            msg: payload,
            relay_fallback: false,
        });
    }

    /// Send `msg` back the way `sender` reached us.
    pub(super) fn reply(&self, sender: &Sender, msg: Message) -> Outbound {
        match &sender.addr {
            Some(addr) => Outbound::Direct {
                to: addr.clone(),
                msg,
            },
            None => self.to_peer(sender.key, msg),
        }
    }

    /// Datagram to `key` over its best addresses, relay as last resort.
    pub(super) fn to_peer(&self, key: PeerKey, msg: Message) -> Outbound {
        Outbound::Peer {
            key,
            candidates: self.registry.best_addresses(&key),
            msg,
            relay_fallback: true,
        }
    }

    pub(super) fn hello(&self, now: u64) -> Message {
        Message::Hello {
            from: self.key(),
            alias: self.alias.clone(),
            ts: now,
        }
    }

    pub(super) fn peers_req(&self, now: u64) -> Message {
        Message::PeersReq {
            from: self.key(),
            ts: now,
        }
    }

    /// Touch `sender` in the registry, stamped `ts` (or `now` when absent).
    pub(super) fn touch(&mut self, sender: &Sender, ts: u64, now: u64) -> bool {
        let ts = if ts == 0 { now } else { ts };
        self.registry.touch(sender.key, sender.addr.as_deref(), ts, now)
    }
}
