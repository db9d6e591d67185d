//! Bridge from rendezvous discovery into the peer table.

use tracing::{debug, error, info, warn};
use waymesh_peers::{Address, PeerKey};

use super::state::{Effects, MeshState, Outbound, Sender};
use crate::collaborators::{ConnectionState, RendezvousEvent, RendezvousMeta};
use crate::events::{Discovery, NodeEvent};

impl MeshState {
    pub fn on_rendezvous(&mut self, event: RendezvousEvent, now: u64) -> Effects {
        let mut fx = Effects::default();
        match event {
            RendezvousEvent::Peer { key, meta } => self.rendezvous_peer(key, &meta, now, &mut fx),
            RendezvousEvent::Snapshot { peers } => {
                for (key, meta) in peers {
                    self.rendezvous_peer(key, &meta, now, &mut fx);
                }
            }
            RendezvousEvent::Handshake { key, meta, want_ack } => {
                if key == self.key() {
                    return fx;
                }
                self.absorb_meta(key, &meta, now, &mut fx);
                if want_ack {
                    fx.handshake_acks.push(key);
                }
            }
            RendezvousEvent::HandshakeAck { key, meta } => {
                if key != self.key() {
                    self.absorb_meta(key, &meta, now, &mut fx);
                }
            }
            RendezvousEvent::Status(state) => self.on_connection_state(state, &mut fx),
        }
        fx
    }

    /// Our metadata as announced through rendezvous.
    pub fn rendezvous_meta(&self, now: u64) -> RendezvousMeta {
        RendezvousMeta {
            address: Some(self.local_address.clone()),
            alias: self.alias.clone(),
            ts: Some(now),
        }
    }

    fn rendezvous_peer(&mut self, key: PeerKey, meta: &RendezvousMeta, now: u64, fx: &mut Effects) {
        if key == self.key() {
            return;
        }
        self.absorb_meta(key, meta, now, fx);
        if !self.rendezvous_seen.insert(key) {
            return;
        }
        debug!("Rendezvous sighting of {}", key.short());
        fx.handshakes.push(key);

        let hello = self.hello(now);
        let req = self.peers_req(now);
        match self.meta_address(key, meta) {
            Some(to) => {
                fx.outbound.push(Outbound::Direct {
                    to: to.clone(),
                    msg: hello,
                });
                fx.outbound.push(Outbound::Direct { to, msg: req });
            }
            None => {
                fx.outbound.push(self.to_peer(key, hello));
                fx.outbound.push(self.to_peer(key, req));
            }
        }
    }

    /// Address from rendezvous metadata, if it really belongs to `key`.
    fn meta_address(&self, key: PeerKey, meta: &RendezvousMeta) -> Option<String> {
        meta.address
            .as_deref()
            .filter(|a| Address::parse(a).is_ok_and(|p| p.key == key))
            .map(str::to_string)
    }

    fn absorb_meta(&mut self, key: PeerKey, meta: &RendezvousMeta, now: u64, fx: &mut Effects) {
        let known = self.registry.directory().contains(&key);
        let sender = Sender {
            key,
            addr: self.meta_address(key, meta),
        };
        self.touch(&sender, meta.ts.unwrap_or(now), now);
        if !known {
            fx.events.push(NodeEvent::PeerSurfaced {
                key,
                addr: sender.addr.clone(),
                via: Discovery::Rendezvous,
            });
        }
        if meta.alias.is_some() {
            self.apply_alias(key, meta.alias.clone(), fx);
        }
    }

    fn on_connection_state(&mut self, state: ConnectionState, fx: &mut Effects) {
        let previous = self.connection.replace(state);
        if previous == Some(state) {
            return;
        }
        match state {
            ConnectionState::Connected => info!("Rendezvous connected"),
            ConnectionState::Connecting => info!("Rendezvous connecting"),
            ConnectionState::Disconnected => warn!("Rendezvous disconnected"),
            ConnectionState::Failed => error!("Rendezvous connection failed"),
        }
        match state {
            ConnectionState::Disconnected | ConnectionState::Failed => self.rendezvous_lost = true,
            ConnectionState::Connected if self.rendezvous_lost => {
                self.rendezvous_lost = false;
                fx.handshake_all = true;
                fx.presence = true;
            }
            _ => {}
        }
        self.refresh_status(fx);
    }
}
