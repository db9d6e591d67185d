//! Heartbeats, relay health and the recovery sweep.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};
use waymesh_peers::{Address, BookStore};
use waymesh_protocols::Message;

use super::state::{Effects, MeshState, Outbound, Sender};
use crate::collaborators::ConnectionState;
use crate::events::{NodeEvent, StatusLevel};

impl MeshState {
    pub(super) fn on_hb(&mut self, sender: &Sender, t_client: u64, now: u64, fx: &mut Effects) {
        self.touch(sender, now, now);
        let ack = Message::HbAck {
            from: self.key(),
            t_client,
        };
        fx.outbound.push(self.reply(sender, ack));
    }

    pub(super) fn on_hb_ack(&mut self, sender: &Sender, t_client: u64, now: u64, fx: &mut Effects) {
        self.touch(sender, now, now);
        let rtt = now.saturating_sub(t_client);
        if let Some(addr) = &sender.addr {
            self.registry.metrics_mut().record_ack(addr, rtt, now);
        }
        if self.is_relay(&sender.key) {
            self.relay_last_ack = Some(now);
        }
        self.refresh_health(now, fx);
    }

    /// Probe every known address and the relay.
    pub fn heartbeat_tick(&mut self, now: u64) -> Effects {
        let mut fx = Effects::default();
        let mut targets: BTreeSet<String> = self.registry.probe_targets().into_iter().collect();
        if let Some(relay) = &self.config.relay {
            targets.insert(relay.clone());
        }
        let hb = Message::Hb {
            from: self.key(),
            t_client: now,
        };
        for to in targets {
            self.registry.metrics_mut().record_probe(&to, now);
            fx.outbound.push(Outbound::Direct {
                to,
                msg: hb.clone(),
            });
        }
        self.refresh_health(now, &mut fx);
        fx
    }

    /// Whether the relay acked within the health window. Without a relay,
    /// any address acking counts.
    pub fn relay_healthy(&self, now: u64) -> bool {
        let window = self.config.health_window_ms;
        match &self.config.relay {
            Some(_) => self
                .relay_last_ack
                .is_some_and(|t| now.saturating_sub(t) <= window),
            None => {
                let metrics = self.registry.metrics();
                metrics
                    .addresses()
                    .any(|a| metrics.acked_within(a, now, window))
            }
        }
    }

    /// While unhealthy, greet every address we have ever known.
    pub fn sweep_tick(&mut self, now: u64) -> Effects {
        let mut fx = Effects::default();
        self.refresh_health(now, &mut fx);
        if self.relay_healthy(now) {
            return fx;
        }

        let me = self.key();
        let mut targets: BTreeSet<String> = self.registry.book().all_addresses().into_iter().collect();
        targets.extend(self.config.bootstrap.iter().cloned());
        targets.extend(self.config.relay.iter().cloned());
        targets.retain(|a| *a != self.local_address && Address::parse(a).map_or(true, |p| p.key != me));

        if !targets.is_empty() {
            debug!("Sweeping {} addresses", targets.len());
        }
        let hello = self.hello(now);
        let req = self.peers_req(now);
        for to in targets {
            self.registry.metrics_mut().record_probe(&to, now);
            fx.outbound.push(Outbound::Direct {
                to: to.clone(),
                msg: hello.clone(),
            });
            fx.outbound.push(Outbound::Direct {
                to,
                msg: req.clone(),
            });
        }
        fx
    }

    /// Ask online peers and the relay for their rosters.
    pub fn roster_tick(&mut self, now: u64) -> Effects {
        let mut fx = Effects::default();
        let req = self.peers_req(now);
        for key in self.registry.online_peers(now, self.config.online_window_ms) {
            fx.outbound.push(self.to_peer(key, req.clone()));
        }
        if let Some(relay) = &self.config.relay {
            fx.outbound.push(Outbound::Direct {
                to: relay.clone(),
                msg: req,
            });
        }
        fx.presence = true;
        fx
    }

    /// Persist the address book if its debounce deadline passed.
    pub fn flush_if_due(&mut self, now: u64, store: &dyn BookStore) -> bool {
        self.registry.flush_if_due(now, store)
    }

    /// Persist the address book now.
    pub fn flush(&mut self, now: u64, store: &dyn BookStore) {
        self.registry.flush(now, store);
    }

    pub(super) fn refresh_health(&mut self, now: u64, fx: &mut Effects) {
        let healthy = self.relay_healthy(now);
        if self.healthy != Some(healthy) {
            match (self.healthy, healthy) {
                (_, true) => info!("Relay healthy"),
                (Some(true), false) => warn!("Relay unhealthy, sweeping address book"),
                (_, false) => debug!("Relay not yet reachable"),
            }
            self.healthy = Some(healthy);
        }
        self.refresh_status(fx);
    }

    /// Recompute the combined status and emit it if it changed.
    pub(super) fn refresh_status(&mut self, fx: &mut Effects) {
        let status = self.compute_status();
        if self.status != status {
            self.status = status.clone();
            fx.events.push(NodeEvent::Status {
                level: status.0,
                detail: status.1,
            });
        }
    }

    fn compute_status(&self) -> (StatusLevel, String) {
        let health = match self.healthy {
            Some(false) if self.config.relay.is_some() => (StatusLevel::Warn, "relay unreachable"),
            Some(false) => (StatusLevel::Warn, "no reachable peers"),
            Some(true) => (StatusLevel::Info, "connected"),
            None => (StatusLevel::Info, "starting"),
        };
        let rendezvous = match self.connection {
            Some(ConnectionState::Failed) => Some((StatusLevel::Error, "rendezvous failed")),
            Some(ConnectionState::Disconnected) => {
                Some((StatusLevel::Warn, "rendezvous disconnected"))
            }
            Some(ConnectionState::Connecting) => Some((StatusLevel::Warn, "rendezvous connecting")),
            Some(ConnectionState::Connected) | None => None,
        };
        let (level, detail) = match rendezvous {
            Some(r) if r.0 > health.0 => r,
            _ => health,
        };
        (level, detail.to_string())
    }

    /// Current combined status.
    pub fn status(&self) -> (StatusLevel, &str) {
        (self.status.0, &self.status.1)
    }
}

#[cfg(test)]
mod tests {
    use super::super::state::testkit::*;
    use super::super::MeshConfig;
    use super::*;
    use waymesh_peers::MemoryBookStore;

    #[test]
    fn hb_is_acked_to_source() {
        let mut a = state(1);
        let b = state(2);
        let fx = a.dispatch(&addr(&b), Message::Hb { from: b.key(), t_client: 77 }, 1_000);
        assert_eq!(fx.outbound.len(), 1);
        assert_eq!(
            fx.outbound[0],
            Outbound::Direct {
                to: addr(&b),
                msg: Message::HbAck { from: a.key(), t_client: 77 },
            }
        );
    }

    #[test]
    fn hb_ack_records_rtt_and_online() {
        let mut a = state(1);
        let b = state(2);
        a.dispatch(&addr(&b), Message::HbAck { from: b.key(), t_client: 960 }, 1_000);
        let metric = a.registry().metrics().get(&addr(&b)).unwrap();
        assert_eq!(metric.rtt_ms, Some(40));
        assert_eq!(metric.last_ack, 1_000);
        assert!(a.registry().is_online(&b.key(), 1_000, 15_000));
        assert!(!a.registry().is_online(&b.key(), 20_000, 15_000));
    }

    #[test]
    fn heartbeat_probes_book_and_relay() {
        let relay = state(9);
        let mut a = state_with(1, MeshConfig::default().with_relay(addr(&relay)));
        let b = state(2);
        a.registry_mut().touch(b.key(), Some(&addr(&b)), 10, 10);

        let fx = a.heartbeat_tick(2_000);
        let mut targets = targets(&fx, "hb");
        targets.sort();
        let mut expected = vec![addr(&b), addr(&relay)];
        expected.sort();
        assert_eq!(targets, expected);
        assert_eq!(a.registry().metrics().get(&addr(&relay)).unwrap().last_probe, 2_000);
    }

    #[test]
    fn relay_health_follows_its_acks() {
        let relay = state(9);
        let mut a = state_with(1, MeshConfig::default().with_relay(addr(&relay)));
        assert!(!a.relay_healthy(1_000));

        let fx = a.dispatch(&addr(&relay), Message::HbAck { from: relay.key(), t_client: 990 }, 1_000);
        assert!(a.relay_healthy(1_000));
        assert!(fx.events.iter().any(|e| matches!(e, NodeEvent::Status { level: StatusLevel::Info, .. })));
        assert!(a.relay_healthy(19_000));
        assert!(!a.relay_healthy(19_001));
    }

    #[test]
    fn without_relay_any_ack_is_healthy() {
        let mut a = state(1);
        let b = state(2);
        assert!(!a.relay_healthy(1_000));
        a.dispatch(&addr(&b), Message::HbAck { from: b.key(), t_client: 990 }, 1_000);
        assert!(a.relay_healthy(1_000));
    }

    #[test]
    fn sweep_only_while_unhealthy() {
        let relay = state(9);
        let config = MeshConfig::default()
            .with_relay(addr(&relay))
            .with_bootstrap(vec!["seed.node".into()]);
        let mut a = state_with(1, config);
        let b = state(2);
        a.registry_mut().touch(b.key(), Some(&addr(&b)), 10, 10);

        let fx = a.sweep_tick(30_000);
        let mut hellos = targets(&fx, "hello");
        hellos.sort();
        let mut expected = vec![addr(&b), addr(&relay), "seed.node".to_string()];
        expected.sort();
        assert_eq!(hellos, expected);
        assert_eq!(fx.sent("peers_req").len(), 3);
        assert!(fx.events.iter().any(|e| matches!(
            e,
            NodeEvent::Status { level: StatusLevel::Warn, detail } if detail == "relay unreachable"
        )));

        a.dispatch(&addr(&relay), Message::HbAck { from: relay.key(), t_client: 30_000 }, 30_010);
        assert!(a.sweep_tick(31_000).outbound.is_empty());
    }

    #[test]
    fn roster_tick_asks_online_peers_and_relay() {
        let relay = state(9);
        let mut a = state_with(1, MeshConfig::default().with_relay(addr(&relay)));
        let b = state(2);
        let c = state(3);
        a.dispatch(&addr(&b), Message::HbAck { from: b.key(), t_client: 0 }, 1_000);
        a.registry_mut().touch(c.key(), Some(&addr(&c)), 10, 10);

        let fx = a.roster_tick(2_000);
        let reqs = fx.sent("peers_req");
        assert_eq!(reqs.len(), 2);
        assert!(matches!(reqs[0], Outbound::Peer { key, .. } if *key == b.key()));
        assert!(matches!(reqs[1], Outbound::Direct { to, .. } if *to == addr(&relay)));
        assert!(fx.presence);
    }

    #[test]
    fn flush_is_debounced() {
        let mut a = state(1);
        let b = state(2);
        let store = MemoryBookStore::new();
        a.dispatch(&addr(&b), Message::Hb { from: b.key(), t_client: 1 }, 1_000);
        assert!(!a.flush_if_due(1_100, &store));
        assert!(a.flush_if_due(1_800, &store));
        assert_eq!(store.write_count(), 1);
        assert!(!a.flush_if_due(5_000, &store));
    }
}
