//! Presence: hello, roster exchange and aliases.

use tracing::{debug, info};
use waymesh_peers::{PeerKey, RosterEntry};
use waymesh_protocols::Message;

use super::state::{Effects, MeshState, Sender};
use crate::events::{Discovery, NodeEvent};

impl MeshState {
    pub(super) fn on_hello(
        &mut self,
        sender: &Sender,
        alias: Option<String>,
        ts: u64,
        now: u64,
        fx: &mut Effects,
    ) {
        self.touch(sender, ts, now);
        fx.events.push(NodeEvent::PeerSurfaced {
            key: sender.key,
            addr: sender.addr.clone(),
            via: Discovery::Direct,
        });
        if alias.is_some() {
            self.apply_alias(sender.key, alias, fx);
        }
        self.push_snapshot(sender.key, fx);

        if self.joined.insert(sender.key) {
            info!("Peer {} joined", sender.key.short());
            fx.events.push(NodeEvent::PeerJoined {
                key: sender.key,
                alias: self.peer_alias(&sender.key),
            });
            let hello = self.hello(now);
            fx.outbound.push(self.reply(sender, hello));
        }
    }

    pub(super) fn on_peers_req(&mut self, sender: &Sender, ts: u64, now: u64, fx: &mut Effects) {
        self.touch(sender, ts, now);
        let reply = Message::Peers {
            from: Some(self.key()),
            items: self.roster(now),
        };
        fx.outbound.push(self.reply(sender, reply));
        self.push_snapshot(sender.key, fx);
    }

    pub(super) fn on_peers(
        &mut self,
        sender: &Sender,
        items: Vec<RosterEntry>,
        now: u64,
        fx: &mut Effects,
    ) {
        self.touch(sender, now, now);
        let mut surfaced = 0;
        for item in items {
            if item.key == self.key() {
                continue;
            }
            let known = self.registry.directory().contains(&item.key);
            if !self.registry.merge_roster(&item, now) {
                continue;
            }
            if !known {
                surfaced += 1;
                fx.events.push(NodeEvent::PeerSurfaced {
                    key: item.key,
                    addr: item.own_addr().map(str::to_string),
                    via: Discovery::Roster,
                });
            }
            self.push_snapshot(item.key, fx);
        }
        if surfaced > 0 {
            debug!("Roster from {} surfaced {} peers", sender.key.short(), surfaced);
        }
    }

    /// Alias updates never touch address metrics.
    pub(super) fn on_alias(&mut self, sender: &Sender, alias: String, fx: &mut Effects) {
        let alias = Some(alias).filter(|a| !a.is_empty());
        self.apply_alias(sender.key, alias, fx);
    }

    /// Set our own display name; returns the messages announcing it.
    pub fn set_alias(&mut self, alias: Option<String>, now: u64) -> Effects {
        let mut fx = Effects::default();
        self.alias = alias.filter(|a| !a.is_empty());
        let msg = Message::Alias {
            from: self.key(),
            alias: self.alias.clone().unwrap_or_default(),
        };
        for key in self.registry.online_peers(now, self.config.online_window_ms) {
            fx.outbound.push(self.to_peer(key, msg.clone()));
        }
        fx.presence = true;
        fx
    }

    /// Roster reply: every known peer plus ourselves.
    pub fn roster(&self, now: u64) -> Vec<RosterEntry> {
        let me = RosterEntry {
            key: self.key(),
            ids: self
                .identity
                .address()
                .identifier
                .iter()
                .cloned()
                .collect(),
            addr: Some(self.local_address.clone()),
            last_seen: now,
            alias: self.alias.clone(),
        };
        std::iter::once(me)
            .chain(self.registry.roster())
            .collect()
    }

    pub(super) fn apply_alias(&mut self, key: PeerKey, alias: Option<String>, fx: &mut Effects) {
        if self.registry.set_alias(key, alias) {
            fx.events.push(NodeEvent::AliasChanged {
                key,
                alias: self.peer_alias(&key),
            });
        }
    }

    fn peer_alias(&self, key: &PeerKey) -> Option<String> {
        self.registry.peer(key).and_then(|p| p.alias.clone())
    }

    /// Our last pose, addressed to `key`, so new peers see us immediately.
    pub(super) fn push_snapshot(&self, key: PeerKey, fx: &mut Effects) {
        if let Some(pose) = &self.last_pose {
            let msg = self.pose_message(pose);
            fx.outbound.push(self.to_peer(key, msg));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::state::testkit::*;
    use super::super::state::Outbound;
    use super::*;
    use waymesh_protocols::{PoseExtras, PoseSnapshot};

    fn hello(from: PeerKey, alias: Option<&str>) -> Message {
        Message::Hello { from, alias: alias.map(String::from), ts: 500 }
    }

    #[test]
    fn first_hello_joins_and_greets_back() {
        let mut a = state(1);
        let b = state(2);
        let fx = a.dispatch(&addr(&b), hello(b.key(), Some("bee")), 1_000);

        assert!(a.has_joined(&b.key()));
        assert!(fx.events.iter().any(|e| matches!(
            e,
            NodeEvent::PeerJoined { key, alias: Some(alias) } if *key == b.key() && alias == "bee"
        )));
        assert_eq!(targets(&fx, "hello"), vec![addr(&b)]);
        assert_eq!(a.registry().best_addresses(&b.key()), vec![addr(&b)]);

        let again = a.dispatch(&addr(&b), hello(b.key(), None), 2_000);
        assert!(again.sent("hello").is_empty());
        assert!(!again.events.iter().any(|e| matches!(e, NodeEvent::PeerJoined { .. })));
    }

    #[test]
    fn mutual_hello_terminates() {
        let mut a = state(1);
        let mut b = state(2);
        let fx = b.dispatch(&addr(&a), a.hello(0), 1_000);
        let greeting = fx.sent("hello")[0].message().clone();
        let fx = a.dispatch(&addr(&b), greeting, 1_001);
        let greeting = fx.sent("hello")[0].message().clone();
        let fx = b.dispatch(&addr(&a), greeting, 1_002);
        assert!(fx.sent("hello").is_empty());
    }

    #[test]
    fn hello_replays_last_pose() {
        let mut a = state(1);
        let b = state(2);
        a.last_pose = Some(PoseSnapshot::from_tick(
            [1.0, 2.0, 3.0],
            [0.0, 0.0, 0.0, 1.0],
            None,
            false,
            false,
            PoseExtras::default(),
            900,
        ));
        let fx = a.dispatch(&addr(&b), hello(b.key(), None), 1_000);
        assert_eq!(fx.sent("pose").len(), 1);
    }

    #[test]
    fn peers_req_replies_with_self_and_roster() {
        let mut a = state(1);
        let b = state(2);
        let c = state(3);
        a.registry_mut().touch(c.key(), Some(&addr(&c)), 10, 10);

        let fx = a.dispatch(&addr(&b), b.peers_req(100), 1_000);
        let replies = fx.sent("peers");
        assert_eq!(replies.len(), 1);
        let Outbound::Direct { to, msg: Message::Peers { from, items } } = replies[0] else {
            panic!("expected direct peers reply");
        };
        assert_eq!(to, &addr(&b));
        assert_eq!(*from, Some(a.key()));
        let keys: Vec<PeerKey> = items.iter().map(|i| i.key).collect();
        assert_eq!(keys[0], a.key());
        assert!(keys.contains(&b.key()));
        assert!(keys.contains(&c.key()));
        assert_eq!(items[0].ids, vec!["pose".to_string()]);
    }

    #[test]
    fn peers_merge_surfaces_new_peers_once() {
        let mut a = state(1);
        let b = state(2);
        let c = state(3);
        let items = vec![
            RosterEntry {
                key: c.key(),
                ids: vec!["pose".into()],
                addr: Some(addr(&c)),
                last_seen: 50,
                alias: Some("sea".into()),
            },
            RosterEntry {
                key: a.key(),
                ids: vec![],
                addr: Some(addr(&a)),
                last_seen: 50,
                alias: None,
            },
        ];
        let msg = Message::Peers { from: Some(b.key()), items: items.clone() };
        let fx = a.dispatch(&addr(&b), msg.clone(), 1_000);
        let surfaced: Vec<PeerKey> = fx
            .events
            .iter()
            .filter_map(|e| match e {
                NodeEvent::PeerSurfaced { key, via: Discovery::Roster, .. } => Some(*key),
                _ => None,
            })
            .collect();
        assert_eq!(surfaced, vec![c.key()]);
        assert_eq!(a.registry().peer(&c.key()).unwrap().alias.as_deref(), Some("sea"));
        assert!(!a.registry().known_peers().contains(&a.key()));

        let fx = a.dispatch(&addr(&b), msg, 2_000);
        assert!(!fx.events.iter().any(|e| matches!(e, NodeEvent::PeerSurfaced { via: Discovery::Roster, .. })));
    }

    #[test]
    fn alias_does_not_touch_metrics() {
        let mut a = state(1);
        let b = state(2);
        let fx = a.dispatch(&addr(&b), Message::Alias { from: b.key(), alias: "bee".into() }, 1_000);
        assert!(matches!(&fx.events[0], NodeEvent::AliasChanged { alias: Some(a), .. } if a == "bee"));
        assert!(a.registry().metrics().get(&addr(&b)).is_none());

        let fx = a.dispatch(&addr(&b), Message::Alias { from: b.key(), alias: String::new() }, 1_100);
        assert!(matches!(&fx.events[0], NodeEvent::AliasChanged { alias: None, .. }));
    }

    #[test]
    fn set_alias_announces_to_online_peers() {
        let mut a = state(1);
        let b = state(2);
        a.registry_mut().touch(b.key(), Some(&addr(&b)), 10, 10);
        a.registry_mut().metrics_mut().record_ack(&addr(&b), 5, 990);

        let fx = a.set_alias(Some("ay".into()), 1_000);
        assert_eq!(a.alias(), Some("ay"));
        assert_eq!(fx.sent("alias").len(), 1);
        assert!(fx.presence);
    }
}
