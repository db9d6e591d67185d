//! Teleport negotiation on top of [`TeleportCoordinator`](waymesh_protocols::TeleportCoordinator).

use tracing::debug;
use waymesh_peers::PeerKey;
use waymesh_protocols::{
    Destination, Direction, ResponseOutcome, Result as ProtocolResult, TicketStatus,
};

use super::state::{Effects, MeshState, Outbound, Sender};
use crate::events::{NodeEvent, PeerView};

impl MeshState {
    pub(super) fn on_teleport_req(
        &mut self,
        sender: &Sender,
        to: PeerKey,
        ts: u64,
        now: u64,
        fx: &mut Effects,
    ) {
        if to != self.key() {
            debug!("Teleport request from {} addressed elsewhere", sender.key.short());
            return;
        }
        self.touch(sender, ts, now);
        if self.teleport.on_request(sender.key, now) {
            fx.events.push(NodeEvent::TeleportRequested { key: sender.key });
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) fn on_teleport_rsp(
        &mut self,
        sender: &Sender,
        to: PeerKey,
        ts: u64,
        accepted: bool,
        dest: Option<Destination>,
        reason: Option<String>,
        now: u64,
        fx: &mut Effects,
    ) {
        if to != self.key() {
            return;
        }
        self.touch(sender, ts, now);
        match self.teleport.on_response(sender.key, accepted, dest, reason, now) {
            ResponseOutcome::Apply(dest) => fx.apply = Some((sender.key, dest)),
            ResponseOutcome::Resolved(status) => {
                self.push_resolved(sender.key, Direction::Outbound, status, now, fx)
            }
            ResponseOutcome::Ignored => {
                debug!("Ignoring teleport response from {}", sender.key.short())
            }
        }
    }

    /// Open an outbound request; the returned send goes over a session.
    pub fn request_teleport(&mut self, key: PeerKey, now: u64) -> ProtocolResult<Outbound> {
        let msg = self.teleport.request(key, now)?;
        Ok(Outbound::Session {
            key,
            candidates: self.registry.best_addresses(&key),
            msg,
        })
    }

    /// The request could not be delivered.
    pub fn teleport_send_failed(&mut self, key: PeerKey, reason: &str, now: u64) -> Effects {
        let mut fx = Effects::default();
        self.teleport.mark_error(key, reason, now);
        self.push_resolved(key, Direction::Outbound, TicketStatus::Error, now, &mut fx);
        fx
    }

    /// Answer a pending inbound request. `offer` is consulted only on accept.
    pub fn respond_teleport(
        &mut self,
        key: PeerKey,
        accept: bool,
        offer: Option<Destination>,
        now: u64,
    ) -> ProtocolResult<(Outbound, Effects)> {
        let msg = self
            .teleport
            .respond(key, accept, offer.filter(|_| accept), now)?;
        let mut fx = Effects::default();
        if let Some(status) = self.teleport.status(key, Direction::Inbound, now) {
            self.push_resolved(key, Direction::Inbound, status, now, &mut fx);
        }
        let send = Outbound::Session {
            key,
            candidates: self.registry.best_addresses(&key),
            msg,
        };
        Ok((send, fx))
    }

    /// Record whether the host applied an accepted destination.
    pub fn finish_apply(&mut self, key: PeerKey, applied: bool, now: u64) -> Effects {
        let mut fx = Effects::default();
        let finished = if applied {
            self.teleport.complete(key, now)
        } else {
            self.teleport.fail_apply(key, now)
        };
        if finished {
            let status = if applied {
                TicketStatus::Complete
            } else {
                TicketStatus::Error
            };
            self.push_resolved(key, Direction::Outbound, status, now, &mut fx);
        }
        fx
    }

    /// Expire overdue tickets, reporting each as resolved.
    pub fn sweep_tickets(&mut self, now: u64) -> Effects {
        let mut fx = Effects::default();
        for ticket in self.teleport.sweep(now) {
            fx.events.push(NodeEvent::TeleportResolved {
                key: ticket.peer,
                direction: ticket.direction,
                status: ticket.status,
                reason: ticket.reason,
            });
        }
        fx
    }

    /// One view per known peer. Tickets are expired first, so a stale
    /// pending status never shows.
    pub fn peer_views(&mut self, now: u64) -> (Vec<PeerView>, Effects) {
        let fx = self.sweep_tickets(now);
        let tickets = self.teleport.snapshot(now);
        let status_of = |key: PeerKey, direction: Direction| {
            tickets
                .iter()
                .find(|t| t.peer == key && t.direction == direction)
                .map(|t| t.status)
        };
        let window = self.config.online_window_ms;
        let views = self
            .registry
            .known_peers()
            .into_iter()
            .map(|key| {
                let runtime = self.registry.peer(&key);
                let last_seen = runtime.map(|p| p.last_seen_ts).unwrap_or_else(|| {
                    self.registry
                        .book()
                        .get(&key)
                        .map(|r| r.last_seen_ts)
                        .unwrap_or(0)
                });
                PeerView {
                    key,
                    alias: runtime.and_then(|p| p.alias.clone()),
                    online: self.registry.is_online(&key, now, window),
                    last_seen,
                    geo: self.remote_geo(&key),
                    incoming_ticket_status: status_of(key, Direction::Inbound),
                    outgoing_ticket_status: status_of(key, Direction::Outbound),
                }
            })
            .collect();
        (views, fx)
    }

    fn push_resolved(
        &mut self,
        key: PeerKey,
        direction: Direction,
        status: TicketStatus,
        now: u64,
        fx: &mut Effects,
    ) {
        let reason = self
            .teleport
            .ticket(key, direction, now)
            .and_then(|t| t.reason.clone());
        fx.events.push(NodeEvent::TeleportResolved {
            key,
            direction,
            status,
            reason,
        });
    }
}
