//! Teleport negotiation.
//!
//! ```text
//!            request / teleport_req
//!                      │
//!                   pending ──(45s, on read)──► expired
//!                      │
//!    ┌─────────┬───────┴────┬─────────────┐
//!    ▼         ▼            ▼             ▼
//! accepted  rejected   unavailable      error
//!    │
//!    ▼ (destination applied)
//! complete
//! ```
//!
//! Each peer pair holds at most one ticket per direction. Timeouts are checked
//! whenever tickets are read; there is no timer. Resolved tickets are pruned
//! once they have been stale for the prune window.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use waymesh_peers::PeerKey;

use crate::error::{Error, Result};
use crate::message::Message;

/// Reason sent when the local user declines.
pub const REASON_DECLINED: &str = "declined";
/// Reason sent when the user accepted but no destination could be offered.
pub const REASON_UNAVAILABLE: &str = "unavailable";
/// Reason recorded on a pending ticket that timed out.
pub const REASON_TIMEOUT: &str = "timeout";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketStatus {
    Pending,
    Accepted,
    Rejected,
    Expired,
    Error,
    Unavailable,
    Complete,
}

impl TicketStatus {
    pub fn is_pending(self) -> bool {
        self == TicketStatus::Pending
    }

    /// Status for a non-accepted reply carrying `reason`.
    pub fn from_reason(reason: Option<&str>) -> Self {
        match reason {
            Some("unavailable") => TicketStatus::Unavailable,
            Some("expired") | Some(REASON_TIMEOUT) => TicketStatus::Expired,
            Some("error") => TicketStatus::Error,
            _ => TicketStatus::Rejected,
        }
    }
}

/// Where a teleport lands.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    pub lat: f64,
    pub lon: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ground: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub yaw: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeleportTicket {
    pub peer: PeerKey,
    pub direction: Direction,
    pub status: TicketStatus,
    pub ts: u64,
    pub responded_at: Option<u64>,
    pub reason: Option<String>,
    pub destination: Option<Destination>,
}

impl TeleportTicket {
    fn pending(peer: PeerKey, direction: Direction, now: u64) -> Self {
        Self {
            peer,
            direction,
            status: TicketStatus::Pending,
            ts: now,
            responded_at: None,
            reason: None,
            destination: None,
        }
    }

    fn resolve(&mut self, status: TicketStatus, reason: Option<String>, now: u64) {
        self.status = status;
        self.reason = reason;
        self.responded_at = Some(now);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TeleportConfig {
    pub pending_timeout_ms: u64,
    pub prune_after_ms: u64,
}

impl Default for TeleportConfig {
    fn default() -> Self {
        Self {
            pending_timeout_ms: 45_000,
            prune_after_ms: 60_000,
        }
    }
}

/// What the caller should do after a `teleport_rsp`.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    /// Accepted with a destination. Apply it, then call
    /// [`TeleportCoordinator::complete`] or [`TeleportCoordinator::fail_apply`].
    Apply(Destination),
    /// The ticket reached this terminal status.
    Resolved(TicketStatus),
    /// No pending outbound ticket for this peer.
    Ignored,
}

/// Ticket table for one node.
#[derive(Debug)]
pub struct TeleportCoordinator {
    self_key: PeerKey,
    config: TeleportConfig,
    tickets: HashMap<(PeerKey, Direction), TeleportTicket>,
}

impl TeleportCoordinator {
    pub fn new(self_key: PeerKey, config: TeleportConfig) -> Self {
        Self {
            self_key,
            config,
            tickets: HashMap::new(),
        }
    }

    /// Open an outbound request to `peer` and return the message to send.
    ///
    /// Fails with [`Error::TicketPending`] while an earlier request is pending.
    pub fn request(&mut self, peer: PeerKey, now: u64) -> Result<Message> {
        self.sweep(now);
        let slot = (peer, Direction::Outbound);
        if self.tickets.get(&slot).is_some_and(|t| t.status.is_pending()) {
            return Err(Error::TicketPending(peer));
        }
        self.tickets
            .insert(slot, TeleportTicket::pending(peer, Direction::Outbound, now));
        info!(peer = %peer.short(), "teleport requested");
        Ok(Message::TeleportReq {
            from: self.self_key,
            to: peer,
            ts: now,
        })
    }

    /// The request could not be sent.
    pub fn mark_error(&mut self, peer: PeerKey, reason: impl Into<String>, now: u64) {
        if let Some(ticket) = self.pending_mut(peer, Direction::Outbound) {
            let reason = reason.into();
            debug!(peer = %peer.short(), %reason, "teleport request failed");
            ticket.resolve(TicketStatus::Error, Some(reason), now);
        }
    }

    /// Handle a `teleport_rsp` from `from`.
    pub fn on_response(
        &mut self,
        from: PeerKey,
        accepted: bool,
        dest: Option<Destination>,
        reason: Option<String>,
        now: u64,
    ) -> ResponseOutcome {
        self.sweep(now);
        let Some(ticket) = self.pending_mut(from, Direction::Outbound) else {
            return ResponseOutcome::Ignored;
        };
        let outcome = match (accepted, dest) {
            (true, Some(dest)) => {
                ticket.resolve(TicketStatus::Accepted, reason, now);
                ticket.destination = Some(dest);
                ResponseOutcome::Apply(dest)
            }
            (true, None) => {
                let reason = reason.unwrap_or_else(|| REASON_UNAVAILABLE.to_string());
                ticket.resolve(TicketStatus::Unavailable, Some(reason), now);
                ResponseOutcome::Resolved(TicketStatus::Unavailable)
            }
            (false, _) => {
                let status = TicketStatus::from_reason(reason.as_deref());
                let reason = reason.unwrap_or_else(|| "rejected".to_string());
                ticket.resolve(status, Some(reason), now);
                ResponseOutcome::Resolved(status)
            }
        };
        info!(peer = %from.short(), ?outcome, "teleport response");
        outcome
    }

    /// The accepted destination was applied.
    pub fn complete(&mut self, peer: PeerKey, now: u64) -> bool {
        self.finish_accepted(peer, TicketStatus::Complete, None, now)
    }

    /// The accepted destination could not be applied.
    pub fn fail_apply(&mut self, peer: PeerKey, now: u64) -> bool {
        self.finish_accepted(peer, TicketStatus::Error, Some("apply_failed".into()), now)
    }

    fn finish_accepted(
        &mut self,
        peer: PeerKey,
        status: TicketStatus,
        reason: Option<String>,
        now: u64,
    ) -> bool {
        match self.tickets.get_mut(&(peer, Direction::Outbound)) {
            Some(ticket) if ticket.status == TicketStatus::Accepted => {
                ticket.status = status;
                ticket.responded_at = Some(now);
                if reason.is_some() {
                    ticket.reason = reason;
                }
                true
            }
            _ => false,
        }
    }

    /// Handle a `teleport_req` from `from`.
    ///
    /// Returns `true` when a new pending ticket was opened, `false` when an
    /// existing one was refreshed.
    pub fn on_request(&mut self, from: PeerKey, now: u64) -> bool {
        self.sweep(now);
        if let Some(ticket) = self.pending_mut(from, Direction::Inbound) {
            ticket.ts = now;
            return false;
        }
        self.tickets.insert(
            (from, Direction::Inbound),
            TeleportTicket::pending(from, Direction::Inbound, now),
        );
        info!(peer = %from.short(), "teleport request received");
        true
    }

    /// Answer a pending inbound request.
    ///
    /// `offer` is the host's destination at the moment of acceptance. An
    /// acceptance without an offer goes out as `accepted: false` with reason
    /// `unavailable`, which is distinct from a decline.
    pub fn respond(
        &mut self,
        peer: PeerKey,
        accept: bool,
        offer: Option<Destination>,
        now: u64,
    ) -> Result<Message> {
        self.sweep(now);
        let self_key = self.self_key;
        let ticket = self
            .pending_mut(peer, Direction::Inbound)
            .ok_or(Error::UnknownTicket(peer))?;

        let (accepted, dest, reason) = match (accept, offer) {
            (false, _) => {
                ticket.resolve(TicketStatus::Rejected, Some(REASON_DECLINED.into()), now);
                (false, None, Some(REASON_DECLINED.to_string()))
            }
            (true, None) => {
                ticket.resolve(
                    TicketStatus::Unavailable,
                    Some(REASON_UNAVAILABLE.into()),
                    now,
                );
                (false, None, Some(REASON_UNAVAILABLE.to_string()))
            }
            (true, Some(dest)) => {
                ticket.resolve(TicketStatus::Accepted, None, now);
                ticket.destination = Some(dest);
                (true, Some(dest), None)
            }
        };
        info!(peer = %peer.short(), accepted, ?reason, "teleport answered");
        Ok(Message::TeleportRsp {
            from: self_key,
            to: peer,
            ts: now,
            accepted,
            dest,
            reason,
        })
    }

    /// Ticket for `peer` in `direction`, after expiring stale ones.
    pub fn ticket(
        &mut self,
        peer: PeerKey,
        direction: Direction,
        now: u64,
    ) -> Option<&TeleportTicket> {
        self.sweep(now);
        self.tickets.get(&(peer, direction))
    }

    /// Status for `peer` in `direction`, after expiring stale ones.
    pub fn status(&mut self, peer: PeerKey, direction: Direction, now: u64) -> Option<TicketStatus> {
        self.ticket(peer, direction, now).map(|t| t.status)
    }

    /// Every live ticket, oldest first.
    pub fn snapshot(&mut self, now: u64) -> Vec<TeleportTicket> {
        self.sweep(now);
        let mut out: Vec<_> = self.tickets.values().cloned().collect();
        out.sort_by_key(|t| (t.ts, t.peer));
        out
    }

    /// Expire overdue pending tickets and prune stale resolved ones.
    ///
    /// Returns the tickets that expired during this call.
    pub fn sweep(&mut self, now: u64) -> Vec<TeleportTicket> {
        let TeleportConfig {
            pending_timeout_ms,
            prune_after_ms,
        } = self.config;

        let mut expired = Vec::new();
        for ticket in self.tickets.values_mut() {
            if ticket.status.is_pending() && now.saturating_sub(ticket.ts) >= pending_timeout_ms {
                ticket.resolve(TicketStatus::Expired, Some(REASON_TIMEOUT.into()), now);
                debug!(peer = %ticket.peer.short(), direction = ?ticket.direction, "teleport ticket expired");
                expired.push(ticket.clone());
            }
        }
        self.tickets.retain(|_, t| {
            t.status.is_pending()
                || now.saturating_sub(t.responded_at.unwrap_or(t.ts)) < prune_after_ms
        });
        expired
    }

    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }

    fn pending_mut(&mut self, peer: PeerKey, direction: Direction) -> Option<&mut TeleportTicket> {
        self.tickets
            .get_mut(&(peer, direction))
            .filter(|t| t.status.is_pending())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(b: u8) -> PeerKey {
        PeerKey([b; 32])
    }

    fn coord(b: u8) -> TeleportCoordinator {
        TeleportCoordinator::new(key(b), TeleportConfig::default())
    }

    const DEST: Destination = Destination {
        lat: 48.0,
        lon: 11.0,
        ground: Some(520.0),
        yaw: None,
    };

    #[test]
    fn duplicate_outbound_request_refused() {
        let mut c = coord(0);
        assert!(c.request(key(1), 0).is_ok());
        assert!(matches!(c.request(key(1), 10), Err(Error::TicketPending(_))));
        assert!(c.request(key(2), 10).is_ok());
    }

    #[test]
    fn accepted_with_destination_completes() {
        let mut c = coord(0);
        c.request(key(1), 0).unwrap();
        let outcome = c.on_response(key(1), true, Some(DEST), None, 100);
        assert_eq!(outcome, ResponseOutcome::Apply(DEST));
        assert_eq!(c.status(key(1), Direction::Outbound, 100), Some(TicketStatus::Accepted));
        assert!(c.complete(key(1), 110));
        assert_eq!(c.status(key(1), Direction::Outbound, 110), Some(TicketStatus::Complete));
    }

    #[test]
    fn accept_without_offer_is_unavailable_end_to_end() {
        let mut requester = coord(0);
        let mut target = coord(1);

        let req = requester.request(key(1), 0).unwrap();
        assert_eq!(req.from(), Some(key(0)));
        assert!(target.on_request(key(0), 5));

        let rsp = target.respond(key(0), true, None, 10).unwrap();
        let Message::TeleportRsp { accepted, dest, reason, .. } = rsp else {
            panic!("expected teleport_rsp");
        };
        assert!(!accepted);
        assert_eq!(reason.as_deref(), Some("unavailable"));

        let outcome = requester.on_response(key(1), accepted, dest, reason, 20);
        assert_eq!(outcome, ResponseOutcome::Resolved(TicketStatus::Unavailable));
        let ticket = requester.ticket(key(1), Direction::Outbound, 20).unwrap();
        assert_eq!(ticket.status, TicketStatus::Unavailable);
        assert!(ticket.reason.is_some());
    }

    #[test]
    fn accepted_flag_without_dest_is_unavailable() {
        let mut c = coord(0);
        c.request(key(1), 0).unwrap();
        let outcome = c.on_response(key(1), true, None, None, 1);
        assert_eq!(outcome, ResponseOutcome::Resolved(TicketStatus::Unavailable));
        let t = c.ticket(key(1), Direction::Outbound, 1).unwrap();
        assert_eq!(t.reason.as_deref(), Some(REASON_UNAVAILABLE));
    }

    #[test]
    fn decline_is_rejected() {
        let mut target = coord(1);
        target.on_request(key(0), 0);
        let rsp = target.respond(key(0), false, Some(DEST), 1).unwrap();
        let Message::TeleportRsp { accepted, dest, reason, .. } = rsp else {
            panic!("expected teleport_rsp");
        };
        assert!(!accepted);
        assert!(dest.is_none());
        assert_eq!(reason.as_deref(), Some(REASON_DECLINED));
        assert_eq!(target.status(key(0), Direction::Inbound, 1), Some(TicketStatus::Rejected));

        let mut requester = coord(0);
        requester.request(key(1), 0).unwrap();
        assert_eq!(
            requester.on_response(key(1), false, None, reason, 2),
            ResponseOutcome::Resolved(TicketStatus::Rejected)
        );
    }

    #[test]
    fn accept_with_offer_sends_destination() {
        let mut target = coord(1);
        target.on_request(key(0), 0);
        let rsp = target.respond(key(0), true, Some(DEST), 1).unwrap();
        assert!(matches!(
            rsp,
            Message::TeleportRsp { accepted: true, dest: Some(d), reason: None, .. } if d == DEST
        ));
    }

    #[test]
    fn respond_without_request_fails() {
        let mut target = coord(1);
        assert!(matches!(
            target.respond(key(0), true, None, 0),
            Err(Error::UnknownTicket(_))
        ));
    }

    #[test]
    fn pending_expires_on_read() {
        let mut c = coord(0);
        c.request(key(1), 0).unwrap();
        assert_eq!(c.status(key(1), Direction::Outbound, 44_999), Some(TicketStatus::Pending));
        assert_eq!(c.status(key(1), Direction::Outbound, 45_000), Some(TicketStatus::Expired));
        // A late response does not resurrect it.
        assert_eq!(
            c.on_response(key(1), true, Some(DEST), None, 45_001),
            ResponseOutcome::Ignored
        );
        assert_eq!(c.status(key(1), Direction::Outbound, 45_001), Some(TicketStatus::Expired));
    }

    #[test]
    fn resolved_tickets_are_pruned() {
        let mut c = coord(0);
        c.request(key(1), 0).unwrap();
        c.mark_error(key(1), "unreachable", 10);
        assert_eq!(c.len(), 1);
        c.sweep(60_009);
        assert_eq!(c.len(), 1);
        c.sweep(60_010);
        assert!(c.is_empty());
    }

    #[test]
    fn new_request_allowed_after_terminal_state() {
        let mut c = coord(0);
        c.request(key(1), 0).unwrap();
        c.mark_error(key(1), "unreachable", 1);
        assert!(c.request(key(1), 2).is_ok());
        assert_eq!(c.status(key(1), Direction::Outbound, 2), Some(TicketStatus::Pending));
    }

    #[test]
    fn duplicate_inbound_refreshes() {
        let mut c = coord(1);
        assert!(c.on_request(key(0), 0));
        assert!(!c.on_request(key(0), 40_000));
        // Refreshed ts keeps it pending past the original deadline.
        assert_eq!(c.status(key(0), Direction::Inbound, 50_000), Some(TicketStatus::Pending));
    }

    #[test]
    fn complete_requires_accepted() {
        let mut c = coord(0);
        c.request(key(1), 0).unwrap();
        assert!(!c.complete(key(1), 1));
        c.on_response(key(1), true, Some(DEST), None, 2);
        assert!(c.fail_apply(key(1), 3));
        assert_eq!(c.status(key(1), Direction::Outbound, 3), Some(TicketStatus::Error));
    }
}
