//! Local pose fan-out and remote pose intake.

use tracing::trace;
use waymesh_peers::PeerKey;
use waymesh_protocols::{GateDecision, GeoRef, Message, PoseSnapshot, PoseWire};

use super::state::{Effects, MeshState, RemotePose, Sender};

impl MeshState {
    /// Gate a local pose tick and, if it passes, send it to every online peer.
    ///
    /// The gate baseline advances even when nobody is online.
    pub fn local_pose(&mut self, snapshot: PoseSnapshot, now: u64) -> (GateDecision, Effects) {
        let mut fx = Effects::default();
        let decision = self.gate.evaluate(&snapshot, now);
        if decision != GateDecision::Send {
            return (decision, fx);
        }
        let msg = self.pose_message(&snapshot);
        self.last_pose = Some(snapshot);
        for key in self.registry.online_peers(now, self.config.online_window_ms) {
            fx.outbound.push(self.to_peer(key, msg.clone()));
        }
        (decision, fx)
    }

    pub(super) fn pose_message(&self, snapshot: &PoseSnapshot) -> Message {
        Message::Pose {
            from: self.key(),
            ts: snapshot.timestamp,
            pose: PoseWire::from(snapshot),
            geo: snapshot.geo,
        }
    }

    pub(super) fn on_pose(
        &mut self,
        sender: &Sender,
        ts: u64,
        pose: PoseWire,
        geo: Option<GeoRef>,
        now: u64,
        fx: &mut Effects,
    ) {
        self.touch(sender, ts, now);
        let remote = self.remote.entry(sender.key).or_default();
        if remote.last_pose_ts.is_some_and(|last| ts < last) {
            trace!(peer = %sender.key.short(), ts, "stale pose");
            return;
        }
        remote.last_pose_ts = Some(ts);
        if geo.is_some() {
            remote.geo = geo;
        }
        fx.poses.push(RemotePose {
            key: sender.key,
            ts,
            pose,
            geo,
        });
    }

    /// Last geo reference a peer sent.
    pub fn remote_geo(&self, key: &PeerKey) -> Option<GeoRef> {
        self.remote.get(key).and_then(|r| r.geo)
    }
}
