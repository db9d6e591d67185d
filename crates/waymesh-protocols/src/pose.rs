//! Pose snapshots, the send gate, and geo-referenced height recovery.
//!
//! # Gating
//!
//! A local pose tick goes out only if it passes two gates:
//!
//! 1. **Rate**: at most one send per `min_interval_ms` (~30 Hz). A jump event
//!    bypasses this gate.
//! 2. **Change**: position moved more than `position_epsilon`, orientation
//!    turned more than `angle_epsilon_rad`, crouch flipped, or the XR head
//!    state moved beyond its own epsilons. A jump event always passes.
//!
//! A rejected tick is simply dropped.
//!
//! # Vertical placement
//!
//! Peers may sample different terrain, so a receiver never trusts the raw
//! world Y. Snapshots carry `{lat, lon, ground, eye}`: the sender's ground
//! height and pose height in its own frame. The receiver rebuilds
//! `local_ground(lat, lon) + (eye - ground)`.

use serde::{Deserialize, Serialize};

/// Head state reported by an XR device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct XrHeadState {
    pub yaw: f64,
    pub pitch: f64,
    pub roll: f64,
    pub height: f64,
}

/// Geo reference attached to a pose.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoRef {
    pub lat: f64,
    pub lon: f64,
    /// Sender's terrain height under the pose, in the sender's frame.
    pub ground: f64,
    /// Sender's pose height, in the same frame as `ground`.
    pub eye: f64,
}

impl GeoRef {
    /// Height of the pose above the sender's terrain.
    pub fn offset(&self) -> f64 {
        self.eye - self.ground
    }
}

/// Quaternion for a rotation of `yaw` radians about the vertical axis, `[x, y, z, w]`.
pub fn yaw_quat(yaw: f64) -> [f64; 4] {
    let half = yaw * 0.5;
    [0.0, half.sin(), 0.0, half.cos()]
}

/// Angle in radians between two unit quaternions.
pub fn quat_angle(a: &[f64; 4], b: &[f64; 4]) -> f64 {
    let dot = a.iter().zip(b).map(|(x, y)| x * y).sum::<f64>().abs().min(1.0);
    2.0 * dot.acos()
}

fn distance(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

/// A timestamped local pose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseSnapshot {
    pub position: [f64; 3],
    pub orientation: [f64; 4],
    pub crouch: bool,
    pub jump_event: bool,
    pub xr: Option<XrHeadState>,
    pub geo: Option<GeoRef>,
    pub timestamp: u64,
}

/// Extra inputs to a pose tick.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PoseExtras {
    pub xr: Option<XrHeadState>,
    /// Geographic position of the pose, when the host knows it.
    pub lat_lon: Option<(f64, f64)>,
}

impl PoseSnapshot {
    /// Build a snapshot from a pose tick.
    ///
    /// A geo reference is attached only when both the geographic position and
    /// the ground height are known; otherwise receivers fall back to raw Y.
    pub fn from_tick(
        position: [f64; 3],
        orientation: [f64; 4],
        ground_override: Option<f64>,
        jump_event: bool,
        crouch: bool,
        extras: PoseExtras,
        timestamp: u64,
    ) -> Self {
        let geo = match (extras.lat_lon, ground_override) {
            (Some((lat, lon)), Some(ground)) => Some(GeoRef {
                lat,
                lon,
                ground,
                eye: position[1],
            }),
            _ => None,
        };
        Self {
            position,
            orientation,
            crouch,
            jump_event,
            xr: extras.xr,
            geo,
            timestamp,
        }
    }
}

/// Compact wire form of a pose: `{p, q, j, c, xr?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseWire {
    pub p: [f64; 3],
    pub q: [f64; 4],
    #[serde(default)]
    pub j: bool,
    #[serde(default)]
    pub c: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xr: Option<XrHeadState>,
}

impl From<&PoseSnapshot> for PoseWire {
    fn from(s: &PoseSnapshot) -> Self {
        Self {
            p: s.position,
            q: s.orientation,
            j: s.jump_event,
            c: s.crouch,
            xr: s.xr,
        }
    }
}

impl PoseWire {
    /// Whether every number is finite.
    pub fn is_finite(&self) -> bool {
        let xr_ok = self.xr.map_or(true, |x| {
            [x.yaw, x.pitch, x.roll, x.height].iter().all(|v| v.is_finite())
        });
        self.p.iter().chain(self.q.iter()).all(|v| v.is_finite()) && xr_ok
    }
}

/// Receiver-side height for a remote pose.
///
/// With a geo reference and a local terrain sample, the height is rebuilt on
/// local terrain; otherwise the transmitted Y is used as-is.
pub fn resolve_height(wire_y: f64, geo: Option<&GeoRef>, local_ground: Option<f64>) -> f64 {
    match (geo, local_ground) {
        (Some(geo), Some(ground)) if ground.is_finite() => ground + geo.offset(),
        _ => wire_y,
    }
}

/// Thresholds for the pose gate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseGateConfig {
    pub min_interval_ms: u64,
    /// Metres.
    pub position_epsilon: f64,
    /// Radians.
    pub angle_epsilon_rad: f64,
    /// Radians, per XR axis.
    pub xr_angle_epsilon_rad: f64,
    /// Metres.
    pub xr_height_epsilon: f64,
}

impl Default for PoseGateConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 33,
            position_epsilon: 0.0015,
            angle_epsilon_rad: 0.35_f64.to_radians(),
            xr_angle_epsilon_rad: 0.35_f64.to_radians(),
            xr_height_epsilon: 0.0015,
        }
    }
}

/// Outcome of a gate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Send,
    RateLimited,
    Unchanged,
}

/// Rate- and delta-gate for outgoing poses.
#[derive(Debug, Clone)]
pub struct PoseGate {
    config: PoseGateConfig,
    last_sent_at: Option<u64>,
    baseline: Option<PoseSnapshot>,
}

impl PoseGate {
    pub fn new(config: PoseGateConfig) -> Self {
        Self {
            config,
            last_sent_at: None,
            baseline: None,
        }
    }

    pub fn config(&self) -> &PoseGateConfig {
        &self.config
    }

    /// Last committed pose.
    pub fn baseline(&self) -> Option<&PoseSnapshot> {
        self.baseline.as_ref()
    }

    /// Check a candidate without committing it.
    pub fn check(&self, candidate: &PoseSnapshot, now: u64) -> GateDecision {
        if candidate.jump_event {
            return GateDecision::Send;
        }
        if let Some(last) = self.last_sent_at {
            if now.saturating_sub(last) < self.config.min_interval_ms {
                return GateDecision::RateLimited;
            }
        }
        match &self.baseline {
            Some(base) if !self.changed(base, candidate) => GateDecision::Unchanged,
            _ => GateDecision::Send,
        }
    }

    /// Record `pose` as sent at `now`.
    pub fn commit(&mut self, pose: PoseSnapshot, now: u64) {
        self.last_sent_at = Some(now);
        self.baseline = Some(pose);
    }

    /// Check and, on `Send`, commit.
    ///
    /// The commit happens regardless of how many peers the caller then
    /// reaches, including none: after a silent period the change baseline is
    /// the last pose that passed the gate, not the last one delivered.
    pub fn evaluate(&mut self, candidate: &PoseSnapshot, now: u64) -> GateDecision {
        let decision = self.check(candidate, now);
        if decision == GateDecision::Send {
            self.commit(candidate.clone(), now);
        }
        decision
    }

    fn changed(&self, base: &PoseSnapshot, next: &PoseSnapshot) -> bool {
        let c = &self.config;
        if distance(&base.position, &next.position) > c.position_epsilon {
            return true;
        }
        if quat_angle(&base.orientation, &next.orientation) > c.angle_epsilon_rad {
            return true;
        }
        if base.crouch != next.crouch {
            return true;
        }
        match (&base.xr, &next.xr) {
            (None, None) => false,
            (Some(a), Some(b)) => {
                angle_delta(a.yaw, b.yaw) > c.xr_angle_epsilon_rad
                    || angle_delta(a.pitch, b.pitch) > c.xr_angle_epsilon_rad
                    || angle_delta(a.roll, b.roll) > c.xr_angle_epsilon_rad
                    || (a.height - b.height).abs() > c.xr_height_epsilon
            }
            _ => true,
        }
    }
}

/// Smallest absolute difference between two angles in radians.
fn angle_delta(a: f64, b: f64) -> f64 {
    use std::f64::consts::{PI, TAU};
    ((b - a + PI).rem_euclid(TAU) - PI).abs()
}

impl Default for PoseGate {
    fn default() -> Self {
        Self::new(PoseGateConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pose(x: f64, yaw: f64) -> PoseSnapshot {
        PoseSnapshot::from_tick(
            [x, 1.7, 0.0],
            yaw_quat(yaw),
            None,
            false,
            false,
            PoseExtras::default(),
            0,
        )
    }

    #[test]
    fn two_mm_move_propagates() {
        let mut gate = PoseGate::default();
        assert_eq!(gate.evaluate(&pose(0.0, 0.0), 0), GateDecision::Send);
        assert_eq!(gate.evaluate(&pose(0.002, 0.0), 100), GateDecision::Send);
    }

    #[test]
    fn one_mm_move_is_suppressed() {
        let mut gate = PoseGate::default();
        gate.evaluate(&pose(0.0, 0.0), 0);
        assert_eq!(gate.evaluate(&pose(0.001, 0.0), 100), GateDecision::Unchanged);
    }

    #[test]
    fn small_turn_suppressed_large_turn_sent() {
        let mut gate = PoseGate::default();
        gate.evaluate(&pose(0.0, 0.0), 0);
        assert_eq!(gate.evaluate(&pose(0.0, 0.005), 100), GateDecision::Unchanged);
        assert_eq!(gate.evaluate(&pose(0.0, 0.01), 200), GateDecision::Send);
    }

    #[test]
    fn rate_gate_blocks_within_interval() {
        let mut gate = PoseGate::default();
        gate.evaluate(&pose(0.0, 0.0), 1_000);
        assert_eq!(gate.evaluate(&pose(1.0, 0.0), 1_020), GateDecision::RateLimited);
        assert_eq!(gate.evaluate(&pose(1.0, 0.0), 1_033), GateDecision::Send);
    }

    #[test]
    fn jump_bypasses_both_gates() {
        let mut gate = PoseGate::default();
        gate.evaluate(&pose(0.0, 0.0), 1_000);
        let mut jump = pose(0.0, 0.0);
        jump.jump_event = true;
        assert_eq!(gate.evaluate(&jump, 1_001), GateDecision::Send);
    }

    #[test]
    fn crouch_flip_is_a_change() {
        let mut gate = PoseGate::default();
        gate.evaluate(&pose(0.0, 0.0), 0);
        let mut crouched = pose(0.0, 0.0);
        crouched.crouch = true;
        assert_eq!(gate.evaluate(&crouched, 100), GateDecision::Send);
    }

    #[test]
    fn xr_changes_use_own_epsilon() {
        let mut gate = PoseGate::default();
        let head = XrHeadState { yaw: 0.0, pitch: 0.0, roll: 0.0, height: 1.6 };
        let mut a = pose(0.0, 0.0);
        a.xr = Some(head);
        gate.evaluate(&a, 0);

        let mut tiny = a.clone();
        tiny.xr = Some(XrHeadState { height: 1.601, ..head });
        assert_eq!(gate.evaluate(&tiny, 100), GateDecision::Unchanged);

        let mut tilt = a.clone();
        tilt.xr = Some(XrHeadState { pitch: 0.02, ..head });
        assert_eq!(gate.evaluate(&tilt, 200), GateDecision::Send);
    }

    #[test]
    fn xr_yaw_wraps_around() {
        let mut gate = PoseGate::default();
        let head = XrHeadState { yaw: 359.9_f64.to_radians(), pitch: 0.0, roll: 0.0, height: 1.6 };
        let mut a = pose(0.0, 0.0);
        a.xr = Some(head);
        gate.evaluate(&a, 0);

        let mut across = a.clone();
        across.xr = Some(XrHeadState { yaw: 0.1_f64.to_radians(), ..head });
        assert_eq!(gate.evaluate(&across, 100), GateDecision::Unchanged);

        let mut turned = a.clone();
        turned.xr = Some(XrHeadState { yaw: 1.0_f64.to_radians(), ..head });
        assert_eq!(gate.evaluate(&turned, 200), GateDecision::Send);
    }

    #[test]
    fn geo_needs_ground() {
        let extras = PoseExtras { xr: None, lat_lon: Some((48.1, 11.5)) };
        let without = PoseSnapshot::from_tick([0.0, 3.0, 0.0], yaw_quat(0.0), None, false, false, extras, 0);
        assert!(without.geo.is_none());
        let with = PoseSnapshot::from_tick([0.0, 3.0, 0.0], yaw_quat(0.0), Some(1.4), false, false, extras, 0);
        let geo = with.geo.unwrap();
        assert_eq!(geo.eye, 3.0);
        assert!((geo.offset() - 1.6).abs() < 1e-9);
    }

    #[test]
    fn height_rebuilt_on_local_terrain() {
        let geo = GeoRef { lat: 0.0, lon: 0.0, ground: 100.0, eye: 101.7 };
        let y = resolve_height(101.7, Some(&geo), Some(40.0));
        assert!((y - 41.7).abs() < 1e-9);
        assert_eq!(resolve_height(101.7, Some(&geo), None), 101.7);
        assert_eq!(resolve_height(5.0, None, Some(40.0)), 5.0);
    }

    #[test]
    fn wire_rejects_non_finite() {
        let mut w = PoseWire::from(&pose(0.0, 0.0));
        assert!(w.is_finite());
        w.p[0] = f64::NAN;
        assert!(!w.is_finite());
    }

    proptest! {
        #[test]
        fn at_most_one_send_per_window(ticks in proptest::collection::vec((0u64..10, -1.0f64..1.0), 1..200)) {
            let mut gate = PoseGate::default();
            let mut now = 0u64;
            let mut sends = Vec::new();
            for (dt, x) in ticks {
                now += dt;
                if gate.evaluate(&pose(x, 0.0), now) == GateDecision::Send {
                    sends.push(now);
                }
            }
            for pair in sends.windows(2) {
                prop_assert!(pair[1] - pair[0] >= 33);
            }
        }

        #[test]
        fn sub_epsilon_jitter_never_sends(jitter in proptest::collection::vec(-0.0007f64..0.0007, 1..50)) {
            let mut gate = PoseGate::default();
            gate.evaluate(&pose(0.0, 0.0), 0);
            let mut now = 0;
            for j in jitter {
                now += 50;
                prop_assert_eq!(gate.evaluate(&pose(j, 0.0), now), GateDecision::Unchanged);
            }
        }
    }
}
