//! The wire envelope.
//!
//! Every overlay payload is one JSON object tagged by `type`:
//!
//! | type           | fields                                          |
//! |----------------|-------------------------------------------------|
//! | `hello`        | from, alias?, ts                                |
//! | `hb` / `hb_ack`| from, t_client                                  |
//! | `peers_req`    | from, ts                                        |
//! | `peers`        | from?, items[]                                  |
//! | `alias`        | from, alias                                     |
//! | `pose`         | from, ts, pose{p,q,j,c,xr?}, geo?               |
//! | `teleport_req` | from, to, ts                                    |
//! | `teleport_rsp` | from, to, ts, accepted, dest?, reason?          |
//! | `relay`        | from, to, payload                               |
//!
//! `relay` wraps any other message for one hop through the well-known relay,
//! which unwraps it and forwards `payload` to `to`.

use serde::{Deserialize, Serialize};
use waymesh_peers::{PeerKey, RosterEntry};

use crate::error::{Error, Result};
use crate::handshake::Destination;
use crate::pose::{GeoRef, PoseWire};

/// Largest payload accepted by [`Message::decode`].
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Hello {
        from: PeerKey,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alias: Option<String>,
        ts: u64,
    },
    Hb {
        from: PeerKey,
        t_client: u64,
    },
    HbAck {
        from: PeerKey,
        t_client: u64,
    },
    PeersReq {
        from: PeerKey,
        #[serde(default)]
        ts: u64,
    },
    Peers {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<PeerKey>,
        #[serde(default)]
        items: Vec<RosterEntry>,
    },
    Alias {
        from: PeerKey,
        #[serde(default)]
        alias: String,
    },
    Pose {
        from: PeerKey,
        ts: u64,
        pose: PoseWire,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        geo: Option<GeoRef>,
    },
    TeleportReq {
        from: PeerKey,
        to: PeerKey,
        ts: u64,
    },
    TeleportRsp {
        from: PeerKey,
        to: PeerKey,
        ts: u64,
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dest: Option<Destination>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Relay {
        from: PeerKey,
        to: PeerKey,
        payload: Box<Message>,
    },
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a payload. Oversized, non-JSON, or unknown-type payloads are
    /// [`Error::Malformed`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_MESSAGE_BYTES {
            return Err(Error::Malformed(format!(
                "payload of {} bytes exceeds {}",
                bytes.len(),
                MAX_MESSAGE_BYTES
            )));
        }
        let msg: Message =
            serde_json::from_slice(bytes).map_err(|e| Error::Malformed(e.to_string()))?;
        if let Message::Pose { pose, .. } = &msg {
            if !pose.is_finite() {
                return Err(Error::Malformed("non-finite pose".into()));
            }
        }
        if let Message::Relay { payload, .. } = &msg {
            if matches!(**payload, Message::Relay { .. }) {
                return Err(Error::Malformed("nested relay".into()));
            }
        }
        Ok(msg)
    }

    /// Wrap for delivery through the relay.
    pub fn relayed(self, from: PeerKey, to: PeerKey) -> Self {
        match self {
            Message::Relay { .. } => self,
            other => Message::Relay {
                from,
                to,
                payload: Box::new(other),
            },
        }
    }

    /// The `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "hello",
            Message::Hb { .. } => "hb",
            Message::HbAck { .. } => "hb_ack",
            Message::PeersReq { .. } => "peers_req",
            Message::Peers { .. } => "peers",
            Message::Alias { .. } => "alias",
            Message::Pose { .. } => "pose",
            Message::TeleportReq { .. } => "teleport_req",
            Message::TeleportRsp { .. } => "teleport_rsp",
            Message::Relay { .. } => "relay",
        }
    }

    /// Claimed sender, if the message carries one.
    pub fn from(&self) -> Option<PeerKey> {
        match self {
            Message::Hello { from, .. }
            | Message::Hb { from, .. }
            | Message::HbAck { from, .. }
            | Message::PeersReq { from, .. }
            | Message::Alias { from, .. }
            | Message::Pose { from, .. }
            | Message::TeleportReq { from, .. }
            | Message::TeleportRsp { from, .. }
            | Message::Relay { from, .. } => Some(*from),
            Message::Peers { from, .. } => *from,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::{yaw_quat, XrHeadState};

    fn key(b: u8) -> PeerKey {
        PeerKey([b; 32])
    }

    #[test]
    fn tags_are_snake_case() {
        let json = String::from_utf8(
            Message::HbAck { from: key(1), t_client: 7 }.encode().unwrap(),
        )
        .unwrap();
        assert!(json.contains(r#""type":"hb_ack""#));
        assert!(json.contains(r#""t_client":7"#));

        let json = String::from_utf8(
            Message::TeleportReq { from: key(1), to: key(2), ts: 3 }.encode().unwrap(),
        )
        .unwrap();
        assert!(json.contains(r#""type":"teleport_req""#));
    }

    #[test]
    fn decodes_hand_written_hello() {
        let raw = format!(r#"{{"type":"hello","from":"{}","ts":12}}"#, key(3));
        let msg = Message::decode(raw.as_bytes()).unwrap();
        assert_eq!(msg, Message::Hello { from: key(3), alias: None, ts: 12 });
        assert_eq!(msg.kind(), "hello");
        assert_eq!(msg.from(), Some(key(3)));
    }

    #[test]
    fn decodes_peers_without_from() {
        let raw = format!(
            r#"{{"type":"peers","items":[{{"pub":"{}","ids":["pose"],"lastSeen":5}}]}}"#,
            key(4)
        );
        let Message::Peers { from, items } = Message::decode(raw.as_bytes()).unwrap() else {
            panic!("expected peers");
        };
        assert!(from.is_none());
        assert_eq!(items[0].key, key(4));
        assert_eq!(items[0].last_seen, 5);
    }

    #[test]
    fn pose_wire_shape() {
        let msg = Message::Pose {
            from: key(1),
            ts: 9,
            pose: PoseWire {
                p: [1.0, 2.0, 3.0],
                q: yaw_quat(0.0),
                j: false,
                c: true,
                xr: Some(XrHeadState { yaw: 0.1, pitch: 0.0, roll: 0.0, height: 1.6 }),
            },
            geo: Some(GeoRef { lat: 1.0, lon: 2.0, ground: 0.5, eye: 2.0 }),
        };
        let value: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["pose"]["c"], true);
        assert_eq!(value["geo"]["eye"], 2.0);
        assert_eq!(Message::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn garbage_is_malformed() {
        for raw in [&b"not json"[..], br#"{"type":"warp","from":"00"}"#, br#"{"type":"hb"}"#] {
            assert!(matches!(Message::decode(raw), Err(Error::Malformed(_))));
        }
    }

    #[test]
    fn oversized_is_malformed() {
        let big = vec![b' '; MAX_MESSAGE_BYTES + 1];
        assert!(matches!(Message::decode(&big), Err(Error::Malformed(_))));
    }

    #[test]
    fn relay_wraps_once() {
        let inner = Message::Hb { from: key(1), t_client: 4 };
        let wrapped = inner.clone().relayed(key(1), key(2));
        assert_eq!(wrapped.kind(), "relay");
        assert_eq!(wrapped.clone().relayed(key(1), key(3)), wrapped);
        let decoded = Message::decode(&wrapped.encode().unwrap()).unwrap();
        let Message::Relay { to, payload, .. } = decoded else {
            panic!("expected relay");
        };
        assert_eq!(to, key(2));
        assert_eq!(*payload, inner);
    }

    #[test]
    fn nested_relay_is_malformed() {
        let inner = Message::Relay {
            from: key(1),
            to: key(2),
            payload: Box::new(Message::Hb { from: key(1), t_client: 0 }),
        };
        let nested = Message::Relay { from: key(1), to: key(3), payload: Box::new(inner) };
        assert!(matches!(
            Message::decode(&nested.encode().unwrap()),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn bad_key_is_malformed() {
        let raw = br#"{"type":"hb","from":"abc","t_client":1}"#;
        assert!(matches!(Message::decode(raw), Err(Error::Malformed(_))));
    }
}
