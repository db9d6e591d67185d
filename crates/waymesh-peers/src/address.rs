//! Public keys and overlay addresses.
//!
//! Every peer is identified by its ed25519 public key. Overlay addresses
//! embed that key after an optional identifier:
//!
//! ```text
//! <identifier>.<publicKey>     e.g. pose.3b6a27bc...e1
//! <publicKey>                  bare key, no identifier
//! ```
//!
//! The identifier may itself contain dots (a socket address such as
//! `10.0.0.7:7400` is a valid identifier), so the key is always the final
//! dot-separated segment.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Length of a hex-encoded public key.
pub const KEY_HEX_LEN: usize = 64;

/// A peer's ed25519 public key, the stable identity of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerKey(pub [u8; 32]);

impl PeerKey {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != KEY_HEX_LEN {
            return Err(Error::InvalidKey(s.to_string()));
        }
        let bytes = hex::decode(s).map_err(|_| Error::InvalidKey(s.to_string()))?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::InvalidKey(s.to_string()))?;
        Ok(Self(arr))
    }

    /// Lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short form for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for PeerKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for PeerKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PeerKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// A parsed overlay address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    /// Sub-client identifier, if any.
    pub identifier: Option<String>,
    /// The peer's public key.
    pub key: PeerKey,
}

impl Address {
    /// Build an address from an identifier and key.
    pub fn new(identifier: impl Into<String>, key: PeerKey) -> Self {
        Self {
            identifier: Some(identifier.into()),
            key,
        }
    }

    /// Address made of the bare key.
    pub fn bare(key: PeerKey) -> Self {
        Self {
            identifier: None,
            key,
        }
    }

    /// Parse `<identifier>.<publicKey>` or a bare `<publicKey>`.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        match s.rsplit_once('.') {
            Some((identifier, key)) => {
                if identifier.is_empty() {
                    return Err(Error::InvalidAddress(s.to_string()));
                }
                let key = PeerKey::from_hex(key).map_err(|_| Error::InvalidAddress(s.to_string()))?;
                Ok(Self::new(identifier, key))
            }
            None => {
                let key = PeerKey::from_hex(s).map_err(|_| Error::InvalidAddress(s.to_string()))?;
                Ok(Self::bare(key))
            }
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.identifier {
            Some(id) => write!(f, "{}.{}", id, self.key),
            None => write!(f, "{}", self.key),
        }
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(b: u8) -> PeerKey {
        PeerKey([b; 32])
    }

    #[test]
    fn key_hex_roundtrip() {
        let k = key(0xab);
        assert_eq!(k.to_hex().len(), KEY_HEX_LEN);
        assert_eq!(PeerKey::from_hex(&k.to_hex()).unwrap(), k);
    }

    #[test]
    fn key_rejects_wrong_length_and_non_hex() {
        assert!(PeerKey::from_hex("abcd").is_err());
        assert!(PeerKey::from_hex(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn parse_identifier_address() {
        let k = key(1);
        let addr = Address::parse(&format!("pose.{}", k)).unwrap();
        assert_eq!(addr.identifier.as_deref(), Some("pose"));
        assert_eq!(addr.key, k);
        assert_eq!(addr.to_string(), format!("pose.{}", k));
    }

    #[test]
    fn parse_bare_key() {
        let k = key(2);
        let addr = Address::parse(&k.to_hex()).unwrap();
        assert_eq!(addr.identifier, None);
        assert_eq!(addr.key, k);
    }

    #[test]
    fn identifier_may_contain_dots() {
        let k = key(3);
        let addr = Address::parse(&format!("127.0.0.1:7400.{}", k)).unwrap();
        assert_eq!(addr.identifier.as_deref(), Some("127.0.0.1:7400"));
        assert_eq!(addr.key, k);
    }

    #[test]
    fn malformed_addresses_are_errors() {
        assert!(Address::parse("").is_err());
        assert!(Address::parse("pose.notakey").is_err());
        assert!(Address::parse(&format!(".{}", key(4))).is_err());
    }

    #[test]
    fn key_serializes_as_hex_string() {
        let k = key(9);
        let json = serde_json::to_string(&k).unwrap();
        assert_eq!(json, format!("\"{}\"", k.to_hex()));
        let back: PeerKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, k);
    }
}
