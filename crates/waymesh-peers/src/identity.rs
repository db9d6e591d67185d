//! This node's key-derived identity.

use ed25519_dalek::SigningKey;
use rand::RngCore;

use crate::address::{Address, PeerKey};

/// A 32-byte secret seed, persisted once and reused for the process lifetime.
pub type Seed = [u8; 32];

/// Generate a fresh random seed.
pub fn generate_seed() -> Seed {
    let mut seed = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut seed);
    seed
}

/// Identity of the local node. Immutable once created.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    key: PeerKey,
    address: Address,
}

impl NodeIdentity {
    /// Derive the identity from a persisted seed.
    ///
    /// The public key is the ed25519 verifying key of the seed; the overlay
    /// address is `<identifier>.<publicKey>`.
    pub fn from_seed(seed: &Seed, identifier: &str) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let key = PeerKey(signing_key.verifying_key().to_bytes());
        let address = if identifier.is_empty() {
            Address::bare(key)
        } else {
            Address::new(identifier, key)
        };
        Self { key, address }
    }

    /// Public key of this node.
    pub fn key(&self) -> PeerKey {
        self.key
    }

    /// Overlay address of this node.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Whether `key` is this node.
    pub fn is_self(&self, key: &PeerKey) -> bool {
        self.key == *key
    }
}
