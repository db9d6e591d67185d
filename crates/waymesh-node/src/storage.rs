//! Persistent storage using RocksDB.
//!
//! Two keys matter: the identity seed and the serialized address book.

use crate::error::{Error, Result};
use rocksdb::{Options, DB};
use std::path::Path;
use tracing::info;
use waymesh_peers::{generate_seed, BookStore, Seed};

const SEED_KEY: &[u8] = b"node:seed";
const BOOK_KEY: &[u8] = b"book:snapshot";

/// Storage backend for node state.
pub struct Storage {
    db: DB,
}

impl Storage {
    /// Open or create storage at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)?;
        Ok(Self { db })
    }

    // --- Node Identity ---

    /// Get or create the node's identity seed.
    pub fn get_or_create_seed(&self) -> Result<Seed> {
        if let Some(data) = self.db.get(SEED_KEY)? {
            let seed: Seed = data
                .as_slice()
                .try_into()
                .map_err(|_| Error::Storage("Invalid stored seed".into()))?;
            return Ok(seed);
        }
        let seed = generate_seed();
        self.db.put(SEED_KEY, seed)?;
        info!("Generated new node identity seed");
        Ok(seed)
    }

    // --- Address Book ---

    /// Raw address book document.
    pub fn get_book(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(BOOK_KEY)?)
    }

    /// Replace the address book document.
    pub fn put_book(&self, bytes: &[u8]) -> Result<()> {
        self.db.put(BOOK_KEY, bytes)?;
        Ok(())
    }
}

impl BookStore for Storage {
    fn load_book(&self) -> waymesh_peers::Result<Option<Vec<u8>>> {
        self.get_book()
            .map_err(|e| waymesh_peers::Error::Store(e.to_string()))
    }

    fn save_book(&self, bytes: &[u8]) -> waymesh_peers::Result<()> {
        self.put_book(bytes)
            .map_err(|e| waymesh_peers::Error::Store(e.to_string()))
    }
}
