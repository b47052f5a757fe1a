use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Db, Tree};
use thiserror::Error;

use crate::script::Txid;
use crate::types::Location;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Cache lock poisoned")]
    Poisoned,
}

/// Cache key of a record state at `location`.
pub fn jig_key(location: &Location) -> String {
    format!("jig://{}", location)
}

/// Cache key of a raw transaction.
pub fn tx_key(txid: &Txid) -> String {
    format!("tx://{}", txid)
}

/// Key-value state cache shared with the runtime. Values are JSON.
pub trait StateCache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    fn apply_batch(&self, batch: StorageBatch) -> Result<(), StorageError>;
}

pub struct StorageBatch {
    pub ops: Vec<StorageOperation>,
}

pub enum StorageOperation {
    Put(String, Vec<u8>),
}

impl StorageBatch {
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    pub fn put_json<T: Serialize>(&mut self, key: String, value: &T) -> Result<(), StorageError> {
        self.ops.push(StorageOperation::Put(key, serde_json::to_vec(value)?));
        Ok(())
    }

    pub fn put(&mut self, key: String, value: Vec<u8>) {
        self.ops.push(StorageOperation::Put(key, value));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl Default for StorageBatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Decodes a JSON cache entry.
pub fn get_json<T: DeserializeOwned>(
    cache: &dyn StateCache,
    key: &str,
) -> Result<Option<T>, StorageError> {
    let encoded = cache.get(key)?;
    Ok(encoded.map(|e| serde_json::from_slice(&e)).transpose()?)
}

pub struct SledCache {
    db: Db,
    state_tree: Tree,
}

impl SledCache {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// A cache that is removed when dropped.
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self, StorageError> {
        Ok(Self {
            state_tree: db.open_tree("state")?,
            db,
        })
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

impl StateCache for SledCache {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let encoded = self.state_tree.get(key)?;
        Ok(encoded.map(|e| e.to_vec()))
    }

    fn apply_batch(&self, batch: StorageBatch) -> Result<(), StorageError> {
        let mut tree_batch = sled::Batch::default();
        for op in batch.ops {
            match op {
                StorageOperation::Put(key, value) => tree_batch.insert(key.as_bytes(), value),
            }
        }
        self.state_tree.apply_batch(tree_batch)?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map_or(0, |entries| entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateCache for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let entries = self.entries.read().map_err(|_| StorageError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn apply_batch(&self, batch: StorageBatch) -> Result<(), StorageError> {
        let mut entries = self.entries.write().map_err(|_| StorageError::Poisoned)?;
        for op in batch.ops {
            match op {
                StorageOperation::Put(key, value) => {
                    entries.insert(key, value);
                }
            }
        }
        Ok(())
    }
}
