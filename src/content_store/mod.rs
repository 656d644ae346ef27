use crate::cid::Cid;
use std::{collections::HashMap, fmt::Debug, sync::RwLock};
use thiserror::Error;
use tracing::trace;

pub mod rocks;

#[derive(Debug, Error)]
pub enum ContentStoreError {
    #[error("content store database error: {0}")]
    Database(#[from] rocksdb::Error),
    #[error("content store lock poisoned")]
    Poisoned,
}

/// Opaque content-addressed key/value store.
///
/// `put` of bytes that are already present is a successful no-op returning the
/// same [Cid], which lets live sync and back-fill publish the same height
/// concurrently.
pub trait ContentStore: Send + Sync + Debug {
    fn put(&self, bytes: &[u8]) -> Result<Cid, ContentStoreError>;

    fn get(&self, cid: &Cid) -> Result<Option<Vec<u8>>, ContentStoreError>;

    /// Number of distinct objects held
    fn len(&self) -> Result<usize, ContentStoreError>;

    fn is_empty(&self) -> Result<bool, ContentStoreError> {
        Ok(self.len()? == 0)
    }
}

#[derive(Debug, Default)]
pub struct MemoryContentStore {
    blocks: RwLock<HashMap<Cid, Vec<u8>>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ContentStore for MemoryContentStore {
    fn put(&self, bytes: &[u8]) -> Result<Cid, ContentStoreError> {
        let cid = Cid::of(bytes);
        let mut blocks = self
            .blocks
            .write()
            .map_err(|_| ContentStoreError::Poisoned)?;
        if !blocks.contains_key(&cid) {
            trace!("Putting {} bytes at {cid}", bytes.len());
            blocks.insert(cid.clone(), bytes.to_vec());
        }
        Ok(cid)
    }

    fn get(&self, cid: &Cid) -> Result<Option<Vec<u8>>, ContentStoreError> {
        let blocks = self.blocks.read().map_err(|_| ContentStoreError::Poisoned)?;
        Ok(blocks.get(cid).cloned())
    }

    fn len(&self) -> Result<usize, ContentStoreError> {
        let blocks = self.blocks.read().map_err(|_| ContentStoreError::Poisoned)?;
        Ok(blocks.len())
    }
}
