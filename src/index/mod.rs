//! Relational index of published objects: one header row per indexed block
//! with its uncle, transaction, receipt, state and storage rows hanging off
//! it, plus the filter columns the retriever queries.

use crate::{
    chain::{ChainType, Height},
    cid::Cid,
    filter::{FilterError, SubscriptionFilter},
};
use serde_derive::{Deserialize, Serialize};
use std::{collections::BTreeMap, iter, ops::RangeInclusive, sync::Arc};
use thiserror::Error;

pub mod retriever;
pub mod store;

use store::IndexerStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderModel {
    pub chain: ChainType,
    pub height: Height,
    pub hash: String,
    pub parent_hash: String,
    pub timestamp: u64,
    pub cid: Cid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncleModel {
    pub hash: String,
    pub cid: Cid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxModel {
    pub hash: String,
    pub index: u32,
    pub src: Vec<String>,
    pub dst: Vec<String>,
    pub cid: Cid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptModel {
    pub tx_hash: String,
    pub contract: String,
    pub log_contracts: Vec<String>,
    pub topics: [Vec<String>; 4],
    pub cid: Cid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateNodeModel {
    pub key: String,
    pub leaf: bool,
    pub cid: Cid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageNodeModel {
    pub state_key: String,
    pub key: String,
    pub leaf: bool,
    pub cid: Cid,
}

/// Indexed-metadata view of one published block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CidPayload {
    pub header: HeaderModel,
    pub uncles: Vec<UncleModel>,
    pub transactions: Vec<TxModel>,
    pub receipts: Vec<ReceiptModel>,
    pub state_nodes: Vec<StateNodeModel>,
    /// state key -> storage rows beneath it
    pub storage_nodes: BTreeMap<String, Vec<StorageNodeModel>>,
}

impl CidPayload {
    pub fn height(&self) -> Height {
        self.header.height
    }
}

/// CIDs selected from the index for one height
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CidsForFetching {
    pub height: Height,
    pub headers: Vec<HeaderModel>,
    pub uncles: Vec<UncleModel>,
    pub transactions: Vec<TxModel>,
    pub receipts: Vec<ReceiptModel>,
    pub state_nodes: Vec<StateNodeModel>,
    pub storage_nodes: Vec<StorageNodeModel>,
}

impl CidsForFetching {
    pub fn empty(height: Height) -> Self {
        Self {
            height,
            headers: vec![],
            uncles: vec![],
            transactions: vec![],
            receipts: vec![],
            state_nodes: vec![],
            storage_nodes: vec![],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
            && self.uncles.is_empty()
            && self.transactions.is_empty()
            && self.receipts.is_empty()
            && self.state_nodes.is_empty()
            && self.storage_nodes.is_empty()
    }
}

/// Inclusive range of heights missing from the index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    pub start: Height,
    pub stop: Height,
}

impl Gap {
    pub fn num_heights(&self) -> u64 {
        self.stop - self.start + 1
    }

    /// Split into consecutive ranges of at most `batch_size` heights,
    /// produced on demand
    pub fn batches(&self, batch_size: u64) -> impl Iterator<Item = RangeInclusive<Height>> {
        let batch_size = batch_size.max(1);
        let stop = self.stop;
        let mut next = Some(self.start);
        iter::from_fn(move || {
            let start = next.filter(|start| *start <= stop)?;
            let end = stop.min(start.saturating_add(batch_size - 1));
            next = end.checked_add(1);
            Some(start..=end)
        })
    }
}

/// Collects the gaps between indexed heights fed in ascending order
/// (duplicates allowed). With `from_genesis` a first height above zero also
/// leaves `[0, first - 1]` to fill.
#[derive(Debug, Default)]
pub struct GapScanner {
    from_genesis: bool,
    previous: Option<Height>,
    gaps: Vec<Gap>,
}

impl GapScanner {
    pub fn new(from_genesis: bool) -> Self {
        Self {
            from_genesis,
            ..Default::default()
        }
    }

    pub fn push(&mut self, height: Height) {
        match self.previous {
            None if self.from_genesis && height > 0 => self.gaps.push(Gap {
                start: 0,
                stop: height - 1,
            }),
            Some(prev) if height > prev + 1 => self.gaps.push(Gap {
                start: prev + 1,
                stop: height - 1,
            }),
            _ => (),
        }
        self.previous = Some(self.previous.map_or(height, |prev| prev.max(height)));
    }

    pub fn finish(self) -> Vec<Gap> {
        self.gaps
    }
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index database error: {0}")]
    Database(#[from] rocksdb::Error),
    #[error("index row serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{found} payload handed to the {expected} indexer")]
    ChainMismatch {
        expected: ChainType,
        found: ChainType,
    },
    #[error("{0}")]
    Filter(#[from] FilterError),
}

/// Persists a [CidPayload] as one atomic unit
pub trait CidIndexer: Send + Sync {
    fn index(&self, payload: &CidPayload) -> Result<(), IndexError>;
}

/// Queries the index with subscription filters and reports coverage
pub trait CidRetriever: Send + Sync {
    /// CIDs matching `filter` at `height` and whether the selection is empty
    fn retrieve(
        &self,
        filter: &SubscriptionFilter,
        height: Height,
    ) -> Result<(CidsForFetching, bool), IndexError>;

    fn retrieve_first_block_number(&self) -> Result<Option<Height>, IndexError>;

    fn retrieve_last_block_number(&self) -> Result<Option<Height>, IndexError>;

    fn retrieve_gaps_in_data(&self) -> Result<Vec<Gap>, IndexError>;
}

/// Indexer bound to one chain's payloads
#[derive(Debug, Clone)]
pub struct ChainIndexer {
    chain: ChainType,
    store: Arc<IndexerStore>,
}

impl ChainIndexer {
    pub fn new(chain: ChainType, store: Arc<IndexerStore>) -> Self {
        Self { chain, store }
    }
}

impl CidIndexer for ChainIndexer {
    fn index(&self, payload: &CidPayload) -> Result<(), IndexError> {
        if payload.header.chain != self.chain {
            return Err(IndexError::ChainMismatch {
                expected: self.chain,
                found: payload.header.chain,
            });
        }
        self.store.index_payload(payload)
    }
}

pub fn new_cid_indexer(chain: ChainType, store: Arc<IndexerStore>) -> Arc<dyn CidIndexer> {
    Arc::new(ChainIndexer::new(chain, store))
}

pub fn new_cid_retriever(
    chain: ChainType,
    store: Arc<IndexerStore>,
    backfill_from_genesis: bool,
) -> Arc<dyn CidRetriever> {
    Arc::new(retriever::BlockRetriever::new(
        chain,
        store,
        backfill_from_genesis,
    ))
}
