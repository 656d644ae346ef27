use crate::{
    chain::ChainType,
    cid::Cid,
    content_store::{ContentStore, ContentStoreError},
    index::{
        CidPayload, HeaderModel, ReceiptModel, StateNodeModel, StorageNodeModel, TxModel,
        UncleModel,
    },
    payload::ConvertedData,
};
use std::{collections::BTreeMap, sync::Arc};
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("unable to write {object} to the content store: {source}")]
    Store {
        object: &'static str,
        #[source]
        source: ContentStoreError,
    },
    #[error("content store returned {returned} for {object} with content id {computed}")]
    CidMismatch {
        object: &'static str,
        computed: Cid,
        returned: Cid,
    },
    #[error("{found} payload handed to the {expected} publisher")]
    ChainMismatch {
        expected: ChainType,
        found: ChainType,
    },
}

/// Writes every object of a [ConvertedData] into the content store and
/// returns the indexed-metadata view of what was written
pub trait IpldPublisher: Send + Sync {
    fn publish(&self, payload: &ConvertedData) -> Result<CidPayload, PublishError>;
}

pub fn new_publisher(chain: ChainType, store: Arc<dyn ContentStore>) -> Arc<dyn IpldPublisher> {
    Arc::new(BlockPublisher::new(chain, store))
}

#[derive(Debug, Clone)]
pub struct BlockPublisher {
    chain: ChainType,
    store: Arc<dyn ContentStore>,
}

impl BlockPublisher {
    pub fn new(chain: ChainType, store: Arc<dyn ContentStore>) -> Self {
        Self { chain, store }
    }

    fn put(&self, object: &'static str, bytes: &[u8]) -> Result<Cid, PublishError> {
        let computed = Cid::of(bytes);
        let returned = self
            .store
            .put(bytes)
            .map_err(|source| PublishError::Store { object, source })?;
        if returned != computed {
            return Err(PublishError::CidMismatch {
                object,
                computed,
                returned,
            });
        }
        Ok(returned)
    }
}

impl IpldPublisher for BlockPublisher {
    fn publish(&self, payload: &ConvertedData) -> Result<CidPayload, PublishError> {
        if payload.chain != self.chain {
            return Err(PublishError::ChainMismatch {
                expected: self.chain,
                found: payload.chain,
            });
        }
        trace!(
            "Publishing block with height {} and hash {}",
            payload.height(),
            payload.header.hash
        );

        let header = HeaderModel {
            chain: payload.chain,
            height: payload.header.height,
            hash: payload.header.hash.clone(),
            parent_hash: payload.header.parent_hash.clone(),
            timestamp: payload.header.timestamp,
            cid: self.put("header", &payload.header.raw)?,
        };

        let mut uncles = Vec::with_capacity(payload.uncles.len());
        for uncle in &payload.uncles {
            uncles.push(UncleModel {
                hash: uncle.hash.clone(),
                cid: self.put("uncle", &uncle.raw)?,
            });
        }

        let mut transactions = Vec::with_capacity(payload.transactions.len());
        for tx in &payload.transactions {
            transactions.push(TxModel {
                hash: tx.hash.clone(),
                index: tx.index,
                src: tx.src.clone(),
                dst: tx.dst.clone(),
                cid: self.put("transaction", &tx.raw)?,
            });
        }

        let mut receipts = Vec::with_capacity(payload.receipts.len());
        for rct in &payload.receipts {
            receipts.push(ReceiptModel {
                tx_hash: rct.tx_hash.clone(),
                contract: rct.contract.clone(),
                log_contracts: rct.log_contracts.clone(),
                topics: rct.topics.clone(),
                cid: self.put("receipt", &rct.raw)?,
            });
        }

        let mut state_nodes = Vec::with_capacity(payload.state_nodes.len());
        for node in &payload.state_nodes {
            state_nodes.push(StateNodeModel {
                key: node.key.clone(),
                leaf: node.leaf,
                cid: self.put("state node", &node.raw)?,
            });
        }

        let mut storage_nodes: BTreeMap<String, Vec<StorageNodeModel>> = BTreeMap::new();
        for node in &payload.storage_nodes {
            let model = StorageNodeModel {
                state_key: node.state_key.clone(),
                key: node.key.clone(),
                leaf: node.leaf,
                cid: self.put("storage node", &node.raw)?,
            };
            storage_nodes
                .entry(node.state_key.clone())
                .or_default()
                .push(model);
        }

        Ok(CidPayload {
            header,
            uncles,
            transactions,
            receipts,
            state_nodes,
            storage_nodes,
        })
    }
}
