use super::{FilterError, SubscriptionFilter};
use crate::{
    chain::{ChainType, Height},
    cid::Cid,
    payload::ConvertedData,
};
use serde_derive::{Deserialize, Serialize};
use std::{collections::HashSet, sync::Arc};

/// One content-addressed object as it is delivered to subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipld {
    pub cid: Cid,
    pub data: Vec<u8>,
}

impl Ipld {
    pub fn new(data: &[u8]) -> Self {
        Self {
            cid: Cid::of(data),
            data: data.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateNodeIpld {
    pub key: String,
    pub leaf: bool,
    pub ipld: Ipld,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageNodeIpld {
    pub state_key: String,
    pub key: String,
    pub leaf: bool,
    pub ipld: Ipld,
}

/// The subset of one height's objects selected by a [SubscriptionFilter]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpldBundle {
    pub height: Height,
    pub headers: Vec<Ipld>,
    pub uncles: Vec<Ipld>,
    pub transactions: Vec<Ipld>,
    pub receipts: Vec<Ipld>,
    pub state_nodes: Vec<StateNodeIpld>,
    pub storage_nodes: Vec<StorageNodeIpld>,
}

impl IpldBundle {
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

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// Selects the objects of an in-memory payload matching a filter, without
/// touching the index
pub trait ResponseFilterer: Send + Sync {
    fn filter(
        &self,
        filter: &SubscriptionFilter,
        payload: &ConvertedData,
    ) -> Result<IpldBundle, FilterError>;
}

pub fn new_response_filterer(chain: ChainType) -> Arc<dyn ResponseFilterer> {
    Arc::new(BlockFilterer::new(chain))
}

#[derive(Debug, Clone)]
pub struct BlockFilterer {
    chain: ChainType,
}

impl BlockFilterer {
    pub fn new(chain: ChainType) -> Self {
        Self { chain }
    }
}

impl ResponseFilterer for BlockFilterer {
    fn filter(
        &self,
        filter: &SubscriptionFilter,
        payload: &ConvertedData,
    ) -> Result<IpldBundle, FilterError> {
        filter.validate(self.chain)?;
        if payload.chain != self.chain {
            return Err(FilterError::ChainMismatch {
                expected: self.chain,
                found: payload.chain,
            });
        }

        let height = payload.height();
        let mut response = IpldBundle::empty(height);
        if !filter.in_range(height) {
            return Ok(response);
        }

        if !filter.header.off {
            response.headers.push(Ipld::new(&payload.header.raw));
            if filter.header.uncles {
                response
                    .uncles
                    .extend(payload.uncles.iter().map(|uncle| Ipld::new(&uncle.raw)));
            }
        }

        let mut selected_txs = HashSet::new();
        if !filter.txs.off {
            for tx in &payload.transactions {
                if filter.txs.matches(self.chain, &tx.src, &tx.dst) {
                    selected_txs.insert(tx.hash.to_lowercase());
                    response.transactions.push(Ipld::new(&tx.raw));
                }
            }
        }

        if !filter.receipts.off {
            response.receipts.extend(
                payload
                    .receipts
                    .iter()
                    .filter(|rct| {
                        filter.receipts.matches(
                            &rct.tx_hash,
                            &rct.contract,
                            &rct.log_contracts,
                            &rct.topics,
                            &selected_txs,
                        )
                    })
                    .map(|rct| Ipld::new(&rct.raw)),
            );
        }

        if !filter.state.off {
            let keys = filter.state.keys();
            response.state_nodes.extend(
                payload
                    .state_nodes
                    .iter()
                    .filter(|node| filter.state.matches(&keys, &node.key, node.leaf))
                    .map(|node| StateNodeIpld {
                        key: node.key.clone(),
                        leaf: node.leaf,
                        ipld: Ipld::new(&node.raw),
                    }),
            );
        }

        if !filter.storage.off {
            let state_keys = filter.storage.state_keys();
            response.storage_nodes.extend(
                payload
                    .storage_nodes
                    .iter()
                    .filter(|node| {
                        filter
                            .storage
                            .matches(&state_keys, &node.state_key, &node.key, node.leaf)
                    })
                    .map(|node| StorageNodeIpld {
                        state_key: node.state_key.clone(),
                        key: node.key.clone(),
                        leaf: node.leaf,
                        ipld: Ipld::new(&node.raw),
                    }),
            );
        }

        Ok(response)
    }
}
