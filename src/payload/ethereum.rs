//! Ethereum payloads: header, uncles, transactions with their receipts,
//! and the state/storage trie nodes touched by the block.

use super::{
    check_chain, decode_hex, ConvertedData, DecodeError, Header,
    PayloadConverter, RawChainData, Receipt, StateNode, StorageNode, Transaction, Uncle,
};
use crate::chain::{ChainType, Height};
use serde_derive::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEthPayload {
    pub header: RawEthHeader,
    #[serde(default)]
    pub uncles: Vec<RawEthUncle>,
    #[serde(default)]
    pub transactions: Vec<RawEthTransaction>,
    #[serde(default)]
    pub receipts: Vec<RawEthReceipt>,
    #[serde(default)]
    pub state_nodes: Vec<RawEthStateNode>,
    #[serde(default)]
    pub storage_nodes: Vec<RawEthStorageNode>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEthHeader {
    pub hash: String,
    pub parent_hash: String,
    pub number: Height,
    pub timestamp: u64,
    pub raw: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEthUncle {
    pub hash: String,
    pub raw: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEthTransaction {
    pub hash: String,
    pub from: String,
    /// `None` for contract creations
    pub to: Option<String>,
    pub raw: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEthReceipt {
    pub tx_hash: String,
    pub contract_address: Option<String>,
    #[serde(default)]
    pub logs: Vec<RawEthLog>,
    pub raw: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEthLog {
    pub address: String,
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEthStateNode {
    pub key: String,
    pub leaf: bool,
    pub raw: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEthStorageNode {
    pub state_key: String,
    pub key: String,
    pub leaf: bool,
    pub raw: String,
}

impl RawEthPayload {
    pub fn to_raw_chain_data(&self) -> serde_json::Result<RawChainData> {
        Ok(RawChainData {
            chain: ChainType::Ethereum,
            height: self.header.number,
            data: serde_json::to_vec(self)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EthConverter;

impl PayloadConverter for EthConverter {
    fn convert(&self, raw: &RawChainData) -> Result<ConvertedData, DecodeError> {
        check_chain(ChainType::Ethereum, raw)?;
        let payload: RawEthPayload =
            serde_json::from_slice(&raw.data).map_err(|e| DecodeError::Json {
                height: raw.height,
                reason: e.to_string(),
            })?;

        if payload.header.number != raw.height {
            return Err(DecodeError::HeightMismatch {
                expected: raw.height,
                found: payload.header.number,
            });
        }
        if payload.transactions.len() != payload.receipts.len() {
            return Err(DecodeError::CountMismatch {
                transactions: payload.transactions.len(),
                receipts: payload.receipts.len(),
            });
        }

        let header = Header {
            hash: payload.header.hash.to_lowercase(),
            parent_hash: payload.header.parent_hash.to_lowercase(),
            height: payload.header.number,
            timestamp: payload.header.timestamp,
            raw: decode_hex("header.raw", &payload.header.raw)?,
        };

        let uncles = payload
            .uncles
            .iter()
            .map(|uncle| {
                Ok(Uncle {
                    hash: uncle.hash.to_lowercase(),
                    raw: decode_hex("uncle.raw", &uncle.raw)?,
                })
            })
            .collect::<Result<Vec<_>, DecodeError>>()?;

        let mut transactions = Vec::with_capacity(payload.transactions.len());
        let mut receipts = Vec::with_capacity(payload.receipts.len());
        for (index, (tx, rct)) in payload
            .transactions
            .iter()
            .zip(payload.receipts.iter())
            .enumerate()
        {
            let tx_hash = tx.hash.to_lowercase();
            if rct.tx_hash.to_lowercase() != tx_hash {
                return Err(DecodeError::ReceiptMismatch {
                    index,
                    transaction: tx_hash,
                    receipt: rct.tx_hash.clone(),
                });
            }

            let mut topics: [Vec<String>; 4] = Default::default();
            let mut log_contracts = vec![];
            for log in &rct.logs {
                if log.topics.len() > 4 {
                    return Err(DecodeError::TooManyTopics {
                        tx_hash,
                        count: log.topics.len(),
                    });
                }
                for (position, topic) in log.topics.iter().enumerate() {
                    let topic = topic.to_lowercase();
                    if !topics[position].contains(&topic) {
                        topics[position].push(topic);
                    }
                }
                let address = eth_address(&log.address);
                if !log_contracts.contains(&address) {
                    log_contracts.push(address);
                }
            }

            transactions.push(Transaction {
                hash: tx_hash.clone(),
                index: index as u32,
                src: vec![eth_address(&tx.from)],
                dst: tx.to.as_deref().map(eth_address).into_iter().collect(),
                raw: decode_hex("transaction.raw", &tx.raw)?,
            });
            receipts.push(Receipt {
                tx_hash,
                contract: rct
                    .contract_address
                    .as_deref()
                    .map(eth_address)
                    .unwrap_or_default(),
                log_contracts,
                topics,
                raw: decode_hex("receipt.raw", &rct.raw)?,
            });
        }

        let state_nodes = payload
            .state_nodes
            .iter()
            .map(|node| {
                Ok(StateNode {
                    key: node.key.to_lowercase(),
                    leaf: node.leaf,
                    raw: decode_hex("state_node.raw", &node.raw)?,
                })
            })
            .collect::<Result<Vec<_>, DecodeError>>()?;

        let storage_nodes = payload
            .storage_nodes
            .iter()
            .map(|node| {
                Ok(StorageNode {
                    state_key: node.state_key.to_lowercase(),
                    key: node.key.to_lowercase(),
                    leaf: node.leaf,
                    raw: decode_hex("storage_node.raw", &node.raw)?,
                })
            })
            .collect::<Result<Vec<_>, DecodeError>>()?;

        Ok(ConvertedData {
            chain: ChainType::Ethereum,
            header,
            uncles,
            transactions,
            receipts,
            state_nodes,
            storage_nodes,
        })
    }
}

fn eth_address(address: &str) -> String {
    ChainType::Ethereum.normalize_address(address)
}
