use crate::chain::{ChainType, Height};
use data_encoding::HEXLOWER_PERMISSIVE;
use serde_derive::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

pub mod bitcoin;
pub mod ethereum;

/// Opaque chain payload as delivered by the upstream node at `height`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawChainData {
    pub chain: ChainType,
    pub height: Height,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub hash: String,
    pub parent_hash: String,
    pub height: Height,
    pub timestamp: u64,
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Uncle {
    pub hash: String,
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: String,
    pub index: u32,
    /// Sender addresses: the signer on Ethereum, every spent input on Bitcoin
    pub src: Vec<String>,
    /// Recipient addresses, empty for an Ethereum contract creation
    pub dst: Vec<String>,
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: String,
    /// Address of the contract created by the transaction, empty otherwise
    pub contract: String,
    /// Addresses of the contracts that emitted the receipt's logs
    pub log_contracts: Vec<String>,
    /// Log topics grouped by position 0..=3
    pub topics: [Vec<String>; 4],
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateNode {
    pub key: String,
    pub leaf: bool,
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageNode {
    pub state_key: String,
    pub key: String,
    pub leaf: bool,
    pub raw: Vec<u8>,
}

/// Decoded form of one [RawChainData], scoped to a single pipeline pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvertedData {
    pub chain: ChainType,
    pub header: Header,
    pub uncles: Vec<Uncle>,
    pub transactions: Vec<Transaction>,
    pub receipts: Vec<Receipt>,
    pub state_nodes: Vec<StateNode>,
    pub storage_nodes: Vec<StorageNode>,
}

impl ConvertedData {
    pub fn height(&self) -> Height {
        self.header.height
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload at height {height} is not valid json: {reason}")]
    Json { height: Height, reason: String },
    #[error("field {field} is not valid hex: {value}")]
    Hex { field: &'static str, value: String },
    #[error("payload was delivered for height {expected} but encodes height {found}")]
    HeightMismatch { expected: Height, found: Height },
    #[error("payload has {transactions} transactions but {receipts} receipts")]
    CountMismatch { transactions: usize, receipts: usize },
    #[error("receipt {index} belongs to transaction {receipt} instead of {transaction}")]
    ReceiptMismatch {
        index: usize,
        transaction: String,
        receipt: String,
    },
    #[error("log of transaction {tx_hash} has {count} topics")]
    TooManyTopics { tx_hash: String, count: usize },
    #[error("{found} payload handed to the {expected} converter")]
    ChainMismatch {
        expected: ChainType,
        found: ChainType,
    },
}

/// Turns raw upstream payloads into [ConvertedData]. Pure, no I/O.
pub trait PayloadConverter: Send + Sync {
    fn convert(&self, raw: &RawChainData) -> Result<ConvertedData, DecodeError>;
}

pub fn new_converter(chain: ChainType) -> Arc<dyn PayloadConverter> {
    match chain {
        ChainType::Ethereum => Arc::new(ethereum::EthConverter),
        ChainType::Bitcoin => Arc::new(bitcoin::BtcConverter),
    }
}

pub(crate) fn decode_hex(field: &'static str, value: &str) -> Result<Vec<u8>, DecodeError> {
    let stripped = value.strip_prefix("0x").unwrap_or(value);
    HEXLOWER_PERMISSIVE
        .decode(stripped.as_bytes())
        .map_err(|_| DecodeError::Hex {
            field,
            value: value.to_string(),
        })
}

pub(crate) fn check_chain(expected: ChainType, raw: &RawChainData) -> Result<(), DecodeError> {
    if raw.chain != expected {
        return Err(DecodeError::ChainMismatch {
            expected,
            found: raw.chain,
        });
    }
    Ok(())
}
