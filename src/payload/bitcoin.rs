//! Bitcoin payloads carry a header and transactions only; there are no
//! receipts and no account trie.

use super::{
    check_chain, decode_hex, ConvertedData, DecodeError, Header,
    PayloadConverter, RawChainData, Transaction,
};
use crate::chain::{ChainType, Height};
use serde_derive::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawBtcPayload {
    pub header: RawBtcHeader,
    #[serde(default)]
    pub transactions: Vec<RawBtcTransaction>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawBtcHeader {
    pub hash: String,
    pub parent_hash: String,
    pub height: Height,
    pub timestamp: u64,
    pub raw: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawBtcTransaction {
    pub hash: String,
    /// Addresses spent from; empty for the coinbase
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    pub raw: String,
}

impl RawBtcPayload {
    pub fn to_raw_chain_data(&self) -> serde_json::Result<RawChainData> {
        Ok(RawChainData {
            chain: ChainType::Bitcoin,
            height: self.header.height,
            data: serde_json::to_vec(self)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BtcConverter;

impl PayloadConverter for BtcConverter {
    fn convert(&self, raw: &RawChainData) -> Result<ConvertedData, DecodeError> {
        check_chain(ChainType::Bitcoin, raw)?;
        let payload: RawBtcPayload =
            serde_json::from_slice(&raw.data).map_err(|e| DecodeError::Json {
                height: raw.height,
                reason: e.to_string(),
            })?;
        if payload.header.height != raw.height {
            return Err(DecodeError::HeightMismatch {
                expected: raw.height,
                found: payload.header.height,
            });
        }

        let header = Header {
            hash: payload.header.hash.to_lowercase(),
            parent_hash: payload.header.parent_hash.to_lowercase(),
            height: payload.header.height,
            timestamp: payload.header.timestamp,
            raw: decode_hex("header.raw", &payload.header.raw)?,
        };

        let addresses = |list: &[String]| {
            list.iter()
                .map(|address| ChainType::Bitcoin.normalize_address(address))
                .collect::<Vec<_>>()
        };
        let transactions = payload
            .transactions
            .iter()
            .enumerate()
            .map(|(index, tx)| {
                Ok(Transaction {
                    hash: tx.hash.to_lowercase(),
                    index: index as u32,
                    src: addresses(&tx.inputs),
                    dst: addresses(&tx.outputs),
                    raw: decode_hex("transaction.raw", &tx.raw)?,
                })
            })
            .collect::<Result<Vec<_>, DecodeError>>()?;

        Ok(ConvertedData {
            chain: ChainType::Bitcoin,
            header,
            uncles: vec![],
            transactions,
            receipts: vec![],
            state_nodes: vec![],
            storage_nodes: vec![],
        })
    }
}
