//! Subscription filters and the predicates shared by the in-memory
//! [response::ResponseFilterer] and the index-backed retriever.

use crate::{
    chain::{ChainType, Height},
    cid::{blake2b_256, blake2b_256_hex},
};
use serde_derive::{Deserialize, Serialize};
use std::{collections::HashSet, fmt};
use thiserror::Error;

pub mod response;

pub const MAX_TOPIC_POSITIONS: usize = 4;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("receipt filter has {0} topic positions, at most 4 are allowed")]
    TooManyTopics(usize),
    #[error("filter ending block {end} precedes starting block {start}")]
    InvertedRange { start: i64, end: i64 },
    #[error("{found} filter cannot be applied to {expected} data")]
    ChainMismatch {
        expected: ChainType,
        found: ChainType,
    },
    #[error("unable to encode filter: {0}")]
    Encoding(String),
}

/// Immutable description of what a subscriber wants to receive.
///
/// `end <= 0` leaves the range open-ended. Filters that differ only in
/// allow-list order, or in hex case, share a [FilterKey]. Bitcoin
/// transaction addresses keep their case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    pub chain: ChainType,
    #[serde(default)]
    pub start: i64,
    #[serde(default)]
    pub end: i64,
    /// Replay indexed data in `[start, end]` before going live
    #[serde(default)]
    pub historical: bool,
    /// Replay indexed data and never join the live broadcast
    #[serde(default)]
    pub historical_only: bool,
    #[serde(default)]
    pub header: HeaderFilter,
    #[serde(default)]
    pub txs: TxFilter,
    #[serde(default)]
    pub receipts: ReceiptFilter,
    #[serde(default)]
    pub state: StateFilter,
    #[serde(default)]
    pub storage: StorageFilter,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderFilter {
    #[serde(default)]
    pub off: bool,
    #[serde(default)]
    pub uncles: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxFilter {
    #[serde(default)]
    pub off: bool,
    #[serde(default)]
    pub src: Vec<String>,
    #[serde(default)]
    pub dst: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptFilter {
    #[serde(default)]
    pub off: bool,
    /// Keep the receipts of every transaction selected by the [TxFilter]
    #[serde(default)]
    pub match_txs: bool,
    #[serde(default)]
    pub contracts: Vec<String>,
    /// Positional topic allow-lists, position 0..=3
    #[serde(default)]
    pub topics: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateFilter {
    #[serde(default)]
    pub off: bool,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub intermediate_nodes: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageFilter {
    #[serde(default)]
    pub off: bool,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub storage_keys: Vec<String>,
    #[serde(default)]
    pub intermediate_nodes: bool,
}

/// Subscription type: hash of a filter's normalized, stable byte form
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FilterKey(pub String);

impl fmt::Display for FilterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl SubscriptionFilter {
    /// A filter that selects everything from `start` onward
    pub fn new(chain: ChainType, start: i64, end: i64) -> Self {
        Self {
            chain,
            start,
            end,
            historical: false,
            historical_only: false,
            header: HeaderFilter::default(),
            txs: TxFilter::default(),
            receipts: ReceiptFilter::default(),
            state: StateFilter::default(),
            storage: StorageFilter::default(),
        }
    }

    pub fn historical_data(&self) -> bool {
        self.historical
    }

    pub fn historical_data_only(&self) -> bool {
        self.historical_only
    }

    pub fn in_range(&self, height: Height) -> bool {
        let height = height as i64;
        self.start <= height && (self.end <= 0 || height <= self.end)
    }

    /// Whether `height` lies beyond a closed range, ending the subscription
    pub fn past_end(&self, height: Height) -> bool {
        self.end > 0 && height as i64 > self.end
    }

    pub fn validate(&self, chain: ChainType) -> Result<(), FilterError> {
        if self.chain != chain {
            return Err(FilterError::ChainMismatch {
                expected: chain,
                found: self.chain,
            });
        }
        if self.end > 0 && self.end < self.start {
            return Err(FilterError::InvertedRange {
                start: self.start,
                end: self.end,
            });
        }
        if self.receipts.topics.len() > MAX_TOPIC_POSITIONS {
            return Err(FilterError::TooManyTopics(self.receipts.topics.len()));
        }
        Ok(())
    }

    /// Sorted and deduplicated copy of this filter with hex values lower-cased
    pub fn normalized(&self) -> Self {
        let mut filter = self.clone();
        for addresses in [&mut filter.txs.src, &mut filter.txs.dst] {
            addresses
                .iter_mut()
                .for_each(|address| *address = self.chain.normalize_address(address));
            addresses.sort();
            addresses.dedup();
        }
        normalize_list(&mut filter.receipts.contracts);
        filter.receipts.topics.iter_mut().for_each(normalize_list);
        while filter
            .receipts
            .topics
            .last()
            .map_or(false, |topics| topics.is_empty())
        {
            filter.receipts.topics.pop();
        }
        normalize_list(&mut filter.state.addresses);
        normalize_list(&mut filter.storage.addresses);
        normalize_list(&mut filter.storage.storage_keys);
        filter
    }

    pub fn type_key(&self) -> Result<FilterKey, FilterError> {
        let bytes =
            bcs::to_bytes(&self.normalized()).map_err(|e| FilterError::Encoding(e.to_string()))?;
        Ok(FilterKey(bs58::encode(blake2b_256(&bytes)).into_string()))
    }
}

impl TxFilter {
    pub fn is_open(&self) -> bool {
        self.src.is_empty() && self.dst.is_empty()
    }

    /// Whether any sender is in `src` or any recipient is in `dst`
    pub fn matches(&self, chain: ChainType, src: &[String], dst: &[String]) -> bool {
        let listed = |list: &[String], addresses: &[String]| {
            addresses.iter().any(|address| {
                let address = chain.normalize_address(address);
                list.iter().any(|wanted| chain.normalize_address(wanted) == address)
            })
        };
        self.is_open() || listed(&self.src, src) || listed(&self.dst, dst)
    }
}

impl ReceiptFilter {
    fn has_contracts(&self) -> bool {
        !self.contracts.is_empty()
    }

    fn has_topics(&self) -> bool {
        self.topics.iter().any(|topics| !topics.is_empty())
    }

    /// Every non-empty topic position must intersect the receipt's topics at
    /// that position
    pub fn topics_match(&self, actual: &[Vec<String>; 4]) -> bool {
        self.topics.iter().enumerate().all(|(position, wanted)| {
            wanted.is_empty()
                || actual
                    .get(position)
                    .map_or(false, |actual| actual.iter().any(|a| contains(wanted, a)))
        })
    }

    /// Receipt selection. A receipt is kept when any of these hold:
    /// - no contract, topic or transaction constraint is set
    /// - `match_txs` is set and its transaction was selected
    /// - only topics are constrained and they match
    /// - its contract (or a log's contract) is allow-listed and topics match
    pub fn matches(
        &self,
        tx_hash: &str,
        contract: &str,
        log_contracts: &[String],
        topics: &[Vec<String>; 4],
        selected_txs: &HashSet<String>,
    ) -> bool {
        if !self.has_contracts() && !self.has_topics() && !self.match_txs {
            return true;
        }
        if self.match_txs && selected_txs.contains(&tx_hash.to_lowercase()) {
            return true;
        }
        if !self.has_contracts() {
            return self.has_topics() && self.topics_match(topics);
        }
        let contract_listed = (!contract.is_empty() && contains(&self.contracts, contract))
            || log_contracts
                .iter()
                .any(|address| contains(&self.contracts, address));
        contract_listed && self.topics_match(topics)
    }
}

impl StateFilter {
    /// Trie keys derived from the address allow-list; empty means all keys
    pub fn keys(&self) -> Vec<String> {
        self.addresses
            .iter()
            .map(|address| state_key_for_address(address))
            .collect()
    }

    pub fn matches(&self, keys: &[String], key: &str, leaf: bool) -> bool {
        (keys.is_empty() || contains(keys, key)) && (leaf || self.intermediate_nodes)
    }
}

impl StorageFilter {
    pub fn state_keys(&self) -> Vec<String> {
        self.addresses
            .iter()
            .map(|address| state_key_for_address(address))
            .collect()
    }

    pub fn matches(&self, state_keys: &[String], state_key: &str, key: &str, leaf: bool) -> bool {
        (state_keys.is_empty() || contains(state_keys, state_key))
            && (self.storage_keys.is_empty() || contains(&self.storage_keys, key))
            && (leaf || self.intermediate_nodes)
    }
}

/// State trie key of an account address
pub fn state_key_for_address(address: &str) -> String {
    blake2b_256_hex(address.trim().to_lowercase().as_bytes())
}

fn contains(list: &[String], value: &str) -> bool {
    list.iter().any(|item| item.eq_ignore_ascii_case(value))
}

fn normalize_list(list: &mut Vec<String>) {
    list.iter_mut()
        .for_each(|item| *item = item.trim().to_lowercase());
    list.sort();
    list.dedup();
}
