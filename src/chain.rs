use clap::ValueEnum;
use serde_derive::{Deserialize, Serialize};
use std::fmt;

/// Block height on the upstream chain
pub type Height = u64;

/// The chains the pipeline knows how to convert, publish and filter
#[derive(
    Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, ValueEnum,
)]
pub enum ChainType {
    #[serde(rename = "ethereum")]
    Ethereum,
    #[serde(rename = "bitcoin")]
    Bitcoin,
}

impl ChainType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainType::Ethereum => "ethereum",
            ChainType::Bitcoin => "bitcoin",
        }
    }

    /// Whether addresses are hex strings that compare case-insensitively.
    /// Bitcoin's base58 and bech32 addresses are case-sensitive.
    pub fn hex_addresses(&self) -> bool {
        matches!(self, ChainType::Ethereum)
    }

    /// Canonical form of an address on this chain
    pub fn normalize_address(&self, address: &str) -> String {
        let address = address.trim();
        if self.hex_addresses() {
            address.to_lowercase()
        } else {
            address.to_string()
        }
    }
}

impl fmt::Display for ChainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
