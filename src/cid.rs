use blake2::{digest::consts::U32, Blake2b, Digest};
use data_encoding::HEXLOWER;
use serde_derive::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

type Blake2b256 = Blake2b<U32>;

const CID_VERSION_BYTE: u8 = 0x12;
const DIGEST_LEN: usize = 32;

/// Content identifier of one serialized object in the content store.
///
/// The identifier is the base58check encoding of `[1, 32] ++ blake2b-256(bytes)`,
/// so identical bytes always map to the identical `Cid`.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cid(pub String);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CidError {
    #[error("invalid base58check content id {0}: {1}")]
    Encoding(String, String),
    #[error("content id {0} has a malformed digest")]
    Digest(String),
}

impl Cid {
    /// Compute the content identifier of `bytes`
    pub fn of(bytes: &[u8]) -> Self {
        let digest = blake2b_256(bytes);
        let mut prefixed = Vec::with_capacity(DIGEST_LEN + 2);
        prefixed.push(1);
        prefixed.push(DIGEST_LEN as u8);
        prefixed.extend_from_slice(&digest);
        Self(
            bs58::encode(prefixed)
                .with_check_version(CID_VERSION_BYTE)
                .into_string(),
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl FromStr for Cid {
    type Err = CidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = bs58::decode(s)
            .with_check(Some(CID_VERSION_BYTE))
            .into_vec()
            .map_err(|e| CidError::Encoding(s.to_string(), e.to_string()))?;
        if decoded.len() < DIGEST_LEN + 2 {
            return Err(CidError::Digest(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn blake2b_256(bytes: &[u8]) -> [u8; DIGEST_LEN] {
    let mut digest = [0u8; DIGEST_LEN];
    digest.copy_from_slice(&Blake2b256::digest(bytes));
    digest
}

/// Hex encoded blake2b-256 digest, used for address-derived trie keys
pub fn blake2b_256_hex(bytes: &[u8]) -> String {
    format!("0x{}", HEXLOWER.encode(&blake2b_256(bytes)))
}
