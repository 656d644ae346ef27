use crate::{chain::ChainType, filter::response::IpldBundle};
use serde_derive::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Marks payloads that carry control information rather than data
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Flag {
    #[default]
    None,
    BackFillComplete,
}

/// One record on a subscriber's stream. `data` holds an encoded
/// [IpldBundle]; `err` is non-empty for error payloads.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionPayload {
    #[serde(default)]
    pub data: Vec<u8>,
    #[serde(default)]
    pub err: String,
    #[serde(default)]
    pub flag: Flag,
    pub height: u64,
}

impl SubscriptionPayload {
    pub fn data(height: u64, data: Vec<u8>) -> Self {
        Self {
            data,
            height,
            ..Default::default()
        }
    }

    pub fn error(height: u64, err: impl ToString) -> Self {
        Self {
            err: err.to_string(),
            height,
            ..Default::default()
        }
    }

    pub fn backfill_complete(height: u64) -> Self {
        Self {
            flag: Flag::BackFillComplete,
            height,
            ..Default::default()
        }
    }

    pub fn is_error(&self) -> bool {
        !self.err.is_empty()
    }

    pub fn bundle(&self) -> serde_json::Result<IpldBundle> {
        IpldBundle::decode(&self.data)
    }
}

/// A live subscriber: where its payloads go and how it is told to stop
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: Uuid,
    pub payloads: mpsc::Sender<SubscriptionPayload>,
    pub quit: mpsc::Sender<()>,
}

impl Subscription {
    pub fn new(
        id: Uuid,
        payloads: mpsc::Sender<SubscriptionPayload>,
        quit: mpsc::Sender<()>,
    ) -> Self {
        Self { id, payloads, quit }
    }

    pub fn is_closed(&self) -> bool {
        self.payloads.is_closed()
    }
}

/// Static identity of the chain node this watcher follows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    pub client_name: String,
    pub genesis_block: String,
    pub network_id: u64,
    pub chain_id: u64,
    pub chain: ChainType,
}
