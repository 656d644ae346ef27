use async_trait::async_trait;
use data_encoding::HEXLOWER;
use ipld_watcher::{
    chain::{ChainType, Height},
    content_store::rocks::RocksContentStore,
    index::{store::IndexerStore, CidIndexer, CidPayload, IndexError},
    payload::{ethereum::*, ConvertedData, RawChainData},
    service::{Components, Service},
    subscription::NodeInfo,
    upstream::{PayloadFetcher, PayloadStreamer, StreamSubscription, TransportError},
};
use std::{
    collections::{HashMap, HashSet},
    ops::RangeInclusive,
    sync::{Arc, Mutex},
};
use tempfile::TempDir;
use tokio::sync::mpsc;

/// Sets up a new temp dir, deleted when it goes out of scope
pub fn setup_new_db_dir(prefix: &str) -> anyhow::Result<TempDir> {
    let store_dir = TempDir::with_prefix(prefix)?;
    if store_dir.path().exists() {
        std::fs::remove_dir_all(store_dir.path())?;
    }
    Ok(store_dir)
}

/// Heights in `range` with at least one indexed header
pub fn indexed_heights(
    store: &IndexerStore,
    range: RangeInclusive<Height>,
) -> anyhow::Result<Vec<Height>> {
    let mut heights = vec![];
    for height in range {
        if !store.headers_at(height)?.is_empty() {
            heights.push(height);
        }
    }
    Ok(heights)
}

pub fn hex(text: &str) -> String {
    format!("0x{}", HEXLOWER.encode(text.as_bytes()))
}

/// Ethereum block at `height` with two transactions:
/// `0xA -> 0xB` whose receipt creates contract `0xC` and logs topic `0xT`, and
/// `0xD -> 0xE` whose receipt logs topic `0xF` from contract `0xC2`.
/// It also touches one state leaf and one storage leaf of account `0xB`.
pub fn eth_payload(height: Height) -> RawEthPayload {
    let tx_hash = |n: u32| format!("0xtx{height}-{n}");
    RawEthPayload {
        header: RawEthHeader {
            hash: format!("0xh{height}"),
            parent_hash: format!("0xh{}", height.saturating_sub(1)),
            number: height,
            timestamp: 1_600_000_000 + height,
            raw: hex(&format!("header {height}")),
        },
        uncles: vec![RawEthUncle {
            hash: format!("0xu{height}"),
            raw: hex(&format!("uncle {height}")),
        }],
        transactions: vec![
            RawEthTransaction {
                hash: tx_hash(0),
                from: "0xA".into(),
                to: Some("0xB".into()),
                raw: hex(&format!("tx {height} 0")),
            },
            RawEthTransaction {
                hash: tx_hash(1),
                from: "0xD".into(),
                to: Some("0xE".into()),
                raw: hex(&format!("tx {height} 1")),
            },
        ],
        receipts: vec![
            RawEthReceipt {
                tx_hash: tx_hash(0),
                contract_address: Some("0xC".into()),
                logs: vec![RawEthLog {
                    address: "0xC".into(),
                    topics: vec!["0xT".into()],
                }],
                raw: hex(&format!("receipt {height} 0")),
            },
            RawEthReceipt {
                tx_hash: tx_hash(1),
                contract_address: None,
                logs: vec![RawEthLog {
                    address: "0xC2".into(),
                    topics: vec!["0xF".into()],
                }],
                raw: hex(&format!("receipt {height} 1")),
            },
        ],
        state_nodes: vec![RawEthStateNode {
            key: ipld_watcher::filter::state_key_for_address("0xB"),
            leaf: true,
            raw: hex(&format!("state {height}")),
        }],
        storage_nodes: vec![RawEthStorageNode {
            state_key: ipld_watcher::filter::state_key_for_address("0xB"),
            key: "0x01".into(),
            leaf: true,
            raw: hex(&format!("storage {height}")),
        }],
    }
}

/// Ethereum block at `height` with a single transaction `0xA -> 0xB` whose
/// receipt creates contract `0xC` and logs topic `0xT`. No uncles or trie nodes.
pub fn single_tx_eth_payload(height: Height) -> RawEthPayload {
    let mut payload = eth_payload(height);
    payload.uncles.clear();
    payload.transactions.truncate(1);
    payload.receipts.truncate(1);
    payload.state_nodes.clear();
    payload.storage_nodes.clear();
    payload
}

pub fn raw_eth(height: Height) -> RawChainData {
    eth_payload(height)
        .to_raw_chain_data()
        .expect("payload serializes")
}

pub fn node_info() -> NodeInfo {
    NodeInfo {
        id: "node-1".into(),
        client_name: "test-node".into(),
        genesis_block: "0xh0".into(),
        network_id: 1,
        chain_id: 1,
        chain: ChainType::Ethereum,
    }
}

/// Content store and index on temp dirs, with the ethereum components over them
pub struct Stores {
    pub index_store: Arc<IndexerStore>,
    pub content_store: Arc<RocksContentStore>,
    pub components: Components,
    _index_dir: TempDir,
    _content_dir: TempDir,
}

impl Stores {
    pub fn new(prefix: &str) -> anyhow::Result<Self> {
        Self::for_chain(prefix, ChainType::Ethereum)
    }

    pub fn for_chain(prefix: &str, chain: ChainType) -> anyhow::Result<Self> {
        let index_dir = setup_new_db_dir(&format!("{prefix}-index"))?;
        let content_dir = setup_new_db_dir(&format!("{prefix}-content"))?;
        let index_store = Arc::new(IndexerStore::new(index_dir.path())?);
        let content_store = Arc::new(RocksContentStore::new(content_dir.path())?);
        let components = Components::new(
            chain,
            content_store.clone(),
            index_store.clone(),
            false,
        );
        Ok(Self {
            index_store,
            content_store,
            components,
            _index_dir: index_dir,
            _content_dir: content_dir,
        })
    }

    pub fn service(&self, workers: usize, work_queue_size: usize) -> Service {
        Service::new(
            ChainType::Ethereum,
            self.components.clone(),
            node_info(),
            workers,
            work_queue_size,
        )
    }

    /// Convert, publish and index the fixture block at each height
    pub fn index_heights(&self, heights: &[Height]) -> anyhow::Result<()> {
        for height in heights {
            self.index_raw(&raw_eth(*height))?;
        }
        Ok(())
    }

    /// Convert, publish and index one payload, returning its decoded form
    pub fn index_raw(&self, raw: &RawChainData) -> anyhow::Result<ConvertedData> {
        let converted = self.components.converter.convert(raw)?;
        let cids = self.components.publisher.publish(&converted)?;
        self.components.indexer.index(&cids)?;
        Ok(converted)
    }
}

/// Live feed that delivers a fixed script and then ends
pub struct MemoryStreamer {
    pub payloads: Vec<RawChainData>,
    pub errors: Vec<TransportError>,
}

impl MemoryStreamer {
    pub fn new(payloads: Vec<RawChainData>) -> Self {
        Self {
            payloads,
            errors: vec![],
        }
    }
}

#[async_trait]
impl PayloadStreamer for MemoryStreamer {
    async fn stream(
        &self,
        payloads: mpsc::Sender<RawChainData>,
    ) -> Result<StreamSubscription, TransportError> {
        let (error_sender, error_receiver) = mpsc::channel(self.errors.len().max(1));
        for error in &self.errors {
            let _ = error_sender.try_send(error.clone());
        }
        let script = self.payloads.clone();
        let feed = tokio::spawn(async move {
            for payload in script {
                if payloads.send(payload).await.is_err() {
                    return;
                }
            }
        });
        Ok(StreamSubscription::new(error_receiver, vec![feed]))
    }
}

/// Historical fetcher serving the fixture block at every height it knows,
/// recording each requested batch
#[derive(Default)]
pub struct ScriptedFetcher {
    pub payloads: HashMap<Height, RawChainData>,
    pub requests: Mutex<Vec<Vec<Height>>>,
}

impl ScriptedFetcher {
    pub fn with_heights(heights: impl IntoIterator<Item = Height>) -> Self {
        Self {
            payloads: heights.into_iter().map(|h| (h, raw_eth(h))).collect(),
            requests: Mutex::new(vec![]),
        }
    }

    pub fn requests(&self) -> Vec<Vec<Height>> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl PayloadFetcher for ScriptedFetcher {
    async fn fetch_at(&self, heights: &[Height]) -> Result<Vec<RawChainData>, TransportError> {
        self.requests.lock().unwrap().push(heights.to_vec());
        heights
            .iter()
            .map(|height| {
                self.payloads
                    .get(height)
                    .cloned()
                    .ok_or(TransportError::MissingHeight(*height))
            })
            .collect()
    }
}

/// Indexer that refuses the configured heights and delegates the rest
pub struct FailingIndexer {
    pub fail: Mutex<HashSet<Height>>,
    pub inner: Arc<dyn CidIndexer>,
}

impl FailingIndexer {
    pub fn new(inner: Arc<dyn CidIndexer>, fail: impl IntoIterator<Item = Height>) -> Self {
        Self {
            fail: Mutex::new(fail.into_iter().collect()),
            inner,
        }
    }

    pub fn heal(&self) {
        self.fail.lock().unwrap().clear();
    }
}

impl CidIndexer for FailingIndexer {
    fn index(&self, payload: &CidPayload) -> Result<(), IndexError> {
        if self.fail.lock().unwrap().contains(&payload.height()) {
            return Err(IndexError::Serialization(serde_json::Error::io(
                std::io::Error::new(std::io::ErrorKind::Other, "index unavailable"),
            )));
        }
        self.inner.index(payload)
    }
}
