use super::{
    CidPayload, Gap, GapScanner, HeaderModel, IndexError, ReceiptModel, StateNodeModel,
    StorageNodeModel, TxModel, UncleModel,
};
use crate::chain::Height;
use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, WriteBatch, DB};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Headers,
    Uncles,
    Transactions,
    Receipts,
    StateNodes,
    StorageNodes,
}

impl Table {
    pub const ALL: [Table; 6] = [
        Table::Headers,
        Table::Uncles,
        Table::Transactions,
        Table::Receipts,
        Table::StateNodes,
        Table::StorageNodes,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Table::Headers => "headers",
            Table::Uncles => "uncles",
            Table::Transactions => "transactions",
            Table::Receipts => "receipts",
            Table::StateNodes => "state_nodes",
            Table::StorageNodes => "storage_nodes",
        }
    }
}

/// RocksDB-backed relational index.
///
/// Every table is a column family keyed by `height ++ header hash ++ natural
/// identity`, so rows of one block sort together beneath their header and
/// re-indexing the same block overwrites rather than duplicates. Trie nodes
/// are identified by their path and CID, since distinct intermediate nodes
/// may share a path. All rows of one block are written in a single
/// [WriteBatch].
#[derive(Debug)]
pub struct IndexerStore {
    pub db_path: PathBuf,
    pub database: DB,
}

impl IndexerStore {
    pub fn new(path: &Path) -> anyhow::Result<Self> {
        let mut cf_opts = rocksdb::Options::default();
        cf_opts.set_max_write_buffer_number(16);
        let descriptors = Table::ALL
            .iter()
            .map(|table| ColumnFamilyDescriptor::new(table.name(), cf_opts.clone()))
            .collect::<Vec<_>>();

        let mut database_opts = rocksdb::Options::default();
        database_opts.create_missing_column_families(true);
        database_opts.create_if_missing(true);
        let database = DB::open_cf_descriptors(&database_opts, path, descriptors)?;
        Ok(Self {
            db_path: PathBuf::from(path),
            database,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn cf(&self, table: Table) -> &rocksdb::ColumnFamily {
        self.database
            .cf_handle(table.name())
            .expect("index column family exists")
    }

    /// Write every row of `payload` atomically
    pub fn index_payload(&self, payload: &CidPayload) -> Result<(), IndexError> {
        let header = &payload.header;
        trace!(
            "Indexing block with height {} and hash {}",
            header.height,
            header.hash
        );

        let header_key = row_key(header.height, &[&header.hash]);
        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(Table::Headers),
            &header_key,
            serde_json::to_vec(header)?,
        );

        for uncle in &payload.uncles {
            let key = child_key(&header_key, &[&uncle.hash]);
            batch.put_cf(self.cf(Table::Uncles), key, serde_json::to_vec(uncle)?);
        }
        for tx in &payload.transactions {
            let key = child_key(&header_key, &[&tx.hash]);
            batch.put_cf(self.cf(Table::Transactions), key, serde_json::to_vec(tx)?);
        }
        for rct in &payload.receipts {
            let key = child_key(&header_key, &[&rct.tx_hash]);
            batch.put_cf(self.cf(Table::Receipts), key, serde_json::to_vec(rct)?);
        }
        for node in &payload.state_nodes {
            let key = child_key(&header_key, &[&node.key, node.cid.as_str()]);
            batch.put_cf(self.cf(Table::StateNodes), key, serde_json::to_vec(node)?);
        }
        for (state_key, nodes) in &payload.storage_nodes {
            for node in nodes {
                let key = child_key(&header_key, &[state_key, &node.key, node.cid.as_str()]);
                batch.put_cf(self.cf(Table::StorageNodes), key, serde_json::to_vec(node)?);
            }
        }

        self.database.write(batch)?;
        Ok(())
    }

    /// All headers indexed at `height` (more than one after a reorg)
    pub fn headers_at(&self, height: Height) -> Result<Vec<HeaderModel>, IndexError> {
        trace!("Getting headers at height {height}");
        self.rows_with_prefix(Table::Headers, &height.to_be_bytes())
    }

    pub fn uncles_of(&self, header: &HeaderModel) -> Result<Vec<UncleModel>, IndexError> {
        self.rows_with_prefix(Table::Uncles, &header_key(header))
    }

    pub fn transactions_of(&self, header: &HeaderModel) -> Result<Vec<TxModel>, IndexError> {
        let mut txs: Vec<TxModel> =
            self.rows_with_prefix(Table::Transactions, &header_key(header))?;
        txs.sort_by_key(|tx| tx.index);
        Ok(txs)
    }

    pub fn receipts_of(&self, header: &HeaderModel) -> Result<Vec<ReceiptModel>, IndexError> {
        self.rows_with_prefix(Table::Receipts, &header_key(header))
    }

    pub fn state_nodes_of(&self, header: &HeaderModel) -> Result<Vec<StateNodeModel>, IndexError> {
        self.rows_with_prefix(Table::StateNodes, &header_key(header))
    }

    pub fn storage_nodes_of(
        &self,
        header: &HeaderModel,
    ) -> Result<Vec<StorageNodeModel>, IndexError> {
        self.rows_with_prefix(Table::StorageNodes, &header_key(header))
    }

    /// Missing height ranges between indexed headers. Walks one header key
    /// per distinct height, seeking past sibling headers.
    pub fn gaps(&self, from_genesis: bool) -> Result<Vec<Gap>, IndexError> {
        let mut scanner = GapScanner::new(from_genesis);
        let mut from: Height = 0;
        loop {
            let next = self
                .database
                .iterator_cf(
                    self.cf(Table::Headers),
                    IteratorMode::From(&from.to_be_bytes(), Direction::Forward),
                )
                .next();
            let Some(entry) = next else { break };
            let (key, _) = entry?;
            let height = height_of_key(&key);
            scanner.push(height);
            match height.checked_add(1) {
                Some(next_height) => from = next_height,
                None => break,
            }
        }
        Ok(scanner.finish())
    }

    pub fn first_height(&self) -> Result<Option<Height>, IndexError> {
        self.edge_height(IteratorMode::Start)
    }

    pub fn last_height(&self) -> Result<Option<Height>, IndexError> {
        self.edge_height(IteratorMode::End)
    }

    pub fn row_count(&self, table: Table) -> Result<usize, IndexError> {
        let mut count = 0;
        for entry in self.database.iterator_cf(self.cf(table), IteratorMode::Start) {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    fn edge_height(&self, mode: IteratorMode) -> Result<Option<Height>, IndexError> {
        match self
            .database
            .iterator_cf(self.cf(Table::Headers), mode)
            .next()
        {
            None => Ok(None),
            Some(entry) => {
                let (key, _) = entry?;
                Ok(Some(height_of_key(&key)))
            }
        }
    }

    fn rows_with_prefix<T: DeserializeOwned>(
        &self,
        table: Table,
        prefix: &[u8],
    ) -> Result<Vec<T>, IndexError> {
        let mut rows = vec![];
        for entry in self.database.iterator_cf(
            self.cf(table),
            IteratorMode::From(prefix, Direction::Forward),
        ) {
            let (key, value) = entry?;
            if !key.starts_with(prefix) {
                break;
            }
            rows.push(serde_json::from_slice(&value)?);
        }
        Ok(rows)
    }
}

fn header_key(header: &HeaderModel) -> Vec<u8> {
    row_key(header.height, &[&header.hash])
}

/// `height (big endian) ++ length-prefixed parts`
fn row_key(height: Height, parts: &[&str]) -> Vec<u8> {
    child_key(&height.to_be_bytes(), parts)
}

fn child_key(prefix: &[u8], parts: &[&str]) -> Vec<u8> {
    let mut key = prefix.to_vec();
    for part in parts {
        key.extend_from_slice(&(part.len() as u16).to_be_bytes());
        key.extend_from_slice(part.as_bytes());
    }
    key
}

fn height_of_key(key: &[u8]) -> Height {
    let mut height = [0u8; 8];
    height.copy_from_slice(&key[..8]);
    Height::from_be_bytes(height)
}
