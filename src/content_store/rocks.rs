use super::{ContentStore, ContentStoreError};
use crate::cid::Cid;
use rocksdb::{ColumnFamilyDescriptor, IteratorMode, DB};
use std::path::{Path, PathBuf};
use tracing::trace;

/// Content store persisted in its own RocksDB instance, keyed by [Cid]
#[derive(Debug)]
pub struct RocksContentStore {
    pub db_path: PathBuf,
    pub database: DB,
}

impl RocksContentStore {
    pub fn new(path: &Path) -> anyhow::Result<Self> {
        let mut cf_opts = rocksdb::Options::default();
        cf_opts.set_max_write_buffer_number(16);
        let blocks = ColumnFamilyDescriptor::new("blocks", cf_opts);

        let mut database_opts = rocksdb::Options::default();
        database_opts.create_missing_column_families(true);
        database_opts.create_if_missing(true);
        let database = DB::open_cf_descriptors(&database_opts, path, vec![blocks])?;
        Ok(Self {
            db_path: PathBuf::from(path),
            database,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn blocks_cf(&self) -> &rocksdb::ColumnFamily {
        self.database
            .cf_handle("blocks")
            .expect("blocks column family exists")
    }
}

impl ContentStore for RocksContentStore {
    fn put(&self, bytes: &[u8]) -> Result<Cid, ContentStoreError> {
        let cid = Cid::of(bytes);
        let blocks_cf = self.blocks_cf();
        if self
            .database
            .get_pinned_cf(blocks_cf, cid.as_bytes())?
            .is_none()
        {
            trace!("Putting {} bytes at {cid}", bytes.len());
            self.database.put_cf(blocks_cf, cid.as_bytes(), bytes)?;
        }
        Ok(cid)
    }

    fn get(&self, cid: &Cid) -> Result<Option<Vec<u8>>, ContentStoreError> {
        trace!("Getting {cid}");
        Ok(self
            .database
            .get_pinned_cf(self.blocks_cf(), cid.as_bytes())?
            .map(|bytes| bytes.to_vec()))
    }

    fn len(&self) -> Result<usize, ContentStoreError> {
        let mut count = 0;
        for entry in self
            .database
            .iterator_cf(self.blocks_cf(), IteratorMode::Start)
        {
            entry?;
            count += 1;
        }
        Ok(count)
    }
}
