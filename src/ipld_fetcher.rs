use crate::{
    cid::Cid,
    content_store::{ContentStore, ContentStoreError},
    filter::response::{Ipld, IpldBundle, StateNodeIpld, StorageNodeIpld},
    index::CidsForFetching,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error)]
pub enum IpldFetchError {
    #[error("content id {0} is indexed but missing from the content store")]
    Missing(Cid),
    #[error("content store error: {0}")]
    Store(#[from] ContentStoreError),
}

/// Resolves retrieved CIDs into the objects they address
#[derive(Debug, Clone)]
pub struct IpldFetcher {
    store: Arc<dyn ContentStore>,
}

impl IpldFetcher {
    pub fn new(store: Arc<dyn ContentStore>) -> Self {
        Self { store }
    }

    pub fn fetch(&self, cids: &CidsForFetching) -> Result<IpldBundle, IpldFetchError> {
        trace!("Fetching objects for height {}", cids.height);
        let mut bundle = IpldBundle::empty(cids.height);

        for header in &cids.headers {
            bundle.headers.push(self.get(&header.cid)?);
        }
        for uncle in &cids.uncles {
            bundle.uncles.push(self.get(&uncle.cid)?);
        }
        for tx in &cids.transactions {
            bundle.transactions.push(self.get(&tx.cid)?);
        }
        for rct in &cids.receipts {
            bundle.receipts.push(self.get(&rct.cid)?);
        }
        for node in &cids.state_nodes {
            bundle.state_nodes.push(StateNodeIpld {
                key: node.key.clone(),
                leaf: node.leaf,
                ipld: self.get(&node.cid)?,
            });
        }
        for node in &cids.storage_nodes {
            bundle.storage_nodes.push(StorageNodeIpld {
                state_key: node.state_key.clone(),
                key: node.key.clone(),
                leaf: node.leaf,
                ipld: self.get(&node.cid)?,
            });
        }
        Ok(bundle)
    }

    fn get(&self, cid: &Cid) -> Result<Ipld, IpldFetchError> {
        match self.store.get(cid)? {
            Some(data) => Ok(Ipld {
                cid: cid.clone(),
                data,
            }),
            None => Err(IpldFetchError::Missing(cid.clone())),
        }
    }
}
