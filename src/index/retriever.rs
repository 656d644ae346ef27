use super::{store::IndexerStore, CidRetriever, CidsForFetching, Gap, IndexError};
use crate::{
    chain::{ChainType, Height},
    filter::SubscriptionFilter,
};
use std::{collections::HashSet, sync::Arc};
use tracing::{debug, trace};

/// Answers subscription filters from the indexed filter columns. The row
/// selection applies the same predicates as the in-memory filterer, only to
/// index rows instead of decoded objects.
#[derive(Debug, Clone)]
pub struct BlockRetriever {
    chain: ChainType,
    store: Arc<IndexerStore>,
    backfill_from_genesis: bool,
}

impl BlockRetriever {
    pub fn new(chain: ChainType, store: Arc<IndexerStore>, backfill_from_genesis: bool) -> Self {
        Self {
            chain,
            store,
            backfill_from_genesis,
        }
    }
}

impl CidRetriever for BlockRetriever {
    fn retrieve(
        &self,
        filter: &SubscriptionFilter,
        height: Height,
    ) -> Result<(CidsForFetching, bool), IndexError> {
        filter.validate(self.chain)?;
        let mut cids = CidsForFetching::empty(height);
        if !filter.in_range(height) {
            return Ok((cids, true));
        }

        let headers = self.store.headers_at(height)?;
        trace!("Retrieving from {} headers at height {height}", headers.len());
        for header in headers {
            if !filter.header.off && filter.header.uncles {
                cids.uncles.extend(self.store.uncles_of(&header)?);
            }

            let mut selected_txs = HashSet::new();
            if !filter.txs.off {
                for tx in self.store.transactions_of(&header)? {
                    if filter.txs.matches(self.chain, &tx.src, &tx.dst) {
                        selected_txs.insert(tx.hash.to_lowercase());
                        cids.transactions.push(tx);
                    }
                }
            }

            if !filter.receipts.off {
                cids.receipts
                    .extend(self.store.receipts_of(&header)?.into_iter().filter(|rct| {
                        filter.receipts.matches(
                            &rct.tx_hash,
                            &rct.contract,
                            &rct.log_contracts,
                            &rct.topics,
                            &selected_txs,
                        )
                    }));
            }

            if !filter.state.off {
                let keys = filter.state.keys();
                cids.state_nodes.extend(
                    self.store
                        .state_nodes_of(&header)?
                        .into_iter()
                        .filter(|node| filter.state.matches(&keys, &node.key, node.leaf)),
                );
            }

            if !filter.storage.off {
                let state_keys = filter.storage.state_keys();
                cids.storage_nodes
                    .extend(self.store.storage_nodes_of(&header)?.into_iter().filter(|node| {
                        filter
                            .storage
                            .matches(&state_keys, &node.state_key, &node.key, node.leaf)
                    }));
            }

            if !filter.header.off {
                cids.headers.push(header);
            }
        }

        let empty = cids.is_empty();
        Ok((cids, empty))
    }

    fn retrieve_first_block_number(&self) -> Result<Option<Height>, IndexError> {
        self.store.first_height()
    }

    fn retrieve_last_block_number(&self) -> Result<Option<Height>, IndexError> {
        self.store.last_height()
    }

    fn retrieve_gaps_in_data(&self) -> Result<Vec<Gap>, IndexError> {
        let gaps = self.store.gaps(self.backfill_from_genesis)?;
        debug!("Found {} gaps in indexed data", gaps.len());
        Ok(gaps)
    }
}
