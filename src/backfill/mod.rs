//! Gap repair. On every tick the indexed heights are scanned for gaps, which
//! are cut into batches and handed to a pool of workers re-created per pass.

use crate::{
    constants::{DEFAULT_BATCH_NUMBER, DEFAULT_BATCH_SIZE, DEFAULT_GAP_CHECK_FREQUENCY},
    index::{CidRetriever, IndexError},
    payload::ConvertedData,
    service::{quit_signaled, Components},
    upstream::PayloadFetcher,
};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, instrument};

pub mod pool;

use pool::{BatchWorker, WorkerPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackFillConfig {
    /// Heights per fetched batch
    pub batch_size: u64,
    /// Workers per pass
    pub batch_number: usize,
    pub gap_check_frequency: Duration,
}

impl Default for BackFillConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            batch_number: DEFAULT_BATCH_NUMBER,
            gap_check_frequency: DEFAULT_GAP_CHECK_FREQUENCY,
        }
    }
}

#[derive(Clone)]
pub struct BackFillService {
    config: BackFillConfig,
    retriever: Arc<dyn CidRetriever>,
    worker: Arc<BatchWorker>,
    quit: Arc<watch::Sender<bool>>,
}

impl BackFillService {
    pub fn new(
        components: &Components,
        fetcher: Arc<dyn PayloadFetcher>,
        forward: Option<mpsc::Sender<ConvertedData>>,
        config: BackFillConfig,
    ) -> Self {
        let (quit, _) = watch::channel(false);
        Self {
            config,
            retriever: components.retriever.clone(),
            worker: Arc::new(BatchWorker {
                fetcher,
                converter: components.converter.clone(),
                publisher: components.publisher.clone(),
                indexer: components.indexer.clone(),
                forward,
            }),
            quit: Arc::new(quit),
        }
    }

    /// Run a pass every gap-check interval until stopped
    pub fn backfill(&self) -> JoinHandle<()> {
        let service = self.clone();
        let mut quit = self.quit.subscribe();
        tokio::spawn(async move {
            info!(
                "Back-filling every {:?} with {} workers of {} heights",
                service.config.gap_check_frequency,
                service.config.batch_number,
                service.config.batch_size
            );
            let mut ticker = tokio::time::interval(service.config.gap_check_frequency);
            loop {
                tokio::select! {
                    _ = quit_signaled(&mut quit) => break,
                    _ = ticker.tick() => match service.run_pass().await {
                        Ok(0) => {}
                        Ok(indexed) => info!("Back-filled {indexed} heights"),
                        Err(e) => error!("unable to check for gaps: {e}"),
                    }
                }
            }
            debug!("back-fill loop exited");
        })
    }

    /// Repair every gap currently in the index, returning the number of
    /// heights indexed. Heights that fail stay gaps for the next pass.
    #[instrument(skip_all)]
    pub async fn run_pass(&self) -> Result<usize, IndexError> {
        let gaps = self.retriever.retrieve_gaps_in_data()?;
        if gaps.is_empty() {
            debug!("no gaps in indexed data");
            return Ok(0);
        }
        info!("Found {} gaps in indexed data", gaps.len());

        let pool = WorkerPool::start(
            self.config.batch_number,
            self.worker.clone(),
            self.quit.subscribe(),
        );
        'submit: for gap in &gaps {
            debug!("back-filling gap {}..={}", gap.start, gap.stop);
            for batch in gap.batches(self.config.batch_size) {
                let quit_now = *self.quit.borrow();
                if quit_now || !pool.submit(batch.collect()).await {
                    break 'submit;
                }
            }
        }
        Ok(pool.stop().await)
    }

    pub fn stop(&self) {
        info!("Stopping back-fill");
        self.quit.send_replace(true);
    }
}
