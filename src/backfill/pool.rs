use crate::{
    chain::Height,
    index::CidIndexer,
    payload::{ConvertedData, PayloadConverter},
    publisher::IpldPublisher,
    service::{convert, publish_then_index, quit_signaled},
    upstream::PayloadFetcher,
};
use async_priority_channel as priority;
use futures::future::join_all;
use std::{cmp::Reverse, sync::Arc};
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        watch,
    },
    task::JoinHandle,
};
use tracing::{debug, trace, warn};

/// Repairs one batch of missing heights
pub struct BatchWorker {
    pub fetcher: Arc<dyn PayloadFetcher>,
    pub converter: Arc<dyn PayloadConverter>,
    pub publisher: Arc<dyn IpldPublisher>,
    pub indexer: Arc<dyn CidIndexer>,
    pub forward: Option<mpsc::Sender<ConvertedData>>,
}

impl BatchWorker {
    /// Fetch, convert, forward, publish and index `batch`. Returns how many
    /// heights were indexed; failed heights are skipped and stay gaps.
    pub async fn process(&self, batch: &[Height]) -> usize {
        let (Some(first), Some(last)) = (batch.first(), batch.last()) else {
            return 0;
        };
        let raws = match self.fetcher.fetch_at(batch).await {
            Ok(raws) => raws,
            Err(e) => {
                warn!("unable to fetch heights {first}..={last}: {e}");
                return 0;
            }
        };

        let mut indexed = 0;
        for raw in raws {
            let Some(converted) = convert(self.converter.as_ref(), &raw) else {
                continue;
            };
            if let Some(forward) = &self.forward {
                if let Err(TrySendError::Full(_)) = forward.try_send(converted.clone()) {
                    debug!(
                        "serve channel full, back-filled height {} skips live filtering",
                        raw.height
                    );
                }
            }
            if publish_then_index(self.publisher.as_ref(), self.indexer.as_ref(), &converted) {
                indexed += 1;
            }
        }
        trace!("back-filled {indexed} of {} heights in {first}..={last}", batch.len());
        indexed
    }
}

/// Fixed set of batch workers living for a single back-fill pass.
///
/// Lower batches are handed out first. [WorkerPool::stop] closes the batch
/// channel and waits for every worker to drain and exit.
pub struct WorkerPool {
    batches: priority::Sender<Vec<Height>, Reverse<Height>>,
    workers: Vec<JoinHandle<usize>>,
}

impl WorkerPool {
    pub fn start(n: usize, worker: Arc<BatchWorker>, quit: watch::Receiver<bool>) -> Self {
        let n = n.max(1);
        let (batches, receiver) = priority::bounded(n as u64);
        let workers = (0..n)
            .map(|id| {
                tokio::spawn(run_worker(
                    id,
                    worker.clone(),
                    receiver.clone(),
                    quit.clone(),
                ))
            })
            .collect();
        debug!("started {n} back-fill workers");
        Self { batches, workers }
    }

    /// Queue `batch`, waiting for room. Returns `false` once the workers are gone.
    pub async fn submit(&self, batch: Vec<Height>) -> bool {
        let priority = Reverse(batch.first().copied().unwrap_or_default());
        self.batches.send(batch, priority).await.is_ok()
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Total heights indexed by the pool once all workers exit
    pub async fn stop(self) -> usize {
        self.batches.close();
        join_all(self.workers)
            .await
            .into_iter()
            .filter_map(|joined| match joined {
                Ok(indexed) => Some(indexed),
                Err(e) => {
                    warn!("back-fill worker failed: {e}");
                    None
                }
            })
            .sum()
    }
}

async fn run_worker(
    id: usize,
    worker: Arc<BatchWorker>,
    batches: priority::Receiver<Vec<Height>, Reverse<Height>>,
    mut quit: watch::Receiver<bool>,
) -> usize {
    let mut indexed = 0;
    loop {
        let next = tokio::select! {
            _ = quit_signaled(&mut quit) => break,
            next = batches.recv() => next,
        };
        let Ok((batch, _)) = next else { break };
        indexed += worker.process(&batch).await;
    }
    trace!("back-fill worker {id} exited");
    indexed
}
