//! The watcher service: ingests the live feed, publishes and indexes every
//! payload, and fans filtered data out to subscribers.

use crate::{
    chain::{ChainType, Height},
    constants::SENTINEL_SEND_TIMEOUT,
    content_store::ContentStore,
    filter::{
        response::{new_response_filterer, ResponseFilterer},
        FilterError, FilterKey, SubscriptionFilter,
    },
    index::{new_cid_indexer, new_cid_retriever, store::IndexerStore, CidIndexer, CidRetriever},
    ipld_fetcher::IpldFetcher,
    payload::{new_converter, ConvertedData, PayloadConverter, RawChainData},
    publisher::{new_publisher, IpldPublisher},
    queue::{work_queue, WorkReceiver},
    subscription::{NodeInfo, Subscription, SubscriptionPayload},
    upstream::PayloadStreamer,
};
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        watch, Mutex,
    },
    task::JoinHandle,
};
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

/// The chain-specific capabilities a [Service] is assembled from
#[derive(Clone)]
pub struct Components {
    pub converter: Arc<dyn PayloadConverter>,
    pub publisher: Arc<dyn IpldPublisher>,
    pub indexer: Arc<dyn CidIndexer>,
    pub retriever: Arc<dyn CidRetriever>,
    pub filterer: Arc<dyn ResponseFilterer>,
    pub content_store: Arc<dyn ContentStore>,
}

impl Components {
    pub fn new(
        chain: ChainType,
        content_store: Arc<dyn ContentStore>,
        index_store: Arc<IndexerStore>,
        backfill_from_genesis: bool,
    ) -> Self {
        Self {
            converter: new_converter(chain),
            publisher: new_publisher(chain, content_store.clone()),
            indexer: new_cid_indexer(chain, index_store.clone()),
            retriever: new_cid_retriever(chain, index_store, backfill_from_genesis),
            filterer: new_response_filterer(chain),
            content_store,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Idle,
    Syncing,
    Serving,
    SyncingAndServing,
    Stopped,
}

impl ServiceState {
    fn with_sync(self) -> Self {
        match self {
            Self::Idle | Self::Syncing => Self::Syncing,
            Self::Serving | Self::SyncingAndServing => Self::SyncingAndServing,
            Self::Stopped => Self::Stopped,
        }
    }

    fn with_serve(self) -> Self {
        match self {
            Self::Idle | Self::Serving => Self::Serving,
            Self::Syncing | Self::SyncingAndServing => Self::SyncingAndServing,
            Self::Stopped => Self::Stopped,
        }
    }
}

/// Subscribers sharing one filter
#[derive(Debug)]
struct SubscriptionType {
    filter: SubscriptionFilter,
    subscribers: HashMap<Uuid, Subscription>,
}

type SubscriptionTable = HashMap<FilterKey, SubscriptionType>;

#[derive(Clone)]
pub struct Service {
    chain: ChainType,
    components: Components,
    fetcher: IpldFetcher,
    node: NodeInfo,
    workers: usize,
    work_queue_size: usize,
    subscriptions: Arc<Mutex<SubscriptionTable>>,
    quit: Arc<watch::Sender<bool>>,
    state: Arc<watch::Sender<ServiceState>>,
}

impl Service {
    pub fn new(
        chain: ChainType,
        components: Components,
        node: NodeInfo,
        workers: usize,
        work_queue_size: usize,
    ) -> Self {
        let (quit, _) = watch::channel(false);
        let (state, _) = watch::channel(ServiceState::Idle);
        Self {
            chain,
            fetcher: IpldFetcher::new(components.content_store.clone()),
            components,
            node,
            workers: workers.max(1),
            work_queue_size,
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            quit: Arc::new(quit),
            state: Arc::new(state),
        }
    }

    pub fn chain(&self) -> ChainType {
        self.chain
    }

    pub fn node(&self) -> NodeInfo {
        self.node.clone()
    }

    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    pub fn components(&self) -> &Components {
        &self.components
    }

    /// Receiver observing the service-wide quit signal
    pub fn quit_receiver(&self) -> watch::Receiver<bool> {
        self.quit.subscribe()
    }

    /// Start the live feed. Every payload is converted, best-effort forwarded
    /// on `forward` for live filtering, and queued for the publish/index
    /// workers. The returned task finishes once the feed ends or the service
    /// stops, after its workers have exited.
    pub async fn sync(
        &self,
        streamer: &dyn PayloadStreamer,
        forward: mpsc::Sender<ConvertedData>,
        payload_capacity: usize,
    ) -> anyhow::Result<JoinHandle<()>> {
        let (payload_sender, mut payload_receiver) = mpsc::channel(payload_capacity.max(1));
        let mut subscription = streamer.stream(payload_sender).await?;
        self.state.send_modify(|state| *state = state.with_sync());

        let (queue, work) = work_queue(self.work_queue_size);
        let workers: Vec<JoinHandle<()>> = (0..self.workers)
            .map(|n| {
                tokio::spawn(publish_and_index(
                    n,
                    work.clone(),
                    self.components.publisher.clone(),
                    self.components.indexer.clone(),
                    self.quit.subscribe(),
                ))
            })
            .collect();
        info!("Syncing with {} publish/index workers", workers.len());

        let converter = self.components.converter.clone();
        let mut quit = self.quit.subscribe();
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = quit_signaled(&mut quit) => {
                        debug!("sync loop received quit signal");
                        break;
                    }
                    Some(e) = subscription.errors.recv() => {
                        error!("upstream transport error: {e}");
                    }
                    raw = payload_receiver.recv() => {
                        let Some(raw) = raw else {
                            info!("upstream feed ended");
                            break;
                        };
                        let Some(converted) = convert(converter.as_ref(), &raw) else { continue };

                        match forward.try_send(converted.clone()) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                debug!(
                                    "serve channel full, height {} skips live filtering",
                                    raw.height
                                );
                            }
                            Err(TrySendError::Closed(_)) => {
                                trace!("serve channel closed");
                            }
                        }

                        match queue.push(converted).await {
                            Ok(None) => {}
                            Ok(Some(evicted)) => {
                                warn!("work queue full, evicted height {}", evicted.height());
                            }
                            Err(e) => {
                                error!("{e}");
                                break;
                            }
                        }
                    }
                }
            }

            subscription.unsubscribe();
            drop(queue);
            for worker in workers {
                let _ = worker.await;
            }
            debug!("sync loop exited");
        }))
    }

    /// Start the live fan-out of converted payloads to subscribers
    pub fn serve(&self, mut payloads: mpsc::Receiver<ConvertedData>) -> JoinHandle<()> {
        self.state.send_modify(|state| *state = state.with_serve());
        let service = self.clone();
        let mut quit = self.quit.subscribe();
        tokio::spawn(async move {
            info!("Serving subscriptions");
            loop {
                tokio::select! {
                    _ = quit_signaled(&mut quit) => break,
                    payload = payloads.recv() => match payload {
                        Some(payload) => service.broadcast(&payload).await,
                        None => break,
                    }
                }
            }
            debug!("serve loop exited");
        })
    }

    /// Filter `payload` once per subscription type and deliver the result to
    /// every subscriber of that type without blocking
    #[instrument(skip_all, fields(height = payload.height()))]
    pub async fn broadcast(&self, payload: &ConvertedData) {
        let height = payload.height();
        let filterer = self.components.filterer.clone();
        let mut table = self.subscriptions.lock().await;

        table.retain(|key, sub_type| {
            if sub_type.filter.past_end(height) {
                info!("closing subscriptions of type {key}: height {height} is past their range");
                for sub in sub_type.subscribers.values() {
                    let _ = sub.quit.try_send(());
                }
                return false;
            }

            let bundle = match filterer.filter(&sub_type.filter, payload) {
                Ok(bundle) => bundle,
                Err(e) => {
                    error!("closing subscriptions of type {key}: {e}");
                    for sub in sub_type.subscribers.values() {
                        let _ = sub.payloads.try_send(SubscriptionPayload::error(height, &e));
                        let _ = sub.quit.try_send(());
                    }
                    return false;
                }
            };
            if bundle.is_empty() {
                return true;
            }
            let data = match bundle.encode() {
                Ok(data) => data,
                Err(e) => {
                    error!("unable to encode response for type {key}: {e}");
                    return true;
                }
            };

            sub_type.subscribers.retain(|id, sub| {
                match sub.payloads.try_send(SubscriptionPayload::data(height, data.clone())) {
                    Ok(()) => true,
                    Err(TrySendError::Full(_)) => {
                        debug!("subscriber {id} is lagging, dropping height {height}");
                        true
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!("subscriber {id} went away");
                        false
                    }
                }
            });
            !sub_type.subscribers.is_empty()
        });
    }

    /// Register a subscriber. Historical filters get an indexed replay
    /// followed by a back-fill complete sentinel; historical-only filters
    /// never join the live broadcast.
    pub async fn subscribe(
        &self,
        id: Uuid,
        payloads: mpsc::Sender<SubscriptionPayload>,
        quit: mpsc::Sender<()>,
        filter: SubscriptionFilter,
    ) -> Result<(), FilterError> {
        filter.validate(self.chain)?;
        let filter = filter.normalized();
        let key = filter.type_key()?;
        let sub = Subscription::new(id, payloads, quit);
        info!("New subscription {id} of type {key}");

        if filter.historical_data() || filter.historical_data_only() {
            tokio::spawn(send_historical(
                self.components.retriever.clone(),
                self.fetcher.clone(),
                filter.clone(),
                sub.clone(),
                self.quit.subscribe(),
            ));
        }

        if !filter.historical_data_only() {
            self.subscriptions
                .lock()
                .await
                .entry(key)
                .or_insert_with(|| SubscriptionType {
                    filter,
                    subscribers: HashMap::new(),
                })
                .subscribers
                .insert(id, sub);
        }
        Ok(())
    }

    /// Remove `id` from every subscription type, dropping types left empty
    pub async fn unsubscribe(&self, id: Uuid) -> bool {
        let mut found = false;
        self.subscriptions.lock().await.retain(|_, sub_type| {
            found |= sub_type.subscribers.remove(&id).is_some();
            !sub_type.subscribers.is_empty()
        });
        if found {
            info!("Unsubscribed {id}");
        }
        found
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscriptions
            .lock()
            .await
            .values()
            .map(|sub_type| sub_type.subscribers.len())
            .sum()
    }

    pub async fn subscription_type_count(&self) -> usize {
        self.subscriptions.lock().await.len()
    }

    /// Signal every loop to quit and close all live subscriptions
    pub async fn stop(&self) {
        info!("Stopping service");
        self.quit.send_replace(true);
        let mut table = self.subscriptions.lock().await;
        for sub in table.values().flat_map(|sub_type| sub_type.subscribers.values()) {
            let _ = sub.quit.try_send(());
        }
        table.clear();
        self.state.send_replace(ServiceState::Stopped);
    }
}

/// Resolves once `quit` carries `true` or its sender is gone
pub(crate) async fn quit_signaled(quit: &mut watch::Receiver<bool>) {
    loop {
        let quit_now = *quit.borrow_and_update();
        if quit_now || quit.changed().await.is_err() {
            return;
        }
    }
}

pub(crate) fn convert(
    converter: &dyn PayloadConverter,
    raw: &RawChainData,
) -> Option<ConvertedData> {
    match converter.convert(raw) {
        Ok(converted) => Some(converted),
        Err(e) => {
            error!("unable to convert payload at height {}: {e}", raw.height);
            None
        }
    }
}

/// Publish then index one payload, logging rather than propagating failures
pub(crate) fn publish_then_index(
    publisher: &dyn IpldPublisher,
    indexer: &dyn CidIndexer,
    payload: &ConvertedData,
) -> bool {
    let height = payload.height();
    let cids = match publisher.publish(payload) {
        Ok(cids) => cids,
        Err(e) => {
            error!("unable to publish height {height}: {e}");
            return false;
        }
    };
    if let Err(e) = indexer.index(&cids) {
        error!("unable to index height {height}: {e}");
        return false;
    }
    trace!("published and indexed height {height}");
    true
}

async fn publish_and_index(
    n: usize,
    work: WorkReceiver<ConvertedData>,
    publisher: Arc<dyn IpldPublisher>,
    indexer: Arc<dyn CidIndexer>,
    mut quit: watch::Receiver<bool>,
) {
    debug!("publish/index worker {n} started");
    loop {
        let payload = tokio::select! {
            _ = quit_signaled(&mut quit) => break,
            payload = work.recv() => payload,
        };
        let Some(payload) = payload else { break };
        publish_then_index(publisher.as_ref(), indexer.as_ref(), &payload);
    }
    debug!("publish/index worker {n} exited");
}

#[instrument(skip_all, fields(subscription = %sub.id))]
async fn send_historical(
    retriever: Arc<dyn CidRetriever>,
    fetcher: IpldFetcher,
    filter: SubscriptionFilter,
    sub: Subscription,
    quit: watch::Receiver<bool>,
) {
    let (first, last) = match (
        retriever.retrieve_first_block_number(),
        retriever.retrieve_last_block_number(),
    ) {
        (Ok(first), Ok(last)) => (first, last),
        (Err(e), _) | (_, Err(e)) => {
            error!("unable to determine indexed range: {e}");
            let _ = sub.payloads.try_send(SubscriptionPayload::error(0, &e));
            return;
        }
    };

    let mut sentinel_height = 0;
    if let Some((start, end)) = historical_range(&filter, first, last) {
        debug!("Sending historical data for heights {start}..={end}");
        for height in start..=end {
            let quit_now = *quit.borrow();
            if quit_now || sub.is_closed() {
                return;
            }
            sentinel_height = height;
            let Some(payload) = historical_payload(retriever.as_ref(), &fetcher, &filter, height)
            else {
                continue;
            };
            match sub.payloads.try_send(payload) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    debug!("subscriber is lagging, dropping historical height {height}");
                }
                Err(TrySendError::Closed(_)) => return,
            }
        }
    }

    let sentinel = SubscriptionPayload::backfill_complete(sentinel_height);
    match tokio::time::timeout(SENTINEL_SEND_TIMEOUT, sub.payloads.send(sentinel)).await {
        Ok(Ok(())) => debug!("historical data sent"),
        Ok(Err(_)) => debug!("subscriber went away before back-fill completed"),
        Err(_) => warn!("timed out sending back-fill complete"),
    }
}

/// Overlap of the indexed heights with the filter's range
fn historical_range(
    filter: &SubscriptionFilter,
    first: Option<Height>,
    last: Option<Height>,
) -> Option<(Height, Height)> {
    let (first, last) = (first?, last?);
    let start = first.max(filter.start.max(0) as Height);
    let end = if filter.end > 0 {
        last.min(filter.end as Height)
    } else {
        last
    };
    (start <= end).then_some((start, end))
}

fn historical_payload(
    retriever: &dyn CidRetriever,
    fetcher: &IpldFetcher,
    filter: &SubscriptionFilter,
    height: Height,
) -> Option<SubscriptionPayload> {
    let cids = match retriever.retrieve(filter, height) {
        Ok((_, true)) => return None,
        Ok((cids, false)) => cids,
        Err(e) => {
            error!("unable to retrieve height {height}: {e}");
            return Some(SubscriptionPayload::error(height, e));
        }
    };
    let bundle = match fetcher.fetch(&cids) {
        Ok(bundle) => bundle,
        Err(e) => {
            error!("unable to fetch objects at height {height}: {e}");
            return Some(SubscriptionPayload::error(height, e));
        }
    };
    match bundle.encode() {
        Ok(data) => Some(SubscriptionPayload::data(height, data)),
        Err(e) => Some(SubscriptionPayload::error(height, e)),
    }
}
