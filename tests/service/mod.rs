use crate::helpers::*;
use ipld_watcher::{
    chain::ChainType,
    cid::Cid,
    filter::SubscriptionFilter,
    index::Gap,
    payload::ConvertedData,
    service::{Service, ServiceState},
    subscription::{Flag, SubscriptionPayload},
};
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, time::timeout};
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

struct Subscriber {
    id: Uuid,
    payloads: mpsc::Receiver<SubscriptionPayload>,
    quit: mpsc::Receiver<()>,
}

async fn subscribe(service: &Service, filter: SubscriptionFilter, capacity: usize) -> Subscriber {
    let id = Uuid::new_v4();
    let (payload_sender, payloads) = mpsc::channel(capacity);
    let (quit_sender, quit) = mpsc::channel(1);
    service
        .subscribe(id, payload_sender, quit_sender, filter)
        .await
        .expect("filter is valid");
    Subscriber { id, payloads, quit }
}

async fn next_payload(subscriber: &mut Subscriber) -> Option<SubscriptionPayload> {
    timeout(WAIT, subscriber.payloads.recv())
        .await
        .expect("payload arrives in time")
}

fn converted(stores: &Stores, height: u64) -> ConvertedData {
    stores
        .components
        .converter
        .convert(&raw_eth(height))
        .expect("fixture converts")
}

#[tokio::test]
async fn sync_publishes_and_indexes() -> anyhow::Result<()> {
    let stores = Stores::new("sync")?;
    let service = stores.service(2, 16);
    let streamer = MemoryStreamer::new(vec![raw_eth(100)]);
    let (forward, mut forwarded) = mpsc::channel(16);

    let sync = service.sync(&streamer, forward, 16).await?;
    assert_eq!(service.state(), ServiceState::Syncing);
    timeout(WAIT, sync).await??;

    let headers = stores.index_store.headers_at(100)?;
    assert_eq!(headers.len(), 1);
    let txs = stores.index_store.transactions_of(&headers[0])?;
    assert_eq!(txs.len(), 2);
    assert_eq!(txs[0].src, vec!["0xa".to_string()]);
    assert_eq!(txs[0].dst, vec!["0xb".to_string()]);

    let live = forwarded.try_recv()?;
    assert_eq!(live.height(), 100);
    Ok(())
}

#[tokio::test]
async fn malformed_payloads_are_skipped() -> anyhow::Result<()> {
    let stores = Stores::new("sync-malformed")?;
    let service = stores.service(1, 16);
    let mut garbage = raw_eth(2);
    garbage.data = b"not json".to_vec();
    let streamer = MemoryStreamer::new(vec![raw_eth(1), garbage, raw_eth(3)]);
    let (forward, _forwarded) = mpsc::channel(16);

    timeout(WAIT, service.sync(&streamer, forward, 16).await?).await??;

    assert_eq!(
        stores.components.retriever.retrieve_gaps_in_data()?,
        vec![Gap { start: 2, stop: 2 }]
    );
    Ok(())
}

#[tokio::test]
async fn failed_index_leaves_a_gap() -> anyhow::Result<()> {
    let mut stores = Stores::new("sync-failing-index")?;
    stores.components.indexer = Arc::new(FailingIndexer::new(
        stores.components.indexer.clone(),
        [2],
    ));
    let service = stores.service(3, 16);
    let streamer = MemoryStreamer::new((1..=4).map(raw_eth).collect());
    let (forward, _forwarded) = mpsc::channel(16);

    timeout(WAIT, service.sync(&streamer, forward, 16).await?).await??;

    assert_eq!(
        stores.components.retriever.retrieve_gaps_in_data()?,
        vec![Gap { start: 2, stop: 2 }]
    );
    Ok(())
}

#[tokio::test]
async fn saturated_work_queue_keeps_the_head() -> anyhow::Result<()> {
    let stores = Stores::new("sync-backpressure")?;
    let service = stores.service(1, 4);
    let streamer = MemoryStreamer::new((1..=200).map(raw_eth).collect());
    // the serve side never reads
    let (forward, _forwarded) = mpsc::channel(1);

    timeout(WAIT * 6, service.sync(&streamer, forward, 8).await?).await??;

    assert_eq!(
        stores.components.retriever.retrieve_last_block_number()?,
        Some(200)
    );
    Ok(())
}

#[tokio::test]
async fn live_subscription_receives_filtered_payloads() -> anyhow::Result<()> {
    let stores = Stores::new("serve")?;
    let service = stores.service(1, 16);
    let (forward, payloads) = mpsc::channel(16);
    let serve = service.serve(payloads);
    assert_eq!(service.state(), ServiceState::Serving);

    let mut filter = SubscriptionFilter::new(ChainType::Ethereum, 0, 0);
    filter.txs.dst = vec!["0xB".into()];
    filter.receipts.match_txs = true;
    filter.header.off = true;
    filter.state.off = true;
    filter.storage.off = true;
    let mut subscriber = subscribe(&service, filter, 16).await;

    forward.send(converted(&stores, 100)).await?;
    let payload = next_payload(&mut subscriber).await.expect("subscription is open");
    assert_eq!(payload.height, 100);
    assert_eq!(payload.flag, Flag::None);
    assert!(!payload.is_error());

    let bundle = payload.bundle()?;
    assert!(bundle.headers.is_empty());
    assert_eq!(bundle.transactions.len(), 1);
    assert_eq!(bundle.transactions[0].cid, Cid::of(b"tx 100 0"));
    assert_eq!(bundle.receipts.len(), 1);
    assert_eq!(bundle.receipts[0].cid, Cid::of(b"receipt 100 0"));

    service.stop().await;
    timeout(WAIT, serve).await??;
    Ok(())
}

#[tokio::test]
async fn subscription_closes_past_its_end() -> anyhow::Result<()> {
    let stores = Stores::new("serve-past-end")?;
    let service = stores.service(1, 16);
    let mut subscriber = subscribe(
        &service,
        SubscriptionFilter::new(ChainType::Ethereum, 0, 50),
        16,
    )
    .await;
    assert_eq!(service.subscription_count().await, 1);

    service.broadcast(&converted(&stores, 50)).await;
    assert_eq!(next_payload(&mut subscriber).await.map(|p| p.height), Some(50));

    service.broadcast(&converted(&stores, 51)).await;
    assert_eq!(timeout(WAIT, subscriber.quit.recv()).await?, Some(()));
    assert_eq!(service.subscription_count().await, 0);
    assert_eq!(service.subscription_type_count().await, 0);

    service.broadcast(&converted(&stores, 52)).await;
    assert_eq!(next_payload(&mut subscriber).await, None);
    Ok(())
}

#[tokio::test]
async fn filter_errors_close_only_that_type() -> anyhow::Result<()> {
    let stores = Stores::new("serve-filter-error")?;
    let service = stores.service(1, 16);
    let mut subscriber = subscribe(
        &service,
        SubscriptionFilter::new(ChainType::Ethereum, 0, 0),
        16,
    )
    .await;

    let mut foreign = converted(&stores, 9);
    foreign.chain = ChainType::Bitcoin;
    service.broadcast(&foreign).await;

    let payload = next_payload(&mut subscriber).await.expect("error payload");
    assert!(payload.is_error());
    assert_eq!(payload.height, 9);
    assert_eq!(timeout(WAIT, subscriber.quit.recv()).await?, Some(()));
    assert_eq!(service.subscription_type_count().await, 0);

    // the service keeps serving new subscriptions
    let mut next = subscribe(
        &service,
        SubscriptionFilter::new(ChainType::Ethereum, 0, 0),
        16,
    )
    .await;
    service.broadcast(&converted(&stores, 10)).await;
    assert_eq!(next_payload(&mut next).await.map(|p| p.height), Some(10));
    Ok(())
}

#[tokio::test]
async fn invalid_filters_are_rejected() -> anyhow::Result<()> {
    let stores = Stores::new("serve-invalid")?;
    let service = stores.service(1, 16);
    let (payloads, _) = mpsc::channel(1);
    let (quit, _) = mpsc::channel(1);

    let inverted = SubscriptionFilter::new(ChainType::Ethereum, 10, 5);
    assert!(service
        .subscribe(Uuid::new_v4(), payloads.clone(), quit.clone(), inverted)
        .await
        .is_err());

    let bitcoin = SubscriptionFilter::new(ChainType::Bitcoin, 0, 0);
    assert!(service
        .subscribe(Uuid::new_v4(), payloads, quit, bitcoin)
        .await
        .is_err());
    assert_eq!(service.subscription_count().await, 0);
    Ok(())
}

#[tokio::test]
async fn lagging_subscriber_does_not_block_broadcast() -> anyhow::Result<()> {
    let stores = Stores::new("serve-lagging")?;
    let service = stores.service(1, 16);
    let filter = SubscriptionFilter::new(ChainType::Ethereum, 0, 0);
    let mut slow = subscribe(&service, filter.clone(), 1).await;
    let mut fast = subscribe(&service, filter, 16).await;
    assert_eq!(service.subscription_type_count().await, 1);

    for height in 1..=3 {
        timeout(WAIT, service.broadcast(&converted(&stores, height))).await?;
    }

    for height in 1..=3 {
        assert_eq!(next_payload(&mut fast).await.map(|p| p.height), Some(height));
    }
    assert_eq!(next_payload(&mut slow).await.map(|p| p.height), Some(1));
    assert!(slow.payloads.try_recv().is_err());
    assert_eq!(service.subscription_count().await, 2);
    Ok(())
}

#[tokio::test]
async fn unsubscribe_drops_empty_types() -> anyhow::Result<()> {
    let stores = Stores::new("unsubscribe")?;
    let service = stores.service(1, 16);
    let mut filter = SubscriptionFilter::new(ChainType::Ethereum, 0, 0);
    filter.txs.src = vec!["0xA".into()];
    let first = subscribe(&service, filter.clone(), 4).await;
    // same type once normalized
    filter.txs.src = vec!["0xa".into()];
    let second = subscribe(&service, filter, 4).await;
    assert_eq!(service.subscription_type_count().await, 1);
    assert_eq!(service.subscription_count().await, 2);

    assert!(service.unsubscribe(first.id).await);
    assert_eq!(service.subscription_type_count().await, 1);
    assert!(service.unsubscribe(second.id).await);
    assert_eq!(service.subscription_type_count().await, 0);
    assert!(!service.unsubscribe(Uuid::new_v4()).await);
    Ok(())
}

#[tokio::test]
async fn historical_only_replay_ends_with_sentinel() -> anyhow::Result<()> {
    let stores = Stores::new("historical-only")?;
    stores.index_heights(&[1, 2, 3])?;
    let service = stores.service(1, 16);

    let mut filter = SubscriptionFilter::new(ChainType::Ethereum, 2, 0);
    filter.historical_only = true;
    let mut subscriber = subscribe(&service, filter, 16).await;
    assert_eq!(service.subscription_count().await, 0);

    let second = next_payload(&mut subscriber).await.expect("height 2");
    assert_eq!(second.height, 2);
    assert_eq!(second.bundle()?.transactions.len(), 2);
    assert_eq!(next_payload(&mut subscriber).await.map(|p| p.height), Some(3));

    let sentinel = next_payload(&mut subscriber).await.expect("sentinel");
    assert_eq!(sentinel.flag, Flag::BackFillComplete);
    assert_eq!(sentinel.height, 3);
    assert_eq!(next_payload(&mut subscriber).await, None);
    Ok(())
}

#[tokio::test]
async fn historical_replay_then_live() -> anyhow::Result<()> {
    let stores = Stores::new("historical-live")?;
    stores.index_heights(&[1, 2])?;
    let service = stores.service(1, 16);

    let mut filter = SubscriptionFilter::new(ChainType::Ethereum, 0, 0);
    filter.historical = true;
    let mut subscriber = subscribe(&service, filter, 16).await;
    assert_eq!(service.subscription_count().await, 1);

    assert_eq!(next_payload(&mut subscriber).await.map(|p| p.height), Some(1));
    assert_eq!(next_payload(&mut subscriber).await.map(|p| p.height), Some(2));
    assert_eq!(
        next_payload(&mut subscriber).await.map(|p| p.flag),
        Some(Flag::BackFillComplete)
    );

    service.broadcast(&converted(&stores, 3)).await;
    assert_eq!(next_payload(&mut subscriber).await.map(|p| p.height), Some(3));
    Ok(())
}

#[tokio::test]
async fn historical_replay_of_an_empty_index() -> anyhow::Result<()> {
    let stores = Stores::new("historical-empty")?;
    let service = stores.service(1, 16);
    let mut filter = SubscriptionFilter::new(ChainType::Ethereum, 0, 0);
    filter.historical_only = true;
    let mut subscriber = subscribe(&service, filter, 16).await;

    let sentinel = next_payload(&mut subscriber).await.expect("sentinel");
    assert_eq!(sentinel.flag, Flag::BackFillComplete);
    assert_eq!(sentinel.height, 0);
    Ok(())
}

#[tokio::test]
async fn stop_closes_every_subscription() -> anyhow::Result<()> {
    let stores = Stores::new("stop")?;
    let service = stores.service(1, 16);
    let mut first = subscribe(
        &service,
        SubscriptionFilter::new(ChainType::Ethereum, 0, 0),
        4,
    )
    .await;
    let mut second = subscribe(
        &service,
        SubscriptionFilter::new(ChainType::Ethereum, 5, 0),
        4,
    )
    .await;

    service.stop().await;
    assert_eq!(service.state(), ServiceState::Stopped);
    assert_eq!(service.subscription_count().await, 0);
    assert_eq!(timeout(WAIT, first.quit.recv()).await?, Some(()));
    assert_eq!(timeout(WAIT, second.quit.recv()).await?, Some(()));
    assert_eq!(next_payload(&mut first).await, None);
    Ok(())
}
