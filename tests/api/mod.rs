use crate::helpers::*;
use ipld_watcher::{
    api::{self, Request, SubscribeResponse, UnsubscribeResponse},
    chain::ChainType,
    filter::SubscriptionFilter,
    subscription::{Flag, NodeInfo, SubscriptionPayload},
};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tempfile::TempDir;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::{
        unix::{OwnedReadHalf, OwnedWriteHalf},
        UnixStream,
    },
    time::timeout,
};

const WAIT: Duration = Duration::from_secs(5);

struct Conn {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Conn {
    async fn open(socket: &Path) -> anyhow::Result<Self> {
        let (reader, writer) = UnixStream::connect(socket).await?.into_split();
        Ok(Self {
            lines: BufReader::new(reader).lines(),
            writer,
        })
    }

    async fn send(&mut self, line: &str) -> anyhow::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        Ok(())
    }

    async fn request(&mut self, request: &Request) -> anyhow::Result<()> {
        self.send(&serde_json::to_string(request)?).await
    }

    async fn read<T: serde::de::DeserializeOwned>(&mut self) -> anyhow::Result<T> {
        let line = timeout(WAIT, self.lines.next_line())
            .await??
            .ok_or_else(|| anyhow::anyhow!("connection closed"))?;
        Ok(serde_json::from_str(&line)?)
    }

    async fn closed(&mut self) -> anyhow::Result<bool> {
        Ok(timeout(WAIT, self.lines.next_line()).await??.is_none())
    }
}

fn socket_path(dir: &TempDir) -> PathBuf {
    dir.path().join("run").join("ipld-watcher.sock")
}

#[tokio::test]
async fn node_info_over_the_socket() -> anyhow::Result<()> {
    let stores = Stores::new("api-node-info")?;
    let service = stores.service(1, 16);
    let socket_dir = setup_new_db_dir("api-node-info-socket")?;
    let socket = socket_path(&socket_dir);
    let server = api::start(&socket, service.clone())?;

    let mut conn = Conn::open(&socket).await?;
    conn.request(&Request::NodeInfo).await?;
    let info: NodeInfo = conn.read().await?;
    assert_eq!(info, node_info());
    assert!(conn.closed().await?);

    service.stop().await;
    timeout(WAIT, server).await??;
    Ok(())
}

#[tokio::test]
async fn subscription_streams_until_unsubscribed() -> anyhow::Result<()> {
    let stores = Stores::new("api-subscribe")?;
    let service = stores.service(1, 16);
    let socket_dir = setup_new_db_dir("api-subscribe-socket")?;
    let socket = socket_path(&socket_dir);
    let _server = api::start(&socket, service.clone())?;

    let mut filter = SubscriptionFilter::new(ChainType::Ethereum, 0, 0);
    filter.txs.dst = vec!["0xB".into()];
    let mut subscriber = Conn::open(&socket).await?;
    subscriber.request(&Request::Subscribe(filter)).await?;
    let SubscribeResponse { subscription } = subscriber.read().await?;
    assert_eq!(service.subscription_count().await, 1);

    let converted = stores.components.converter.convert(&raw_eth(42))?;
    service.broadcast(&converted).await;
    let payload: SubscriptionPayload = subscriber.read().await?;
    assert_eq!(payload.height, 42);
    assert_eq!(payload.flag, Flag::None);
    assert!(!payload.is_error());
    assert_eq!(payload.bundle()?.transactions.len(), 1);

    let mut control = Conn::open(&socket).await?;
    control.request(&Request::Unsubscribe(subscription)).await?;
    let response: UnsubscribeResponse = control.read().await?;
    assert!(response.unsubscribed);
    assert!(subscriber.closed().await?);
    assert_eq!(service.subscription_count().await, 0);

    let mut again = Conn::open(&socket).await?;
    again.request(&Request::Unsubscribe(subscription)).await?;
    let response: UnsubscribeResponse = again.read().await?;
    assert!(!response.unsubscribed);
    Ok(())
}

#[tokio::test]
async fn disconnecting_unsubscribes() -> anyhow::Result<()> {
    let stores = Stores::new("api-disconnect")?;
    let service = stores.service(1, 16);
    let socket_dir = setup_new_db_dir("api-disconnect-socket")?;
    let socket = socket_path(&socket_dir);
    let _server = api::start(&socket, service.clone())?;

    let mut subscriber = Conn::open(&socket).await?;
    subscriber
        .request(&Request::Subscribe(SubscriptionFilter::new(
            ChainType::Ethereum,
            0,
            0,
        )))
        .await?;
    let _: SubscribeResponse = subscriber.read().await?;
    assert_eq!(service.subscription_count().await, 1);
    drop(subscriber);

    timeout(WAIT, async {
        while service.subscription_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn rejected_requests_get_an_error() -> anyhow::Result<()> {
    let stores = Stores::new("api-errors")?;
    let service = stores.service(1, 16);
    let socket_dir = setup_new_db_dir("api-errors-socket")?;
    let socket = socket_path(&socket_dir);
    let _server = api::start(&socket, service.clone())?;

    let mut malformed = Conn::open(&socket).await?;
    malformed.send(r#"{"method":"resubscribe"}"#).await?;
    let error: serde_json::Value = malformed.read().await?;
    assert!(error["error"]
        .as_str()
        .is_some_and(|e| e.starts_with("malformed request")));

    let mut inverted = Conn::open(&socket).await?;
    inverted
        .request(&Request::Subscribe(SubscriptionFilter::new(
            ChainType::Ethereum,
            9,
            3,
        )))
        .await?;
    let payload: SubscriptionPayload = inverted.read().await?;
    assert!(payload.is_error());
    assert!(inverted.closed().await?);
    assert_eq!(service.subscription_count().await, 0);
    Ok(())
}

#[tokio::test]
async fn stopping_the_service_ends_subscriptions() -> anyhow::Result<()> {
    let stores = Stores::new("api-stop")?;
    let service = stores.service(1, 16);
    let socket_dir = setup_new_db_dir("api-stop-socket")?;
    let socket = socket_path(&socket_dir);
    let server = api::start(&socket, service.clone())?;

    let mut subscriber = Conn::open(&socket).await?;
    subscriber
        .request(&Request::Subscribe(SubscriptionFilter::new(
            ChainType::Ethereum,
            0,
            0,
        )))
        .await?;
    let _: SubscribeResponse = subscriber.read().await?;

    service.stop().await;
    assert!(subscriber.closed().await?);
    timeout(WAIT, server).await??;
    Ok(())
}
