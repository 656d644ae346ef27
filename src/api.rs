//! Subscriber API over a Unix domain socket.
//!
//! Each connection sends one JSON request line. `subscribe` connections are
//! answered with `{"subscription":"<id>"}` followed by one payload per line
//! until the subscription ends; closing the connection unsubscribes.

use crate::{
    constants::SUBSCRIPTION_CHAN_SIZE,
    filter::SubscriptionFilter,
    service::{quit_signaled, Service},
    subscription::SubscriptionPayload,
};
use serde_derive::{Deserialize, Serialize};
use std::path::Path;
use tokio::{
    io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{UnixListener, UnixStream},
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum Request {
    Subscribe(SubscriptionFilter),
    Unsubscribe(Uuid),
    NodeInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeResponse {
    pub subscription: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeResponse {
    pub unsubscribed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Bind `socket` and serve requests until the service stops
pub fn start(socket: &Path, service: Service) -> anyhow::Result<JoinHandle<()>> {
    remove_socket(socket);
    if let Some(parent) = socket.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(socket)?;
    info!("Unix socket server running on {}", socket.display());
    Ok(tokio::spawn(run(listener, service)))
}

pub fn remove_socket(socket: &Path) {
    if socket.exists() {
        debug!("Removing old socket {}", socket.display());
        if let Err(e) = std::fs::remove_file(socket) {
            warn!("unable to remove {}: {e}", socket.display());
        }
    }
}

async fn run(listener: UnixListener, service: Service) {
    let mut quit = service.quit_receiver();
    loop {
        tokio::select! {
            _ = quit_signaled(&mut quit) => break,
            client = listener.accept() => match client {
                Ok((socket, _)) => {
                    let service = service.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_conn(socket, service).await {
                            error!("Unable to process Unix socket request: {e}");
                        }
                    });
                }
                Err(e) => error!("Failed to accept connection: {e}"),
            }
        }
    }
    debug!("unix socket server exited");
}

#[instrument(skip_all)]
async fn handle_conn(conn: UnixStream, service: Service) -> anyhow::Result<()> {
    let (reader, mut writer) = conn.into_split();
    let mut lines = BufReader::new(reader).lines();
    let Some(line) = lines.next_line().await? else {
        return Ok(());
    };

    let request = match serde_json::from_str::<Request>(&line) {
        Ok(request) => request,
        Err(e) => {
            warn!("Malformed request: {e}");
            let error = ErrorResponse {
                error: format!("malformed request: {e}"),
            };
            return write_line(&mut writer, &error).await;
        }
    };

    match request {
        Request::NodeInfo => {
            info!("Received node_info request");
            write_line(&mut writer, &service.node()).await
        }
        Request::Unsubscribe(id) => {
            info!("Received unsubscribe request for {id}");
            let unsubscribed = service.unsubscribe(id).await;
            write_line(&mut writer, &UnsubscribeResponse { unsubscribed }).await
        }
        Request::Subscribe(filter) => {
            let id = Uuid::new_v4();
            let (payload_sender, mut payloads) = mpsc::channel(SUBSCRIPTION_CHAN_SIZE);
            let (quit_sender, mut quit) = mpsc::channel(1);
            if let Err(e) = service.subscribe(id, payload_sender, quit_sender, filter).await {
                warn!("Rejected subscription: {e}");
                return write_line(&mut writer, &SubscriptionPayload::error(0, e)).await;
            }
            write_line(&mut writer, &SubscribeResponse { subscription: id }).await?;

            let streamed = loop {
                tokio::select! {
                    payload = payloads.recv() => match payload {
                        Some(payload) => {
                            if let Err(e) = write_line(&mut writer, &payload).await {
                                break Err(e);
                            }
                        }
                        None => break Ok(()),
                    },
                    _ = quit.recv() => {
                        while let Ok(payload) = payloads.try_recv() {
                            write_line(&mut writer, &payload).await?;
                        }
                        break Ok(());
                    }
                    line = lines.next_line() => {
                        if !matches!(line, Ok(Some(_))) {
                            debug!("subscriber {id} disconnected");
                            break Ok(());
                        }
                    }
                }
            };
            service.unsubscribe(id).await;
            streamed
        }
    }
}

async fn write_line<W, T>(writer: &mut W, value: &T) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    Ok(())
}
