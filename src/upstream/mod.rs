//! Interfaces to the upstream node: a live feed of new payloads and a
//! batched historical fetch used by back-fill.

use crate::{chain::Height, payload::RawChainData};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};

pub mod filesystem;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("upstream i/o error: {0}")]
    Io(String),
    #[error("upstream has no payload for height {0}")]
    MissingHeight(Height),
    #[error("upstream feed is not available: {0}")]
    Unavailable(String),
    #[error("upstream watcher error: {0}")]
    Watcher(String),
}

/// Handle on a live feed. Transport errors arrive on `errors`; dropping or
/// unsubscribing stops the feed.
#[derive(Debug)]
pub struct StreamSubscription {
    pub errors: mpsc::Receiver<TransportError>,
    tasks: Vec<JoinHandle<()>>,
}

impl StreamSubscription {
    pub fn new(errors: mpsc::Receiver<TransportError>, tasks: Vec<JoinHandle<()>>) -> Self {
        Self { errors, tasks }
    }

    pub fn unsubscribe(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for StreamSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[async_trait]
pub trait PayloadStreamer: Send + Sync {
    /// Start delivering new payloads onto `payloads`, in upstream order
    async fn stream(
        &self,
        payloads: mpsc::Sender<RawChainData>,
    ) -> Result<StreamSubscription, TransportError>;
}

#[async_trait]
pub trait PayloadFetcher: Send + Sync {
    /// Fetch the payloads at `heights`; any single failure fails the batch
    async fn fetch_at(&self, heights: &[Height]) -> Result<Vec<RawChainData>, TransportError>;
}

/// File a payload for `height` is stored under
pub fn payload_file(dir: &Path, height: Height) -> PathBuf {
    dir.join(format!("{height}.json"))
}

/// Height encoded in a payload file name, `<height>.json`
pub fn height_of_payload_file(path: &Path) -> Option<Height> {
    if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
        return None;
    }
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(|stem| stem.parse().ok())
}
