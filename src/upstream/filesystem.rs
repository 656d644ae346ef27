//! Directory-backed upstream. A node (or a relay in front of it) drops one
//! `<height>.json` payload file per new head into the watch directory, and
//! keeps historical payloads in an archive directory under the same naming.

use super::{
    height_of_payload_file, payload_file, PayloadFetcher, PayloadStreamer, StreamSubscription,
    TransportError,
};
use crate::{
    chain::{ChainType, Height},
    constants::ERROR_CHAN_SIZE,
    payload::RawChainData,
};
use async_priority_channel as priority;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, trace, warn};
use watchexec::{
    event::{
        filekind::{
            CreateKind,
            FileEventKind::{Create, Modify},
        },
        Event, Priority, Tag,
    },
    fs::{worker, WorkingData},
};

#[derive(Debug, Clone)]
pub struct FilesystemStreamer {
    chain: ChainType,
    watch_dir: PathBuf,
    event_capacity: usize,
}

impl FilesystemStreamer {
    pub fn new(chain: ChainType, watch_dir: impl AsRef<Path>, event_capacity: usize) -> Self {
        Self {
            chain,
            watch_dir: watch_dir.as_ref().to_path_buf(),
            event_capacity,
        }
    }
}

#[async_trait]
impl PayloadStreamer for FilesystemStreamer {
    #[instrument(skip_all)]
    async fn stream(
        &self,
        payloads: mpsc::Sender<RawChainData>,
    ) -> Result<StreamSubscription, TransportError> {
        if !self.watch_dir.is_dir() {
            return Err(TransportError::Unavailable(format!(
                "{} is not a directory",
                self.watch_dir.display()
            )));
        }
        info!("Streaming payloads from {}", self.watch_dir.display());

        let (ev_s, mut worker_event_receiver) =
            priority::bounded::<Event, Priority>(self.event_capacity as u64);
        let (er_s, mut worker_error_receiver) = mpsc::channel(ERROR_CHAN_SIZE);
        let (worker_command_sender, wd_r) = watch::channel(WorkingData::default());
        let (error_sender, error_receiver) = mpsc::channel(ERROR_CHAN_SIZE);

        let worker_error_sender = error_sender.clone();
        let watcher = tokio::spawn(async move {
            debug!("spawning filesystem watcher worker");
            if let Err(e) = worker(wd_r, er_s, ev_s).await {
                error!("filesystem watcher worker stopped: {e}");
                let _ = worker_error_sender.try_send(TransportError::Watcher(e.to_string()));
            }
        });

        let mut working_data = WorkingData::default();
        working_data.pathset = vec![self.watch_dir.as_path().into()];
        worker_command_sender.send_replace(working_data);

        let chain = self.chain;
        let forwarder = tokio::spawn(async move {
            // keeps the worker's working data channel open
            let _worker_command_sender = worker_command_sender;
            loop {
                tokio::select! {
                    runtime_error = worker_error_receiver.recv() => {
                        match runtime_error {
                            Some(e) => {
                                warn!("filesystem watcher error: {e}");
                                let error = TransportError::Watcher(e.to_string());
                                let _ = error_sender.try_send(error);
                            }
                            None => return,
                        }
                    }
                    event = worker_event_receiver.recv() => {
                        let Ok((event, _priority)) = event else { return };
                        for path in payload_paths(&event) {
                            let Some(height) = height_of_payload_file(&path) else {
                                trace!("ignoring {}", path.display());
                                continue;
                            };
                            match tokio::fs::read(&path).await {
                                Ok(data) => {
                                    debug!("received payload file for height {height}");
                                    let raw = RawChainData { chain, height, data };
                                    if payloads.send(raw).await.is_err() {
                                        debug!("payload receiver dropped, stopping stream");
                                        return;
                                    }
                                }
                                Err(e) => {
                                    let _ = error_sender.try_send(TransportError::Io(format!(
                                        "{}: {e}",
                                        path.display()
                                    )));
                                }
                            }
                        }
                    }
                }
            }
        });

        Ok(StreamSubscription::new(error_receiver, vec![watcher, forwarder]))
    }
}

fn payload_paths(event: &Event) -> Vec<PathBuf> {
    let created_or_modified = event.tags.iter().any(|signal| {
        matches!(signal, Tag::FileEventKind(Create(CreateKind::File)))
            || matches!(signal, Tag::FileEventKind(Modify(_)))
    });
    if !created_or_modified {
        return vec![];
    }
    event
        .tags
        .iter()
        .filter_map(|tag| match tag {
            Tag::Path {
                path,
                file_type: Some(_),
            } => Some(path.clone()),
            _ => None,
        })
        .collect()
}

/// Reads historical payloads from `<archive_dir>/<height>.json`
#[derive(Debug, Clone)]
pub struct ArchiveFetcher {
    chain: ChainType,
    archive_dir: PathBuf,
}

impl ArchiveFetcher {
    pub fn new(chain: ChainType, archive_dir: impl AsRef<Path>) -> Self {
        Self {
            chain,
            archive_dir: archive_dir.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl PayloadFetcher for ArchiveFetcher {
    async fn fetch_at(&self, heights: &[Height]) -> Result<Vec<RawChainData>, TransportError> {
        trace!("fetching {} payloads from archive", heights.len());
        let mut payloads = Vec::with_capacity(heights.len());
        for height in heights {
            let path = payload_file(&self.archive_dir, *height);
            let data = tokio::fs::read(&path).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    TransportError::MissingHeight(*height)
                } else {
                    TransportError::Io(format!("{}: {e}", path.display()))
                }
            })?;
            payloads.push(RawChainData {
                chain: self.chain,
                height: *height,
                data,
            });
        }
        Ok(payloads)
    }
}
