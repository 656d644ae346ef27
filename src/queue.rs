//! Bounded multi-consumer work queue that evicts its oldest entry instead
//! of blocking the producer when full.
//!
//! Delivery is FIFO until the queue saturates; after that the oldest pending
//! items are dropped in favour of the newest, keeping memory bounded and the
//! consumers close to the head of the chain.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    Mutex,
};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("work queue is closed")]
pub struct QueueClosed;

pub fn work_queue<T>(capacity: usize) -> (EvictingSender<T>, WorkReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let rx = Arc::new(Mutex::new(rx));
    (
        EvictingSender {
            tx,
            rx: rx.clone(),
        },
        WorkReceiver { rx },
    )
}

#[derive(Debug)]
pub struct EvictingSender<T> {
    tx: mpsc::Sender<T>,
    rx: Arc<Mutex<mpsc::Receiver<T>>>,
}

impl<T> EvictingSender<T> {
    /// Enqueue `item`, returning the entry evicted to make room, if any
    pub async fn push(&self, item: T) -> Result<Option<T>, QueueClosed> {
        let item = match self.tx.try_send(item) {
            Ok(()) => return Ok(None),
            Err(TrySendError::Closed(_)) => return Err(QueueClosed),
            Err(TrySendError::Full(item)) => item,
        };

        let evicted = match self.rx.try_lock() {
            Ok(mut rx) => rx.try_recv().ok(),
            // a consumer holds the receiver and is taking an entry right now
            Err(_) => None,
        };

        match self.tx.try_send(item) {
            Ok(()) => Ok(evicted),
            Err(TrySendError::Closed(_)) => Err(QueueClosed),
            Err(TrySendError::Full(item)) => self
                .tx
                .send(item)
                .await
                .map(|_| evicted)
                .map_err(|_| QueueClosed),
        }
    }

    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}

#[derive(Debug)]
pub struct WorkReceiver<T> {
    rx: Arc<Mutex<mpsc::Receiver<T>>>,
}

impl<T> Clone for WorkReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl<T> WorkReceiver<T> {
    /// Next entry, `None` once the sender is gone and the queue drained
    pub async fn recv(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }
}
