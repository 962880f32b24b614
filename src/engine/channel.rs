//! Fixed-capacity FIFO channel connecting two stages.
//!
//! Any number of producers and consumers may share one [`BoundedChannel`];
//! cloning a handle is cheap. Writes never drop: a full channel makes
//! [`BoundedChannel::put`] retry on a fixed interval, logging the pending
//! item each time, which pushes backpressure onto the producing stage.
//! Reads either wait with a timeout ([`BoundedChannel::get`]) so an idle
//! consumer can re-check its upstream, or return immediately
//! ([`BoundedChannel::get_nowait`]) during a drain phase.

use super::error::ChannelError;
use crate::utils::truncate_for_log;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::{SendTimeoutError, TryRecvError, TrySendError};
use tokio::sync::{Mutex, mpsc};
use tracing::info;

/// Default interval between `put` retries on a full channel.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

const LOG_ITEM_MAX: usize = 200;

pub struct BoundedChannel<T> {
    tx: mpsc::Sender<T>,
    rx: Arc<Mutex<mpsc::Receiver<T>>>,
    retry_interval: Duration,
}

impl<T> Clone for BoundedChannel<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: Arc::clone(&self.rx),
            retry_interval: self.retry_interval,
        }
    }
}

impl<T> fmt::Debug for BoundedChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedChannel")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .field("retry_interval", &self.retry_interval)
            .finish()
    }
}

impl<T> BoundedChannel<T> {
    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Number of items currently buffered.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send + 'static> BoundedChannel<T> {
    /// Create a channel holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "channel capacity must be greater than zero");
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    /// Change how long `put` waits for space before logging and retrying.
    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// Enqueue one item, waiting as long as it takes for space.
    ///
    /// Only fails if the channel is closed, which cannot happen while this
    /// handle is alive.
    pub async fn put(&self, item: T, producer: &str) -> Result<(), ChannelError>
    where
        T: fmt::Debug,
    {
        let mut pending = item;
        loop {
            match self.tx.send_timeout(pending, self.retry_interval).await {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(item)) => {
                    info!(
                        stage = producer,
                        item = %truncate_for_log(&format!("{item:?}"), LOG_ITEM_MAX),
                        "Output channel is full; retrying put"
                    );
                    pending = item;
                }
                Err(SendTimeoutError::Closed(_)) => return Err(ChannelError::Closed),
            }
        }
    }

    /// Enqueue every element in iteration order and return how many went in.
    pub async fn put_all<I>(&self, items: I, producer: &str) -> Result<usize, ChannelError>
    where
        I: IntoIterator<Item = T>,
        T: fmt::Debug,
    {
        let mut count = 0;
        for item in items {
            self.put(item, producer).await?;
            count += 1;
        }
        Ok(count)
    }

    /// Enqueue without waiting; the item is handed back if there is no room.
    pub fn try_put(&self, item: T) -> Result<(), T> {
        self.tx.try_send(item).map_err(|e| match e {
            TrySendError::Full(item) | TrySendError::Closed(item) => item,
        })
    }

    /// Pop the oldest item, giving up with [`ChannelError::Empty`] after `timeout`.
    pub async fn get(&self, timeout: Duration) -> Result<T, ChannelError> {
        let recv = async { self.rx.lock().await.recv().await };
        match tokio::time::timeout(timeout, recv).await {
            Ok(Some(item)) => Ok(item),
            Ok(None) => Err(ChannelError::Closed),
            Err(_) => Err(ChannelError::Empty),
        }
    }

    /// Pop the oldest item if one is buffered right now.
    pub async fn get_nowait(&self) -> Result<T, ChannelError> {
        match self.rx.lock().await.try_recv() {
            Ok(item) => Ok(item),
            Err(TryRecvError::Empty) => Err(ChannelError::Empty),
            Err(TryRecvError::Disconnected) => Err(ChannelError::Closed),
        }
    }

    /// Remove and return everything currently buffered, oldest first.
    pub async fn drain(&self) -> Vec<T> {
        let mut rx = self.rx.lock().await;
        let mut items = Vec::with_capacity(self.len());
        while let Ok(item) = rx.try_recv() {
            items.push(item);
        }
        items
    }
}
