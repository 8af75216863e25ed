//! # Store-and-Forward Delivery
//!
//! Recordings are written to disk, queued in arrival order and played one
//! at a time by a single background worker:
//!
//! ```text
//! client ──► QueueService::submit ──► DeliveryQueue ──► QueueWorker
//!            (write file, admit)      (bounded FIFO)    (normalize, chime, play, delete)
//! ```

use crate::audio::loudnorm::Normalizer;
use crate::audio::sink::{FilePlayer, SinkError};
use crate::audio::store::{self, AudioStore};
use crate::intercom::protocol::ServerMessage;
use crate::intercom::registry::ClientId;
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub path: PathBuf,
    pub origin: ClientId,
}

/// Rejected admission; hands the item back so its file can be removed.
#[derive(Debug)]
pub struct QueueFull(pub QueueItem);

impl fmt::Display for QueueFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Queue full, rejected {}", self.0.path.display())
    }
}

impl std::error::Error for QueueFull {}

/// Bounded FIFO of recordings waiting to be played.
pub struct DeliveryQueue {
    items: Mutex<VecDeque<QueueItem>>,
    capacity: usize,
    available: Notify,
}

impl DeliveryQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            available: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<QueueItem>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.lock().len() >= self.capacity
    }

    /// Append an item and return its 1-based position.
    pub fn try_enqueue(&self, item: QueueItem) -> Result<usize, QueueFull> {
        let position = {
            let mut items = self.lock();
            if items.len() >= self.capacity {
                return Err(QueueFull(item));
            }
            items.push_back(item);
            items.len()
        };
        self.available.notify_one();
        Ok(position)
    }

    /// Wait for and remove the oldest item.
    pub async fn next(&self) -> QueueItem {
        loop {
            let head = self.lock().pop_front();
            if let Some(item) = head {
                return item;
            }
            self.available.notified().await;
        }
    }
}

/// Admission side of the queue, shared by every WebSocket session.
#[derive(Clone)]
pub struct QueueService {
    queue: Arc<DeliveryQueue>,
    store: Arc<AudioStore>,
}

impl QueueService {
    pub fn new(queue: Arc<DeliveryQueue>, store: Arc<AudioStore>) -> Self {
        Self { queue, store }
    }

    pub fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }

    /// Store one recording and try to queue it. The reply goes back to the sender.
    pub async fn submit(&self, origin: ClientId, data: &[u8]) -> ServerMessage {
        // cheap early rejection; the authoritative check is `try_enqueue`
        if self.queue.is_full() {
            warn!(client_id = %origin, "Queue full, message rejected");
            return ServerMessage::QueueFull;
        }

        let path = match self.store.save_message(data).await {
            Ok(path) => path,
            Err(err) => {
                error!(client_id = %origin, error = %err, "Failed to store recording");
                return ServerMessage::error("storage_failed", "Could not store the recording");
            }
        };

        match self.queue.try_enqueue(QueueItem {
            path,
            origin: origin.clone(),
        }) {
            Ok(position) => {
                info!(client_id = %origin, bytes = data.len(), position, "Message queued");
                ServerMessage::Queued { position }
            }
            Err(QueueFull(item)) => {
                warn!(client_id = %origin, "Queue filled while storing, message rejected");
                store::discard(&item.path).await;
                ServerMessage::QueueFull
            }
        }
    }
}

/// The single consumer that plays queued recordings through the speaker.
pub struct QueueWorker {
    queue: Arc<DeliveryQueue>,
    player: Arc<dyn FilePlayer>,
    normalizer: Option<Arc<dyn Normalizer>>,
    chime: Option<PathBuf>,
    gap: Duration,
}

impl QueueWorker {
    pub fn new(queue: Arc<DeliveryQueue>, player: Arc<dyn FilePlayer>, gap: Duration) -> Self {
        Self {
            queue,
            player,
            normalizer: None,
            chime: None,
            gap,
        }
    }

    pub fn with_normalizer(mut self, normalizer: Arc<dyn Normalizer>) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    pub fn with_chime(mut self, chime: PathBuf) -> Self {
        self.chime = Some(chime);
        self
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        info!(
            gap_secs = self.gap.as_secs_f64(),
            normalize = self.normalizer.is_some(),
            "Queue worker started"
        );

        loop {
            let item = self.queue.next().await;
            self.deliver(&item).await;

            if !self.queue.is_empty() {
                tokio::time::sleep(self.gap).await;
            }
        }
    }

    async fn deliver(&self, item: &QueueItem) {
        info!(client_id = %item.origin, waiting = self.queue.len(), "Playing queued message");

        let normalized = match &self.normalizer {
            Some(normalizer) => match normalizer.normalize(&item.path).await {
                Ok(path) => Some(path),
                Err(err) => {
                    warn!(client_id = %item.origin, error = %err, "Normalization failed, playing original");
                    None
                }
            },
            None => None,
        };

        let playable = normalized.as_deref().unwrap_or(&item.path);
        match self.announce_and_play(playable).await {
            Ok(()) => debug!(client_id = %item.origin, "Finished playing message"),
            Err(err) => error!(client_id = %item.origin, error = %err, "Playback failed"),
        }

        store::discard(&item.path).await;
        if let Some(path) = &normalized {
            store::discard(path).await;
        }
    }

    async fn announce_and_play(&self, path: &std::path::Path) -> Result<(), SinkError> {
        if let Some(chime) = &self.chime {
            self.player.play(chime).await?;
        }
        self.player.play(path).await
    }
}
