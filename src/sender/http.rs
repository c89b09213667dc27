//! Send loop: drain the chunk queue and post batches to collectors

use super::collectors::{CollectorClient, CollectorList};
use super::commit::CommitListEntry;
use super::coordinator::CommitCoordinator;
use crate::adaptor::Chunk;
use crate::agent::queue::ChunkQueue;
use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SenderSettings {
    pub max_post_bytes: usize,
    /// Wait after every collector failed
    pub retry_interval: Duration,
    /// Full rotations to attempt before giving up on a post
    pub retries: u32,
    pub async_acks: bool,
}

pub struct HttpSender {
    queue: Arc<ChunkQueue>,
    client: Arc<dyn CollectorClient>,
    coordinator: Arc<CommitCoordinator>,
    collectors: Mutex<CollectorList>,
    current: Mutex<Option<String>>,
    settings: SenderSettings,
    post_id: AtomicU64,
}

impl HttpSender {
    pub fn new(
        queue: Arc<ChunkQueue>,
        client: Arc<dyn CollectorClient>,
        coordinator: Arc<CommitCoordinator>,
        collectors: CollectorList,
        settings: SenderSettings,
    ) -> Self {
        let sender = Self {
            queue,
            client,
            coordinator,
            collectors: Mutex::new(CollectorList::new(Vec::new(), Duration::ZERO)),
            current: Mutex::new(None),
            settings,
            post_id: AtomicU64::new(0),
        };
        sender.set_collectors(collectors);
        sender
    }

    /// Replace the collector list; keeps the current collector if one is set
    pub fn set_collectors(&self, mut collectors: CollectorList) {
        let mut current = self.current.lock();
        if current.is_none() {
            *current = collectors.next_collector();
            if current.is_none() {
                error!("no collectors to send to");
            }
        }
        *self.collectors.lock() = collectors;
    }

    pub fn current_collector(&self) -> Option<String> {
        self.current.lock().clone()
    }

    /// Post one batch and route the reply. Returns the number of chunks
    /// acknowledged immediately.
    pub async fn send(&self, chunks: Vec<Chunk>) -> Result<usize> {
        let post_id = self.post_id.fetch_add(1, Ordering::SeqCst);
        let expected: Vec<CommitListEntry> = chunks.iter().map(CommitListEntry::from).collect();
        info!(post_id, chunks = chunks.len(), "collected chunks for post");

        if self.settings.async_acks {
            self.coordinator.reset_monitor().report_pending(&expected);
        }

        let Some(response) = self.reliably_post(&chunks).await? else {
            return Ok(0);
        };

        let acked = if self.settings.async_acks {
            self.coordinator.handle_post_response(&expected, &response).len()
        } else {
            self.coordinator.commit_entries(&expected);
            expected.len()
        };
        info!(post_id, sent = chunks.len(), acks = acked, "post complete");
        Ok(acked)
    }

    /// Post to the current collector, rolling over on failure.
    ///
    /// `None` means the post was abandoned after a rollover.
    async fn reliably_post(&self, chunks: &[Chunk]) -> Result<Option<Vec<String>>> {
        let mut retries = self.settings.retries;
        loop {
            let Some(collector) = self.current_collector() else {
                bail!("no collectors configured");
            };
            let err = match self.client.post_chunks(&collector, chunks).await {
                Ok(lines) => return Ok(Some(lines)),
                Err(e) => e,
            };
            error!(collector = %collector, error = %err, "post failed");

            let next = self.collectors.lock().next_collector();
            if let Some(next) = next {
                let repeat = self.declare_failed(&collector).await;
                *self.current.lock() = Some(next.clone());
                if !repeat {
                    info!(collector = %next, "using new collector from now on, not retrying this post");
                    return Ok(None);
                }
                info!(collector = %next, "rolling over to next collector");
            } else if retries > 0 {
                warn!(
                    wait_ms = self.settings.retry_interval.as_millis() as u64,
                    retries_left = retries,
                    "no more collectors to roll over to; waiting"
                );
                tokio::time::sleep(self.settings.retry_interval).await;
                retries -= 1;
            } else {
                bail!("no more collectors to try; aborting post");
            }
        }
    }

    /// Returns whether to retry the failed post
    async fn declare_failed(&self, collector: &str) -> bool {
        if !self.settings.async_acks {
            debug!(collector = %collector, "declaring collector down");
            return true;
        }
        let coordinator = self.coordinator.clone();
        let collector = collector.to_string();
        tokio::task::spawn_blocking(move || coordinator.failed_collector(&collector))
            .await
            .unwrap_or(false)
    }

    /// Send loop; exits on shutdown or once the queue is closed and drained
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        loop {
            let batch = tokio::select! {
                batch = self.queue.collect(self.settings.max_post_bytes) => batch,
                _ = shutdown.recv() => break,
            };
            if batch.is_empty() {
                if self.queue.is_closed() {
                    break;
                }
                continue;
            }
            if let Err(e) = self.send(batch).await {
                error!(error = %e, "dropping batch after send failure");
            }
        }
        debug!("sender stopping");
    }
}
