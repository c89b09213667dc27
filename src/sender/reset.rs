//! Resets adaptors whose sent data never gets committed
//!
//! Data is resent from the committed offset rather than resumed, trading
//! duplicate delivery for no loss.

use super::commit::CommitListEntry;
use crate::adaptor::AdaptorRef;
use crate::agent::registry::AdaptorRegistry;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
struct AdaptorStat {
    last_commit: Instant,
    max_byte_sent: u64,
}

pub struct ResetMonitor {
    registry: Arc<AdaptorRegistry>,
    stats: Mutex<HashMap<AdaptorRef, AdaptorStat>>,
    timeout: Duration,
}

impl ResetMonitor {
    pub fn new(registry: Arc<AdaptorRegistry>, timeout: Duration) -> Self {
        Self {
            registry,
            stats: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn report_pending(&self, entries: &[CommitListEntry]) {
        self.report_pending_at(entries, Instant::now());
    }

    pub fn report_pending_at(&self, entries: &[CommitListEntry], now: Instant) {
        let mut stats = self.stats.lock();
        for entry in entries {
            let stat = stats.entry(entry.adaptor.clone()).or_insert(AdaptorStat {
                last_commit: now,
                max_byte_sent: 0,
            });
            stat.max_byte_sent = stat.max_byte_sent.max(entry.uuid);
        }
    }

    /// Note commit progress for these adaptors
    pub fn report_commits(&self, adaptors: &HashSet<AdaptorRef>) {
        let now = Instant::now();
        let mut stats = self.stats.lock();
        for adaptor in adaptors {
            if let Some(stat) = stats.get_mut(adaptor) {
                stat.last_commit = now;
            }
        }
    }

    pub fn tracked(&self) -> usize {
        self.stats.lock().len()
    }

    /// Restart every adaptor with uncommitted data and no commit within
    /// `threshold`. Returns the number reset.
    pub fn reset_timed_out(&self, threshold: Duration) -> usize {
        self.reset_timed_out_at(threshold, Instant::now())
    }

    pub fn reset_timed_out_at(&self, threshold: Duration, now: Instant) -> usize {
        let Some(cutoff) = now.checked_sub(threshold) else {
            return 0;
        };

        let to_reset: Vec<AdaptorRef> = {
            let mut stats = self.stats.lock();
            let mut to_reset = Vec::new();
            stats.retain(|adaptor, stat| {
                let Some(committed) = self.registry.offset_of(adaptor) else {
                    return false;
                };
                if stat.max_byte_sent > committed && stat.last_commit <= cutoff {
                    warn!(
                        adaptor = %adaptor,
                        offset = committed,
                        max_byte_sent = stat.max_byte_sent,
                        "restarting adaptor due to commit timeout"
                    );
                    to_reset.push(adaptor.clone());
                }
                true
            });
            to_reset
        };

        let mut reset_count = 0;
        for adaptor in &to_reset {
            self.stats.lock().remove(adaptor);
            match self.registry.reset_adaptor(adaptor) {
                Ok(Some(_)) => reset_count += 1,
                Ok(None) => debug!(adaptor = %adaptor, "adaptor stopped before reset"),
                Err(e) => warn!(adaptor = %adaptor, error = %e, "adaptor reset failed"),
            }
        }
        if reset_count > 0 {
            info!(count = reset_count, "reset timed out adaptors");
        }
        reset_count
    }

    /// Scan every half timeout until `shutdown` fires
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let period = (self.timeout / 2).max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let monitor = self.clone();
                    let timeout = self.timeout;
                    if let Err(e) = tokio::task::spawn_blocking(move || monitor.reset_timed_out(timeout)).await {
                        warn!(error = %e, "reset scan panicked");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("reset monitor stopping");
                    break;
                }
            }
        }
    }
}
