//! Asynchronous commit coordination
//!
//! Collectors acknowledge a post in one of two ways per chunk: `ok: ...`
//! means the data is already durable; `<file> <length>` means it becomes
//! durable once the collector's sink file reaches that length. The second
//! kind is parked here until a commit poll shows the file long enough.
//!
//! Pending regions live in one min-heap per file. Commits for a file are
//! applied strictly in heap order and stop at the first region that isn't
//! durable yet, so a later region can never mask a lost earlier one.

use super::collectors::{CollectorClient, ACK_PREFIX};
use super::commit::{merge_delayed_commits, CommitListEntry, DelayedCommit};
use super::reset::ResetMonitor;
use crate::adaptor::AdaptorRef;
use crate::agent::registry::AdaptorRegistry;
use parking_lot::Mutex;
use regex::Regex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// `<path> <length>`, optionally wrapped in `<li>` tags
fn status_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:<li>)?(.+) ([0-9]+)(?:</li>)?$").ok())
        .as_ref()
}

/// Split a `path length` line
fn parse_file_length(line: &str) -> Option<(String, u64)> {
    let caps = status_regex()?.captures(line.trim())?;
    let length = caps[2].parse::<u64>().ok()?;
    Some((caps[1].to_string(), length))
}

pub struct CommitCoordinator {
    registry: Arc<AdaptorRegistry>,
    reset: Arc<ResetMonitor>,
    /// Filled by the sender, drained by the poller
    to_merge: Mutex<Vec<DelayedCommit>>,
    /// Only touched by the poller; file name -> regions waiting on it
    pending: Mutex<HashMap<String, BinaryHeap<Reverse<DelayedCommit>>>>,
}

impl CommitCoordinator {
    pub fn new(registry: Arc<AdaptorRegistry>, reset: Arc<ResetMonitor>) -> Self {
        Self {
            registry,
            reset,
            to_merge: Mutex::new(Vec::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn reset_monitor(&self) -> &Arc<ResetMonitor> {
        &self.reset
    }

    /// Apply commits that need no waiting; returns how many advanced an offset
    pub fn commit_entries(&self, entries: &[CommitListEntry]) -> usize {
        let mut committed = HashSet::new();
        let mut advanced = 0;
        for entry in entries {
            if self.registry.report_commit(&entry.adaptor, entry.uuid) {
                advanced += 1;
            }
            committed.insert(entry.adaptor.clone());
        }
        self.reset.report_commits(&committed);
        advanced
    }

    /// Digest a collector's reply to a post.
    ///
    /// Line `i` answers `expected[i]`. Acked entries commit at once; the
    /// rest are parked as delayed commits. Returns the acked entries.
    ///
    /// The caller reports `expected` to the reset monitor before posting.
    pub fn handle_post_response(
        &self,
        expected: &[CommitListEntry],
        response: &[String],
    ) -> Vec<CommitListEntry> {
        if response.len() != expected.len() {
            warn!(
                expected = expected.len(),
                got = response.len(),
                "collector response doesn't match chunks sent"
            );
        }

        let mut acked = Vec::new();
        let mut delayed = Vec::new();
        for (entry, line) in expected.iter().zip(response) {
            if line.starts_with(ACK_PREFIX) {
                acked.push(entry.clone());
                continue;
            }
            let Some((file, length)) = parse_file_length(line) else {
                warn!(line = %line, "unexpected response line");
                continue;
            };
            if !self.registry.is_running(&entry.adaptor) {
                debug!(adaptor = %entry.adaptor, "adaptor no longer running, not waiting on commit");
                continue;
            }
            info!(
                adaptor = %entry.adaptor,
                file = %file,
                length,
                "waiting for file to reach length before committing"
            );
            delayed.push(DelayedCommit::new(entry, file, length));
        }

        self.delay_commits(delayed);
        self.commit_entries(&acked);
        acked
    }

    fn delay_commits(&self, delayed: Vec<DelayedCommit>) {
        if delayed.is_empty() {
            return;
        }
        let merged = merge_delayed_commits(delayed);
        self.to_merge.lock().extend(merged);
    }

    /// Move parked regions into the per-file queues, merging across batches
    pub fn merge_pending_table(&self) {
        let incoming = std::mem::take(&mut *self.to_merge.lock());
        if incoming.is_empty() {
            return;
        }
        let mut pending = self.pending.lock();
        for commit in merge_delayed_commits(incoming) {
            pending
                .entry(commit.file_name.clone())
                .or_default()
                .push(Reverse(commit));
        }
    }

    /// Apply one commit-status listing. Returns the number of regions
    /// committed.
    pub fn apply_commit_status(&self, lines: &[String]) -> usize {
        let mut pending = self.pending.lock();
        let mut committed_count = 0;

        for line in lines {
            if line.starts_with(ACK_PREFIX) || line.trim().is_empty() {
                continue;
            }
            let Some((path, committed_length)) = parse_file_length(line) else {
                debug!(line = %line, "ignoring commit status line");
                continue;
            };
            let Some(queue) = pending.get_mut(&path) else {
                continue;
            };

            let mut committed: HashSet<AdaptorRef> = HashSet::new();
            while let Some(Reverse(top)) = queue.peek() {
                if top.required_length > committed_length {
                    break;
                }
                match self.registry.offset_of(&top.adaptor) {
                    None => {
                        warn!(commit = %top, "dropping commit for adaptor that is no longer running");
                    }
                    Some(recorded) if top.start > recorded => {
                        error!(
                            adaptor = %top.adaptor,
                            start = top.start,
                            recorded,
                            "can't commit without ordering assumption"
                        );
                        break;
                    }
                    Some(_) => {
                        self.registry.report_commit(&top.adaptor, top.uuid);
                        committed.insert(top.adaptor.clone());
                        committed_count += 1;
                        info!(
                            file = %path,
                            length = committed_length,
                            adaptor = %top.adaptor,
                            offset = top.uuid,
                            "commit applied"
                        );
                    }
                }
                queue.pop();
            }
            if queue.is_empty() {
                pending.remove(&path);
            }
            self.reset.report_commits(&committed);
        }
        committed_count
    }

    /// One poll cycle over `collectors`
    pub async fn poll_once(&self, client: &dyn CollectorClient, collectors: &[String]) -> usize {
        self.merge_pending_table();
        if self.pending_count() == 0 {
            return 0;
        }
        let mut committed = 0;
        for collector in collectors {
            match client.fetch_commit_status(collector).await {
                Ok(lines) => committed += self.apply_commit_status(&lines),
                Err(e) => warn!(collector = %collector, error = %e, "commit poll failed"),
            }
        }
        committed
    }

    /// Commit poll loop; runs until `shutdown` fires
    pub async fn run(
        self: Arc<Self>,
        client: Arc<dyn CollectorClient>,
        collectors: Vec<String>,
        period: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    info!("checking for committed chunks");
                    self.poll_once(client.as_ref(), &collectors).await;
                }
                _ = shutdown.recv() => {
                    debug!("commit poller stopping");
                    break;
                }
            }
        }
    }

    /// A collector stopped answering: resend everything outstanding now.
    ///
    /// Returns whether the failed post should be retried elsewhere; it
    /// shouldn't, the resets resend its data.
    pub fn failed_collector(&self, collector: &str) -> bool {
        info!(collector = %collector, "collector down; resetting adaptors");
        self.reset.reset_timed_out(Duration::ZERO);
        false
    }

    /// Regions not yet committed, parked or queued
    pub fn pending_count(&self) -> usize {
        let parked = self.to_merge.lock().len();
        let queued: usize = self.pending.lock().values().map(|q| q.len()).sum();
        parked + queued
    }

    /// Regions queued on `file`, lowest first
    pub fn pending_for_file(&self, file: &str) -> Vec<DelayedCommit> {
        let pending = self.pending.lock();
        let mut commits: Vec<DelayedCommit> = pending
            .get(file)
            .map(|q| q.iter().map(|Reverse(c)| c.clone()).collect())
            .unwrap_or_default();
        commits.sort();
        commits
    }
}
