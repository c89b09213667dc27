//! Commit bookkeeping values
//!
//! A [`CommitListEntry`] is produced for every chunk handed to a collector.
//! If the collector only promises to persist the data later, the entry turns
//! into a [`DelayedCommit`] that waits for a collector file to reach a length.

use crate::adaptor::{AdaptorRef, Chunk};
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;

/// Offsets covered by one transmitted chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitListEntry {
    pub adaptor: AdaptorRef,
    /// Stream offset just past the end of the chunk
    pub uuid: u64,
    /// Stream offset of the first byte
    pub start: u64,
}

impl CommitListEntry {
    pub fn new(adaptor: AdaptorRef, uuid: u64, start: u64) -> Self {
        Self {
            adaptor,
            uuid,
            start,
        }
    }
}

impl From<&Chunk> for CommitListEntry {
    fn from(chunk: &Chunk) -> Self {
        Self::new(chunk.source.clone(), chunk.seq_id, chunk.start_offset())
    }
}

/// Region of an adaptor's stream that commits once `file_name` reaches
/// `required_length` on the collector
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DelayedCommit {
    pub adaptor: AdaptorRef,
    pub uuid: u64,
    pub start: u64,
    pub file_name: String,
    pub required_length: u64,
}

impl DelayedCommit {
    pub fn new(entry: &CommitListEntry, file_name: impl Into<String>, required_length: u64) -> Self {
        Self {
            adaptor: entry.adaptor.clone(),
            uuid: entry.uuid,
            start: entry.start,
            file_name: file_name.into(),
            required_length,
        }
    }

    /// Combine with an adjacent or overlapping region of the same adaptor
    /// and file. `other` must not start before `self`.
    pub fn merge(&self, other: &DelayedCommit) -> Option<DelayedCommit> {
        if self.adaptor != other.adaptor
            || self.file_name != other.file_name
            || other.start > self.uuid
        {
            return None;
        }
        Some(DelayedCommit {
            adaptor: self.adaptor.clone(),
            uuid: self.uuid.max(other.uuid),
            start: self.start.min(other.start),
            file_name: self.file_name.clone(),
            required_length: self.required_length.max(other.required_length),
        })
    }
}

/// Queue order: start offset first
impl Ord for DelayedCommit {
    fn cmp(&self, other: &Self) -> Ordering {
        self.start
            .cmp(&other.start)
            .then_with(|| self.uuid.cmp(&other.uuid))
            .then_with(|| self.required_length.cmp(&other.required_length))
            .then_with(|| self.adaptor.cmp(&other.adaptor))
            .then_with(|| self.file_name.cmp(&other.file_name))
    }
}

impl PartialOrd for DelayedCommit {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for DelayedCommit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} commits from {} to {} when {} hits {}",
            self.adaptor, self.start, self.uuid, self.file_name, self.required_length
        )
    }
}

/// Coalesce regions so each (adaptor, file) keeps one entry per contiguous
/// stretch of stream
pub fn merge_delayed_commits(mut commits: Vec<DelayedCommit>) -> Vec<DelayedCommit> {
    commits.sort_by(|a, b| {
        a.adaptor
            .cmp(&b.adaptor)
            .then_with(|| a.file_name.cmp(&b.file_name))
            .then_with(|| a.cmp(b))
    });
    let mut merged: Vec<DelayedCommit> = Vec::with_capacity(commits.len());
    for cur in commits {
        match merged.last().and_then(|region| region.merge(&cur)) {
            Some(region) => {
                if let Some(last) = merged.last_mut() {
                    *last = region;
                }
            }
            None => merged.push(cur),
        }
    }
    merged
}
