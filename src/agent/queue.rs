//! Bounded chunk buffer between adaptors and the sender

use crate::adaptor::{Chunk, ChunkReceiver};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// How often a blocked producer rechecks its cancel flag
const CANCEL_POLL: Duration = Duration::from_millis(50);

struct Inner {
    chunks: VecDeque<Chunk>,
    /// Total payload bytes queued
    bytes: usize,
    closed: bool,
}

/// Chunk queue that blocks producers once it holds `max_bytes`.
///
/// Adaptors call `add` from their own threads; the sender drains batches
/// with `collect` from a tokio task.
pub struct ChunkQueue {
    inner: Mutex<Inner>,
    not_full: Condvar,
    not_empty: Notify,
    max_bytes: usize,
}

impl ChunkQueue {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                chunks: VecDeque::new(),
                bytes: 0,
                closed: false,
            }),
            not_full: Condvar::new(),
            not_empty: Notify::new(),
            max_bytes,
        }
    }

    /// Take up to `max_bytes` of chunks; always at least one, even if larger
    pub fn try_collect(&self, max_bytes: usize) -> Vec<Chunk> {
        let mut inner = self.inner.lock();
        let mut batch = Vec::new();
        let mut taken = 0;
        while let Some(front) = inner.chunks.front() {
            if !batch.is_empty() && taken + front.len() > max_bytes {
                break;
            }
            taken += front.len();
            if let Some(chunk) = inner.chunks.pop_front() {
                batch.push(chunk);
            }
        }
        inner.bytes -= taken;
        if !batch.is_empty() {
            self.not_full.notify_all();
        }
        batch
    }

    /// Wait until something can be taken; empty once the queue is closed
    pub async fn collect(&self, max_bytes: usize) -> Vec<Chunk> {
        loop {
            let batch = self.try_collect(max_bytes);
            if !batch.is_empty() || self.is_closed() {
                return batch;
            }
            self.not_empty.notified().await;
        }
    }

    /// Close the queue and wake every waiter. Later chunks are dropped.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.not_full.notify_all();
        self.not_empty.notify_waiters();
        self.not_empty.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> usize {
        self.inner.lock().bytes
    }

    fn push(&self, chunk: Chunk, cancel: Option<&AtomicBool>) -> bool {
        let mut inner = self.inner.lock();
        // An empty queue always accepts, so an oversized chunk can't wedge
        while inner.bytes >= self.max_bytes && !inner.chunks.is_empty() && !inner.closed {
            match cancel {
                Some(flag) => {
                    if flag.load(Ordering::SeqCst) {
                        debug!(adaptor = %chunk.source, "producer cancelled while queue full");
                        return false;
                    }
                    self.not_full.wait_for(&mut inner, CANCEL_POLL);
                }
                None => self.not_full.wait(&mut inner),
            }
        }
        if inner.closed {
            debug!(adaptor = %chunk.source, "queue closed, dropping chunk");
            return false;
        }
        inner.bytes += chunk.len();
        inner.chunks.push_back(chunk);
        drop(inner);
        self.not_empty.notify_one();
        true
    }
}

impl ChunkReceiver for ChunkQueue {
    fn add(&self, chunk: Chunk) {
        self.push(chunk, None);
    }

    fn add_unless(&self, chunk: Chunk, cancel: &AtomicBool) -> bool {
        self.push(chunk, Some(cancel))
    }
}
