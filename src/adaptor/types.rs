// src/adaptor/types.rs
//! Shared value types passed between adaptors, the registry and the sender

use serde::Serialize;
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Reference to one running adaptor instance.
///
/// `instance` changes every time an id is (re)started, so a commit addressed
/// to an adaptor that has since been reset never lands on its successor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct AdaptorRef {
    pub id: String,
    pub instance: u64,
}

impl AdaptorRef {
    pub fn new(id: impl Into<String>, instance: u64) -> Self {
        Self {
            id: id.into(),
            instance,
        }
    }
}

impl fmt::Display for AdaptorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.id, self.instance)
    }
}

/// A unit of data produced by an adaptor.
///
/// `seq_id` is the stream offset of the byte just past the end of `data`.
#[derive(Debug, Clone, Serialize)]
pub struct Chunk {
    pub source: AdaptorRef,
    pub data_type: String,
    pub stream_name: String,
    pub seq_id: u64,
    pub data: Vec<u8>,
}

impl Chunk {
    /// Stream offset of the first byte in this chunk
    pub fn start_offset(&self) -> u64 {
        self.seq_id.saturating_sub(self.data.len() as u64)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Destination for chunks emitted by adaptors.
pub trait ChunkReceiver: Send + Sync {
    /// Hand a chunk to the agent. May block while the destination is full.
    fn add(&self, chunk: Chunk);

    /// Like `add`, but stop waiting for room once `cancel` is set.
    ///
    /// Returns false if the chunk was not accepted.
    fn add_unless(&self, chunk: Chunk, cancel: &AtomicBool) -> bool {
        let _ = cancel;
        self.add(chunk);
        true
    }
}

/// Everything an adaptor needs to begin producing data.
#[derive(Clone)]
pub struct StartContext {
    pub adaptor: AdaptorRef,
    pub data_type: String,
    /// Stream offset of the first byte the adaptor will send
    pub offset: u64,
    pub dest: Arc<dyn ChunkReceiver>,
}

/// How an adaptor should come to a stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPolicy {
    /// Push out everything buffered, then stop
    Gracefully,
    /// Stop immediately, discarding in-flight state
    HardStop,
    /// Stopping only to be started again at a known offset
    Restarting,
}

impl fmt::Display for ShutdownPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownPolicy::Gracefully => write!(f, "GRACEFULLY"),
            ShutdownPolicy::HardStop => write!(f, "HARD_STOP"),
            ShutdownPolicy::Restarting => write!(f, "RESTARTING"),
        }
    }
}
