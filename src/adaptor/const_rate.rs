//! Synthetic adaptor emitting data at a roughly constant rate
//!
//! Used for load testing a collector pipeline end to end. Every byte is a
//! function of its stream offset, so a receiver can verify that replayed
//! ranges carry identical content.

use super::{Adaptor, Chunk, ShutdownPolicy, StartContext};
use crate::error::AdaptorError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const CLASS_NAME: &str = "ConstRateAdaptor";

const DEFAULT_INTERVAL_MS: u64 = 500;

/// Largest chunk a single tick may produce
pub const MAX_CHUNK_BYTES: u64 = 16 * 1024 * 1024;

/// Granularity at which a sleeping worker notices a stop request
const STOP_POLL: Duration = Duration::from_millis(20);

/// Expected content of the byte at `offset`
pub fn byte_at(offset: u64) -> u8 {
    (offset % 251) as u8
}

/// Check that a chunk carries the bytes this adaptor would have produced
pub fn check_chunk(chunk: &Chunk) -> bool {
    let start = chunk.start_offset();
    chunk
        .data
        .iter()
        .enumerate()
        .all(|(i, b)| *b == byte_at(start + i as u64))
}

pub struct ConstRateAdaptor {
    bytes_per_sec: u64,
    interval_ms: u64,
    chunk_size: u64,
    data_type: String,
    offset: Arc<AtomicU64>,
    stopping: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ConstRateAdaptor {
    pub fn new() -> Self {
        Self {
            bytes_per_sec: 0,
            interval_ms: DEFAULT_INTERVAL_MS,
            chunk_size: 1,
            data_type: String::new(),
            offset: Arc::new(AtomicU64::new(0)),
            stopping: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }
}

/// Sleep for `total`, returning early once `stopping` is set
fn sleep_unless_stopped(total: Duration, stopping: &AtomicBool) {
    let deadline = Instant::now() + total;
    while !stopping.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep((deadline - now).min(STOP_POLL));
    }
}

impl Default for ConstRateAdaptor {
    fn default() -> Self {
        Self::new()
    }
}

impl Adaptor for ConstRateAdaptor {
    /// Params: `<bytes_per_sec> [interval_ms]`
    fn parse_args(&mut self, data_type: &str, params: &str) -> Result<String, AdaptorError> {
        let mut words = params.split_whitespace();
        let rate = words
            .next()
            .and_then(|w| w.parse::<u64>().ok())
            .ok_or_else(|| AdaptorError::InvalidParams(params.to_string()))?;
        let interval = match words.next() {
            Some(w) => w
                .parse::<u64>()
                .ok()
                .filter(|ms| *ms > 0)
                .ok_or_else(|| AdaptorError::InvalidParams(params.to_string()))?,
            None => DEFAULT_INTERVAL_MS,
        };
        if words.next().is_some() {
            return Err(AdaptorError::InvalidParams(params.to_string()));
        }
        let chunk_size = rate
            .checked_mul(interval)
            .map(|product| (product / 1000).max(1))
            .filter(|size| *size <= MAX_CHUNK_BYTES)
            .ok_or_else(|| {
                AdaptorError::InvalidParams(format!(
                    "{}: more than {} bytes per interval",
                    params, MAX_CHUNK_BYTES
                ))
            })?;

        self.bytes_per_sec = rate;
        self.chunk_size = chunk_size;
        self.interval_ms = interval;
        self.data_type = data_type.to_string();
        Ok(format!("{} {}", rate, interval))
    }

    fn start(&mut self, ctx: StartContext) -> Result<(), AdaptorError> {
        self.offset.store(ctx.offset, Ordering::SeqCst);
        self.stopping.store(false, Ordering::SeqCst);

        let offset = self.offset.clone();
        let stopping = self.stopping.clone();
        let size = self.chunk_size;
        let interval = Duration::from_millis(self.interval_ms);
        let stream_name = format!("const rate {}", self.bytes_per_sec);

        let handle = std::thread::Builder::new()
            .name(format!("const-rate {}", ctx.adaptor.id))
            .spawn(move || {
                while !stopping.load(Ordering::SeqCst) {
                    let start = offset.load(Ordering::SeqCst);
                    let Some(end) = start.checked_add(size) else {
                        warn!(adaptor_id = %ctx.adaptor.id, offset = start, "stream offset exhausted");
                        break;
                    };
                    let chunk = Chunk {
                        source: ctx.adaptor.clone(),
                        data_type: ctx.data_type.clone(),
                        stream_name: stream_name.clone(),
                        seq_id: end,
                        data: (start..end).map(byte_at).collect(),
                    };
                    if !ctx.dest.add_unless(chunk, &stopping) {
                        break;
                    }
                    offset.store(end, Ordering::SeqCst);
                    sleep_unless_stopped(interval, &stopping);
                }
                debug!(adaptor_id = %ctx.adaptor.id, "const rate adaptor exiting");
            })
            .map_err(|e| AdaptorError::StartFailure(e.to_string()))?;

        *self.worker.lock() = Some(handle);
        Ok(())
    }

    fn current_status(&self) -> String {
        format!("{} {} {}", self.data_type, self.bytes_per_sec, self.interval_ms)
    }

    fn restart_params(&self) -> Option<String> {
        Some(format!("{} {}", self.bytes_per_sec, self.interval_ms))
    }

    fn shutdown(&mut self, policy: ShutdownPolicy) -> Result<u64, AdaptorError> {
        self.stopping.store(true, Ordering::SeqCst);
        let handle = self.worker.lock().take();
        if policy == ShutdownPolicy::Gracefully {
            if let Some(handle) = handle {
                handle
                    .join()
                    .map_err(|_| AdaptorError::ShutdownFailure("worker panicked".to_string()))?;
            }
        }
        Ok(self.offset.load(Ordering::SeqCst))
    }
}
