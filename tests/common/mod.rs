//! Shared fixtures for integration tests
#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use collect_agent::{
    Adaptor, AdaptorError, AdaptorFactory, AdaptorRef, AdaptorRegistry, Chunk, ChunkReceiver,
    CollectorClient, ShutdownPolicy, StartContext,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const SCRIPTED: &str = "ScriptedAdaptor";

/// Every start seen by scripted adaptors: (id, offset)
#[derive(Clone, Default)]
pub struct StartLog(Arc<Mutex<Vec<(String, u64)>>>);

impl StartLog {
    pub fn starts(&self) -> Vec<(String, u64)> {
        self.0.lock().clone()
    }

    pub fn starts_of(&self, id: &str) -> Vec<u64> {
        self.0
            .lock()
            .iter()
            .filter(|(i, _)| i == id)
            .map(|(_, o)| *o)
            .collect()
    }
}

/// Test adaptor. Params are free text; a word `emit=N` makes it send one
/// N-byte chunk on start, and `fail` makes start fail.
pub struct ScriptedAdaptor {
    params: String,
    emit: u64,
    offset: u64,
    log: StartLog,
}

impl ScriptedAdaptor {
    pub fn new(log: StartLog) -> Self {
        Self {
            params: String::new(),
            emit: 0,
            offset: 0,
            log,
        }
    }
}

impl Adaptor for ScriptedAdaptor {
    fn parse_args(&mut self, _data_type: &str, params: &str) -> Result<String, AdaptorError> {
        if params.is_empty() {
            return Err(AdaptorError::InvalidParams("empty".to_string()));
        }
        for word in params.split_whitespace() {
            if let Some(n) = word.strip_prefix("emit=") {
                self.emit = n
                    .parse()
                    .map_err(|_| AdaptorError::InvalidParams(params.to_string()))?;
            }
        }
        self.params = params.to_string();
        Ok(params.to_string())
    }

    fn start(&mut self, ctx: StartContext) -> Result<(), AdaptorError> {
        if self.params.split_whitespace().any(|w| w == "fail") {
            return Err(AdaptorError::StartFailure("scripted failure".to_string()));
        }
        self.log.0.lock().push((ctx.adaptor.id.clone(), ctx.offset));
        self.offset = ctx.offset;
        if self.emit > 0 {
            self.offset += self.emit;
            ctx.dest.add(Chunk {
                source: ctx.adaptor.clone(),
                data_type: ctx.data_type.clone(),
                stream_name: self.params.clone(),
                seq_id: self.offset,
                data: vec![b'x'; self.emit as usize],
            });
        }
        Ok(())
    }

    fn current_status(&self) -> String {
        self.params.clone()
    }

    fn shutdown(&mut self, _policy: ShutdownPolicy) -> Result<u64, AdaptorError> {
        Ok(self.offset)
    }
}

pub fn scripted_factory(log: &StartLog) -> AdaptorFactory {
    let mut factory = AdaptorFactory::new();
    let log = log.clone();
    factory
        .register(SCRIPTED, move || Box::new(ScriptedAdaptor::new(log.clone())))
        .unwrap();
    factory
}

/// Receiver that keeps every chunk
#[derive(Default)]
pub struct Sink(pub Mutex<Vec<Chunk>>);

impl ChunkReceiver for Sink {
    fn add(&self, chunk: Chunk) {
        self.0.lock().push(chunk);
    }
}

pub fn scripted_registry() -> (Arc<AdaptorRegistry>, StartLog, Arc<Sink>) {
    let log = StartLog::default();
    let sink = Arc::new(Sink::default());
    let registry = Arc::new(AdaptorRegistry::new(scripted_factory(&log), sink.clone()));
    (registry, log, sink)
}

pub fn adaptor_ref(registry: &AdaptorRegistry, id: &str) -> AdaptorRef {
    registry.get(id).unwrap().adaptor_ref().clone()
}

/// How the fake collector answers a post
#[derive(Debug, Clone)]
pub enum PostMode {
    Ack,
    /// Data lands in this sink file; replies `<file> <length after chunk>`
    DelayOn(String),
}

/// In-memory collector fleet
pub struct FakeCollector {
    pub mode: Mutex<PostMode>,
    pub down: Mutex<HashSet<String>>,
    pub posts: Mutex<Vec<(String, Vec<Chunk>)>>,
    file_lengths: Mutex<HashMap<String, u64>>,
    commit_status: Mutex<HashMap<String, Vec<String>>>,
    /// When set, every file is reported durable at its current length
    durable: AtomicBool,
    pub polls: Mutex<Vec<String>>,
}

impl FakeCollector {
    pub fn new(mode: PostMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            down: Mutex::new(HashSet::new()),
            posts: Mutex::new(Vec::new()),
            file_lengths: Mutex::new(HashMap::new()),
            commit_status: Mutex::new(HashMap::new()),
            durable: AtomicBool::new(false),
            polls: Mutex::new(Vec::new()),
        }
    }

    /// Answer commit polls with the length of every file written so far
    pub fn always_durable(self) -> Self {
        self.durable.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_down(&self, collector: &str) {
        self.down.lock().insert(collector.to_string());
    }

    pub fn set_commit_status(&self, collector: &str, lines: &[&str]) {
        self.commit_status.lock().insert(
            collector.to_string(),
            lines.iter().map(|l| l.to_string()).collect(),
        );
    }

    pub fn posted_to(&self) -> Vec<String> {
        self.posts.lock().iter().map(|(c, _)| c.clone()).collect()
    }
}

#[async_trait]
impl CollectorClient for FakeCollector {
    async fn post_chunks(&self, collector: &str, chunks: &[Chunk]) -> Result<Vec<String>> {
        if self.down.lock().contains(collector) {
            bail!("connection refused: {}", collector);
        }
        self.posts
            .lock()
            .push((collector.to_string(), chunks.to_vec()));

        let mode = self.mode.lock().clone();
        let mut lengths = self.file_lengths.lock();
        Ok(chunks
            .iter()
            .map(|c| match &mode {
                PostMode::Ack => format!("ok: {} {}", c.source.id, c.seq_id),
                PostMode::DelayOn(file) => {
                    let len = lengths.entry(file.clone()).or_insert(0);
                    *len += c.len() as u64;
                    format!("{} {}", file, len)
                }
            })
            .collect())
    }

    async fn fetch_commit_status(&self, collector: &str) -> Result<Vec<String>> {
        self.polls.lock().push(collector.to_string());
        if self.down.lock().contains(collector) {
            bail!("connection refused: {}", collector);
        }
        if self.durable.load(Ordering::SeqCst) {
            return Ok(self
                .file_lengths
                .lock()
                .iter()
                .map(|(file, len)| format!("<li>{} {}</li>", file, len))
                .collect());
        }
        Ok(self
            .commit_status
            .lock()
            .get(collector)
            .cloned()
            .unwrap_or_default())
    }
}
