//! Collector endpoints
//!
//! [`CollectorList`] rotates through the known collectors; the
//! [`CollectorClient`] trait is the transport seam used by the sender and the
//! commit poller.

use crate::adaptor::Chunk;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::debug;

/// Path on a collector that accepts posted chunks
pub const POST_PATH: &str = "chukwa";
/// Path on a collector that lists committed file lengths
pub const COMMIT_STATUS_PATH: &str = "acks";
/// Response lines starting with this confirm durable receipt
pub const ACK_PREFIX: &str = "ok: ";

fn has_port(s: &str) -> bool {
    s.match_indices(':')
        .any(|(i, _)| s[i + 1..].starts_with(|c: char| c.is_ascii_digit()))
}

fn has_resource(s: &str) -> bool {
    s.as_bytes()
        .windows(2)
        .any(|w| (w[0].is_ascii_alphanumeric() || w[0] == b'_') && w[1] == b'/')
}

/// Normalize `host`, `host:port` or `scheme://host[:port]` to a base URL
/// ending in `/`
pub fn canonicalize_collector(line: &str, default_port: u16) -> String {
    let line = line.trim();
    let mut url = if !line.contains("://") {
        if has_port(line) {
            format!("http://{}/", line)
        } else {
            format!("http://{}:{}", line, default_port)
        }
    } else if has_port(line) {
        line.to_string()
    } else {
        format!("{}:{}", line, default_port)
    };
    if !has_resource(&url) {
        url.push('/');
    }
    url
}

/// Round-robin list of collectors that limits how often a full lap restarts
#[derive(Debug, Clone)]
pub struct CollectorList {
    collectors: Vec<String>,
    next: usize,
    retry_rate: Duration,
    last_look_at_first: Option<Instant>,
}

impl CollectorList {
    pub fn new(collectors: Vec<String>, retry_rate: Duration) -> Self {
        Self {
            collectors,
            next: 0,
            retry_rate,
            last_look_at_first: None,
        }
    }

    /// Canonicalize each non-blank, non-comment line
    pub fn from_lines<I, S>(lines: I, default_port: u16, retry_rate: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let collectors = lines
            .into_iter()
            .filter_map(|l| {
                let l = l.as_ref().trim();
                if l.is_empty() || l.starts_with('#') {
                    None
                } else {
                    Some(canonicalize_collector(l, default_port))
                }
            })
            .collect();
        Self::new(collectors, retry_rate)
    }

    pub fn load_file(path: &Path, default_port: u16, retry_rate: Duration) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading collectors file {}", path.display()))?;
        Ok(Self::from_lines(content.lines(), default_port, retry_rate))
    }

    pub fn urls(&self) -> &[String] {
        &self.collectors
    }

    pub fn len(&self) -> usize {
        self.collectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }

    pub fn has_next_at(&self, now: Instant) -> bool {
        if self.collectors.is_empty() {
            return false;
        }
        if self.next != 0 {
            return true;
        }
        match self.last_look_at_first {
            None => true,
            Some(last) => now.saturating_duration_since(last) > self.retry_rate,
        }
    }

    pub fn next_at(&mut self, now: Instant) -> Option<String> {
        if !self.has_next_at(now) {
            return None;
        }
        let current = self.next;
        self.next = (self.next + 1) % self.collectors.len();
        if current == 0 {
            self.last_look_at_first = Some(now);
        }
        Some(self.collectors[current].clone())
    }

    pub fn has_next(&self) -> bool {
        self.has_next_at(Instant::now())
    }

    pub fn next_collector(&mut self) -> Option<String> {
        self.next_at(Instant::now())
    }
}

/// Transport to a collector
#[async_trait]
pub trait CollectorClient: Send + Sync {
    /// Post chunks; returns the response body lines, one per chunk
    async fn post_chunks(&self, collector: &str, chunks: &[Chunk]) -> Result<Vec<String>>;

    /// Fetch the collector's committed-file listing
    async fn fetch_commit_status(&self, collector: &str) -> Result<Vec<String>>;
}

/// [`CollectorClient`] over HTTP
#[derive(Debug, Clone)]
pub struct HttpCollectorClient {
    client: Client,
}

impl HttpCollectorClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow!("Cannot create HTTP client: {}", e))?;
        Ok(Self { client })
    }

    async fn read_lines(response: reqwest::Response, dest: &str) -> Result<Vec<String>> {
        let status = response.status();
        if !status.is_success() {
            bail!("collector {} returned {}", dest, status);
        }
        let body = response.text().await?;
        debug!(dest = %dest, bytes = body.len(), "collector responded");
        Ok(body.lines().map(str::to_string).collect())
    }
}

#[async_trait]
impl CollectorClient for HttpCollectorClient {
    async fn post_chunks(&self, collector: &str, chunks: &[Chunk]) -> Result<Vec<String>> {
        let dest = format!("{}{}", collector, POST_PATH);
        let response = self
            .client
            .post(&dest)
            .json(chunks)
            .send()
            .await
            .with_context(|| format!("posting to {}", dest))?;
        Self::read_lines(response, &dest).await
    }

    async fn fetch_commit_status(&self, collector: &str) -> Result<Vec<String>> {
        let dest = format!("{}{}", collector, COMMIT_STATUS_PATH);
        let response = self
            .client
            .get(&dest)
            .send()
            .await
            .with_context(|| format!("polling {}", dest))?;
        Self::read_lines(response, &dest).await
    }
}
