//! Agent configuration, loaded from TOML
//!
//! Every field has a default, so whole sections may be left out.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Reset timeout when no rotate interval is configured
const FALLBACK_RESET_TIMEOUT_MS: u64 = 15 * 60 * 1000;

fn default_control_port() -> u16 {
    9093
}

fn default_true() -> bool {
    true
}

fn default_base_name() -> String {
    "agent_checkpoint_".to_string()
}

fn default_checkpoint_interval_ms() -> u64 {
    5000
}

fn default_collector_port() -> u16 {
    8080
}

fn default_collector_timeout_ms() -> u64 {
    30_000
}

fn default_retry_interval_ms() -> u64 {
    20_000
}

fn default_retries() -> u32 {
    144_000
}

fn default_retry_rate_ms() -> u64 {
    15_000
}

fn default_max_post_bytes() -> usize {
    2 * 1024 * 1024
}

fn default_poll_period_ms() -> u64 {
    30_000
}

fn default_queue_max_bytes() -> usize {
    64 * 1024 * 1024
}

/// Agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    /// File of add commands run on first boot
    #[serde(default)]
    pub initial_adaptors: Option<PathBuf>,
    #[serde(default)]
    pub sender: SenderConfig,
    #[serde(default)]
    pub commit_poll: CommitPollConfig,
    #[serde(default)]
    pub reset: ResetConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

/// Control port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// 0 picks an ephemeral port
    #[serde(default = "default_control_port")]
    pub port: u16,
    /// When false, listen on 127.0.0.1 only
    #[serde(default = "default_true")]
    pub allow_remote: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            port: default_control_port(),
            allow_remote: true,
        }
    }
}

/// Checkpointing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// No checkpoints are written when unset
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default = "default_base_name")]
    pub base_name: String,
    #[serde(default = "default_checkpoint_interval_ms")]
    pub interval_ms: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            base_name: default_base_name(),
            interval_ms: default_checkpoint_interval_ms(),
        }
    }
}

/// Sender
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    #[serde(default)]
    pub collectors: Vec<String>,
    /// One collector per line; takes precedence over `collectors`
    #[serde(default)]
    pub collectors_file: Option<PathBuf>,
    #[serde(default = "default_collector_port")]
    pub default_port: u16,
    #[serde(default = "default_collector_timeout_ms")]
    pub collector_timeout_ms: u64,
    /// Wait after every collector has failed
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Minimum gap between returns to the first collector
    #[serde(default = "default_retry_rate_ms")]
    pub retry_rate_ms: u64,
    #[serde(default = "default_max_post_bytes")]
    pub max_post_bytes: usize,
    #[serde(default = "default_true")]
    pub async_acks: bool,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            collectors: Vec::new(),
            collectors_file: None,
            default_port: default_collector_port(),
            collector_timeout_ms: default_collector_timeout_ms(),
            retry_interval_ms: default_retry_interval_ms(),
            retries: default_retries(),
            retry_rate_ms: default_retry_rate_ms(),
            max_post_bytes: default_max_post_bytes(),
            async_acks: true,
        }
    }
}

/// Commit polling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitPollConfig {
    #[serde(default = "default_poll_period_ms")]
    pub period_ms: u64,
    /// When empty, the sender's collector list is polled
    #[serde(default)]
    pub hosts: Vec<String>,
}

impl Default for CommitPollConfig {
    fn default() -> Self {
        Self {
            period_ms: default_poll_period_ms(),
            hosts: Vec::new(),
        }
    }
}

/// Timeout resets
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResetConfig {
    /// Collector file rotation interval; the timeout defaults to twice this
    #[serde(default)]
    pub rotate_interval_ms: Option<u64>,
    /// Explicit timeout, wins over everything else
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl ResetConfig {
    pub fn timeout(&self) -> Duration {
        let ms = self
            .timeout_ms
            .or_else(|| self.rotate_interval_ms.map(|r| r.saturating_mul(2)))
            .unwrap_or(FALLBACK_RESET_TIMEOUT_MS);
        Duration::from_millis(ms)
    }
}

/// Chunk queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_max_bytes")]
    pub max_bytes: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_queue_max_bytes(),
        }
    }
}

impl AgentConfig {
    /// Default config file path
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config/collect-agent/agent.toml")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read config file '{}': {}", path.display(), e))?;
        Self::from_toml(&content)
            .map_err(|e| anyhow!("Invalid config file '{}': {}", path.display(), e))
    }

    /// Load the file if it exists, else use defaults
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: AgentConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reports every problem at once
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.checkpoint.base_name.is_empty() {
            errors.push("checkpoint.base_name must not be empty".to_string());
        }
        if self
            .checkpoint
            .base_name
            .contains(|c: char| c == '/' || c == '\\')
        {
            errors.push("checkpoint.base_name must not contain path separators".to_string());
        }
        if self.checkpoint.interval_ms == 0 {
            errors.push("checkpoint.interval_ms must be positive".to_string());
        }
        if self.sender.max_post_bytes == 0 {
            errors.push("sender.max_post_bytes must be positive".to_string());
        }
        if self.sender.collector_timeout_ms == 0 {
            errors.push("sender.collector_timeout_ms must be positive".to_string());
        }
        if self.commit_poll.period_ms == 0 {
            errors.push("commit_poll.period_ms must be positive".to_string());
        }
        if self.reset.timeout().is_zero() {
            errors.push("reset timeout must be positive".to_string());
        }
        if self.queue.max_bytes == 0 {
            errors.push("queue.max_bytes must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("invalid configuration:\n  - {}", errors.join("\n  - ")))
        }
    }

    /// Checkpoint directory; None when disabled or unset
    pub fn checkpoint_dir(&self) -> Option<&Path> {
        if self.checkpoint.enabled {
            self.checkpoint.dir.as_deref()
        } else {
            None
        }
    }
}
