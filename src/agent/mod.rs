//! Agent context: owns the registry, checkpointing and delivery pipeline
//! and wires them together. Every component receives what it needs at
//! construction; there is no global agent instance.

pub mod checkpoint;
pub mod command;
pub mod control;
pub mod offset;
pub mod queue;
pub mod registry;

use crate::adaptor::AdaptorFactory;
use crate::config::AgentConfig;
use crate::sender::{
    CollectorClient, CollectorList, CommitCoordinator, HttpCollectorClient, HttpSender,
    ResetMonitor, SenderSettings,
};
use anyhow::{bail, Result};
use checkpoint::{CheckpointManager, FsCheckpointStore};
use control::{AgentControl, ControlServer};
use parking_lot::Mutex;
use queue::ChunkQueue;
use registry::AdaptorRegistry;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Replay an add-command file, such as the initial adaptors list
pub fn load_adaptors_file(registry: &AdaptorRegistry, path: &Path) -> Result<usize> {
    let content = std::fs::read_to_string(path)?;
    let mut started = 0;
    for line in content.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match registry.process_add_command(line) {
            Ok(_) => started += 1,
            Err(e) => warn!(line = %line, error = %e, "initial adaptor failed to start"),
        }
    }
    Ok(started)
}

/// Collectors from the file if configured, else the inline list
fn configured_collectors(config: &AgentConfig) -> Result<CollectorList> {
    let retry_rate = Duration::from_millis(config.sender.retry_rate_ms);
    match &config.sender.collectors_file {
        Some(path) => CollectorList::load_file(path, config.sender.default_port, retry_rate),
        None => Ok(CollectorList::from_lines(
            &config.sender.collectors,
            config.sender.default_port,
            retry_rate,
        )),
    }
}

/// Control-protocol side of the agent
struct AgentHandle {
    config: AgentConfig,
    sender: Option<Arc<HttpSender>>,
    stop: Arc<Notify>,
}

impl AgentControl for AgentHandle {
    fn reload_collectors(&self) -> Result<()> {
        let Some(sender) = &self.sender else {
            bail!("no sender running");
        };
        let list = configured_collectors(&self.config)?;
        info!(collectors = list.len(), "reloaded collectors");
        sender.set_collectors(list);
        Ok(())
    }

    fn request_stop(&self) {
        self.stop.notify_one();
    }
}

pub struct Agent {
    config: AgentConfig,
    registry: Arc<AdaptorRegistry>,
    queue: Arc<ChunkQueue>,
    checkpoints: Option<Arc<CheckpointManager>>,
    coordinator: Arc<CommitCoordinator>,
    sender: Option<Arc<HttpSender>>,
    control_addr: Option<SocketAddr>,
    stop: Arc<Notify>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Agent {
    /// Build the components without starting any background work
    pub fn new(config: AgentConfig, factory: AdaptorFactory) -> Self {
        let queue = Arc::new(ChunkQueue::new(config.queue.max_bytes));
        let registry = Arc::new(AdaptorRegistry::new(factory, queue.clone()));
        let checkpoints = config.checkpoint_dir().map(|dir| {
            Arc::new(CheckpointManager::new(Box::new(FsCheckpointStore::new(
                dir,
                config.checkpoint.base_name.clone(),
            ))))
        });
        let reset = Arc::new(ResetMonitor::new(registry.clone(), config.reset.timeout()));
        let coordinator = Arc::new(CommitCoordinator::new(registry.clone(), reset));
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            registry,
            queue,
            checkpoints,
            coordinator,
            sender: None,
            control_addr: None,
            stop: Arc::new(Notify::new()),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> &Arc<AdaptorRegistry> {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<ChunkQueue> {
        &self.queue
    }

    pub fn coordinator(&self) -> &Arc<CommitCoordinator> {
        &self.coordinator
    }

    pub fn checkpoints(&self) -> Option<&Arc<CheckpointManager>> {
        self.checkpoints.as_ref()
    }

    pub fn control_addr(&self) -> Option<SocketAddr> {
        self.control_addr
    }

    /// Restore from the last checkpoint, or seed from the initial adaptors
    /// file when no checkpoint exists
    pub fn restore(&self) {
        let restored = match &self.checkpoints {
            Some(manager) => match manager.restore(&self.registry) {
                Ok(restored) => restored,
                Err(e) => {
                    warn!(error = %e, "checkpoint restore failed, starting empty");
                    false
                }
            },
            None => false,
        };
        if restored {
            return;
        }
        if let Some(path) = &self.config.initial_adaptors {
            match load_adaptors_file(&self.registry, path) {
                Ok(n) => info!(count = n, path = %path.display(), "started initial adaptors"),
                Err(e) => warn!(path = %path.display(), error = %e, "couldn't read initial adaptors"),
            }
        }
    }

    /// Restore state, then start the sender, commit poller, reset monitor,
    /// checkpoint timer and control socket
    pub async fn start(&mut self) -> Result<()> {
        self.start_with_client(Arc::new(HttpCollectorClient::new(Duration::from_millis(
            self.config.sender.collector_timeout_ms,
        ))?))
        .await
    }

    pub async fn start_with_client(&mut self, client: Arc<dyn CollectorClient>) -> Result<()> {
        self.restore();
        let mut tasks = Vec::new();

        let collectors = configured_collectors(&self.config)?;
        if collectors.is_empty() {
            warn!("no collectors configured, chunks will stay queued");
        } else {
            let poll_hosts = if self.config.commit_poll.hosts.is_empty() {
                collectors.urls().to_vec()
            } else {
                CollectorList::from_lines(
                    &self.config.commit_poll.hosts,
                    self.config.sender.default_port,
                    Duration::ZERO,
                )
                .urls()
                .to_vec()
            };

            let sender = Arc::new(HttpSender::new(
                self.queue.clone(),
                client.clone(),
                self.coordinator.clone(),
                collectors,
                SenderSettings {
                    max_post_bytes: self.config.sender.max_post_bytes,
                    retry_interval: Duration::from_millis(self.config.sender.retry_interval_ms),
                    retries: self.config.sender.retries,
                    async_acks: self.config.sender.async_acks,
                },
            ));
            tasks.push(tokio::spawn(sender.clone().run(self.shutdown_tx.subscribe())));
            self.sender = Some(sender);

            if self.config.sender.async_acks {
                tasks.push(tokio::spawn(self.coordinator.clone().run(
                    client,
                    poll_hosts,
                    Duration::from_millis(self.config.commit_poll.period_ms),
                    self.shutdown_tx.subscribe(),
                )));
                tasks.push(tokio::spawn(
                    self.coordinator
                        .reset_monitor()
                        .clone()
                        .run(self.shutdown_tx.subscribe()),
                ));
            }
        }

        if let Some(manager) = &self.checkpoints {
            tasks.push(tokio::spawn(manager.clone().run(
                self.registry.clone(),
                Duration::from_millis(self.config.checkpoint.interval_ms),
                self.shutdown_tx.subscribe(),
            )));
        }

        let handle = Arc::new(AgentHandle {
            config: self.config.clone(),
            sender: self.sender.clone(),
            stop: self.stop.clone(),
        });
        let server = ControlServer::bind(
            self.registry.clone(),
            handle,
            self.config.control.port,
            self.config.control.allow_remote,
        )
        .await?;
        self.control_addr = Some(server.local_addr()?);
        tasks.push(tokio::spawn(server.run(self.shutdown_tx.subscribe())));

        self.tasks.lock().extend(tasks);
        info!(adaptors = self.registry.count(), "agent started");
        Ok(())
    }

    /// Resolves once `stopagent` is received over the control socket
    pub async fn stopped(&self) {
        self.stop.notified().await;
    }

    /// Stop every adaptor, write a final checkpoint if anything changed,
    /// then stop the background tasks
    pub async fn shutdown(&self) {
        info!("agent shutting down");
        let _ = self.shutdown_tx.send(());

        let registry = self.registry.clone();
        let checkpoints = self.checkpoints.clone();
        let result = tokio::task::spawn_blocking(move || {
            registry.halt_all();
            if let Some(manager) = checkpoints {
                if let Err(e) = manager.checkpoint_if_dirty(&registry) {
                    warn!(error = %e, "final checkpoint failed");
                }
            }
            registry.clear();
        })
        .await;
        if let Err(e) = result {
            warn!(error = %e, "adaptor shutdown panicked");
        }

        self.queue.close();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("agent stopped");
    }
}
