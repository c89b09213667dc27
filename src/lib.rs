//! Collect Agent - runs data-source adaptors and delivers their data to collectors reliably

pub mod adaptor;
pub mod agent;
pub mod config;
pub mod error;
pub mod sender;

pub use adaptor::{Adaptor, AdaptorFactory, AdaptorRef, Chunk, ChunkReceiver, ShutdownPolicy, StartContext};
pub use agent::checkpoint::{CheckpointManager, CheckpointStore, FsCheckpointStore};
pub use agent::command::{AddCommand, ControlCommand};
pub use agent::control::{AgentControl, ControlHandler, ControlServer, Reply};
pub use agent::queue::ChunkQueue;
pub use agent::registry::{AdaptorRegistry, AdaptorSnapshot};
pub use agent::Agent;
pub use config::AgentConfig;
pub use error::{AdaptorError, RegistryError, RegistryResult};
pub use sender::{
    CollectorClient, CollectorList, CommitCoordinator, CommitListEntry, DelayedCommit,
    HttpCollectorClient, HttpSender, ResetMonitor, SenderSettings,
};
