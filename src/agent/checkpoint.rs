//! Checkpointing of the running adaptor set
//!
//! A checkpoint is a list of add commands, one per adaptor, stored as a
//! numbered generation. Generation N is written in full before N-1 is
//! deleted, so a crash leaves at most two generations behind and the lower
//! one is always complete.

use super::registry::AdaptorRegistry;
use anyhow::{Context, Result};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Storage medium for checkpoint generations
pub trait CheckpointStore: Send + Sync {
    /// Every generation number present, in any order
    fn list_generations(&self) -> Result<Vec<u64>>;
    /// Durably store a complete generation
    fn write_generation(&self, generation: u64, lines: &[String]) -> Result<()>;
    fn read_generation(&self, generation: u64) -> Result<Vec<String>>;
    /// Deleting a generation that does not exist succeeds
    fn delete_generation(&self, generation: u64) -> Result<()>;
}

/// Generations stored as `<dir>/<base_name><n>`
pub struct FsCheckpointStore {
    dir: PathBuf,
    base_name: String,
}

impl FsCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, base_name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            base_name: base_name.into(),
        }
    }

    fn generation_path(&self, generation: u64) -> PathBuf {
        self.dir.join(format!("{}{}", self.base_name, generation))
    }

    /// Lock file name doesn't start with the base name, so it never shows
    /// up as a generation
    fn lock_path(&self) -> PathBuf {
        self.dir.join(format!(".{}lock", self.base_name))
    }

    /// Run `operation` while holding the directory lock
    fn with_dir_lock<F, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating checkpoint dir {}", self.dir.display()))?;
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(self.lock_path())?;
        lock_file.lock_exclusive()?;

        let result = operation();

        let _ = lock_file.unlock();
        result
    }
}

impl CheckpointStore for FsCheckpointStore {
    fn list_generations(&self) -> Result<Vec<u64>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("listing checkpoint dir {}", self.dir.display()))
            }
        };

        let mut generations = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(suffix) = name.strip_prefix(&self.base_name) else {
                continue;
            };
            match suffix.parse::<u64>() {
                Ok(n) => generations.push(n),
                Err(_) => warn!(file = %name, "ignoring checkpoint file with non-numeric suffix"),
            }
        }
        Ok(generations)
    }

    fn write_generation(&self, generation: u64, lines: &[String]) -> Result<()> {
        let path = self.generation_path(generation);
        self.with_dir_lock(|| {
            let mut file = File::create(&path)
                .with_context(|| format!("creating checkpoint {}", path.display()))?;
            for line in lines {
                writeln!(file, "{}", line)?;
            }
            file.sync_all()?;
            Ok(())
        })
    }

    fn read_generation(&self, generation: u64) -> Result<Vec<String>> {
        let path = self.generation_path(generation);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("reading checkpoint {}", path.display()))?;
        Ok(content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    fn delete_generation(&self, generation: u64) -> Result<()> {
        let path = self.generation_path(generation);
        self.with_dir_lock(|| match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("deleting checkpoint {}", path.display())),
        })
    }
}

/// Writes and restores checkpoints of an [`AdaptorRegistry`]
pub struct CheckpointManager {
    store: Box<dyn CheckpointStore>,
    /// Next generation number; the lock also serializes writers
    next_generation: Mutex<u64>,
}

impl CheckpointManager {
    pub fn new(store: Box<dyn CheckpointStore>) -> Self {
        Self {
            store,
            next_generation: Mutex::new(0),
        }
    }

    pub fn next_generation(&self) -> u64 {
        *self.next_generation.lock()
    }

    /// Write a new generation for the current registry contents, then delete
    /// the previous one. Returns the generation written.
    pub fn write_checkpoint(&self, registry: &AdaptorRegistry) -> Result<u64> {
        let mut next = self.next_generation.lock();
        let generation = *next;
        let lines = registry.checkpoint_lines();

        self.store.write_generation(generation, &lines)?;
        if generation > 0 {
            if let Err(e) = self.store.delete_generation(generation - 1) {
                warn!(generation = generation - 1, error = %e, "unable to delete previous checkpoint");
            }
        }
        *next = generation + 1;

        info!(generation, adaptors = lines.len(), "checkpoint written");
        Ok(generation)
    }

    /// Write a checkpoint only if the registry changed since the last one.
    ///
    /// A failed write leaves the registry dirty so the next tick retries.
    pub fn checkpoint_if_dirty(&self, registry: &AdaptorRegistry) -> Result<bool> {
        if !registry.take_dirty() {
            return Ok(false);
        }
        match self.write_checkpoint(registry) {
            Ok(_) => Ok(true),
            Err(e) => {
                registry.mark_dirty();
                Err(e)
            }
        }
    }

    /// The lowest-numbered generation and its lines, if any exist
    pub fn authoritative(&self) -> Result<Option<(u64, Vec<String>)>> {
        let generations = self.store.list_generations()?;
        if generations.len() > 2 {
            warn!(
                count = generations.len(),
                "expected at most two checkpoint files"
            );
        }
        let Some(lowest) = generations.into_iter().min() else {
            return Ok(None);
        };
        let lines = self.store.read_generation(lowest)?;
        Ok(Some((lowest, lines)))
    }

    /// Replay the authoritative generation into `registry`.
    ///
    /// Returns false when there was nothing to restore.
    pub fn restore(&self, registry: &AdaptorRegistry) -> Result<bool> {
        let Some((generation, lines)) = self.authoritative()? else {
            info!("no checkpoints found");
            return Ok(false);
        };

        *self.next_generation.lock() = generation + 1;
        info!(generation, lines = lines.len(), "restoring adaptors from checkpoint");
        for line in &lines {
            if let Err(e) = registry.process_add_command(line) {
                warn!(line = %line, error = %e, "checkpoint entry failed to start");
            }
        }
        Ok(true)
    }

    /// Checkpoint timer; runs until `shutdown` fires
    pub async fn run(
        self: Arc<Self>,
        registry: Arc<AdaptorRegistry>,
        period: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let manager = self.clone();
                    let registry = registry.clone();
                    let result = tokio::task::spawn_blocking(move || {
                        manager.checkpoint_if_dirty(&registry)
                    })
                    .await;
                    match result {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => warn!(error = %e, "checkpoint write failed, will retry"),
                        Err(e) => warn!(error = %e, "checkpoint task panicked"),
                    }
                }
                _ = shutdown.recv() => {
                    debug!("checkpoint timer stopping");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fs_store_lists_only_numbered_generations() {
        let dir = TempDir::new().unwrap();
        let store = FsCheckpointStore::new(dir.path(), "cp_");
        store.write_generation(3, &["a".to_string()]).unwrap();
        store.write_generation(4, &[]).unwrap();
        fs::write(dir.path().join("cp_junk"), "x").unwrap();
        fs::write(dir.path().join("other"), "x").unwrap();

        let mut gens = store.list_generations().unwrap();
        gens.sort();
        assert_eq!(gens, vec![3, 4]);
        assert_eq!(store.read_generation(3).unwrap(), vec!["a".to_string()]);
        assert!(store.read_generation(4).unwrap().is_empty());
    }

    #[test]
    fn test_fs_store_missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = FsCheckpointStore::new(dir.path().join("absent"), "cp_");
        assert!(store.list_generations().unwrap().is_empty());
    }

    #[test]
    fn test_delete_missing_generation_succeeds() {
        let dir = TempDir::new().unwrap();
        let store = FsCheckpointStore::new(dir.path(), "cp_");
        store.delete_generation(7).unwrap();
    }
}
