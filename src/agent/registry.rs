//! Adaptor registry
//!
//! Owns every running adaptor together with its committed offset. All
//! mutation of the id map goes through one write lock; readers take
//! consistent snapshots under the read lock.

use super::command::AddCommand;
use super::offset::OffsetTracker;
use crate::adaptor::naming::{sanitize_adaptor_id, synthesize_adaptor_id};
use crate::adaptor::{
    Adaptor, AdaptorFactory, AdaptorRef, ChunkReceiver, ShutdownPolicy, StartContext,
};
use crate::error::{RegistryError, RegistryResult};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// One running adaptor and its bookkeeping
pub struct AdaptorRecord {
    adaptor_ref: AdaptorRef,
    class_name: String,
    data_type: String,
    params: String,
    start_offset: u64,
    started_at: String,
    offset: OffsetTracker,
    adaptor: Mutex<Box<dyn Adaptor>>,
}

impl AdaptorRecord {
    pub fn id(&self) -> &str {
        &self.adaptor_ref.id
    }

    pub fn adaptor_ref(&self) -> &AdaptorRef {
        &self.adaptor_ref
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn data_type(&self) -> &str {
        &self.data_type
    }

    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    /// Highest offset confirmed durable downstream
    pub fn committed_offset(&self) -> u64 {
        self.offset.get()
    }

    pub fn status(&self) -> String {
        self.adaptor.lock().current_status()
    }

    /// Parameters that reproduce this adaptor when replayed through `add`
    pub fn replay_params(&self) -> String {
        self.adaptor
            .lock()
            .restart_params()
            .unwrap_or_else(|| self.params.clone())
    }

    /// The add command that restarts this adaptor at its committed offset
    pub fn replay_command(&self) -> AddCommand {
        AddCommand {
            id: Some(self.adaptor_ref.id.clone()),
            class_name: self.class_name.clone(),
            data_type: self.data_type.clone(),
            params: self.replay_params(),
            offset: self.committed_offset(),
        }
    }
}

/// Serializable view of one adaptor
#[derive(Debug, Clone, Serialize)]
pub struct AdaptorSnapshot {
    pub id: String,
    pub instance: u64,
    pub class_name: String,
    pub data_type: String,
    pub params: String,
    pub offset: u64,
    pub status: String,
    pub started_at: String,
}

pub struct AdaptorRegistry {
    factory: AdaptorFactory,
    dest: Arc<dyn ChunkReceiver>,
    adaptors: RwLock<HashMap<String, Arc<AdaptorRecord>>>,
    next_instance: AtomicU64,
    dirty: AtomicBool,
}

impl AdaptorRegistry {
    pub fn new(factory: AdaptorFactory, dest: Arc<dyn ChunkReceiver>) -> Self {
        Self {
            factory,
            dest,
            adaptors: RwLock::new(HashMap::new()),
            next_instance: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn factory(&self) -> &AdaptorFactory {
        &self.factory
    }

    /// Start an adaptor, or return the id of the one already running under
    /// the same id
    pub fn add(
        &self,
        id: Option<&str>,
        class_name: &str,
        data_type: &str,
        params: &str,
        offset: u64,
    ) -> RegistryResult<String> {
        self.add_instance(id, class_name, data_type, params, offset)
            .map(|r| r.id)
    }

    pub fn add_command(&self, cmd: &AddCommand) -> RegistryResult<String> {
        self.add(
            cmd.id.as_deref(),
            &cmd.class_name,
            &cmd.data_type,
            &cmd.params,
            cmd.offset,
        )
    }

    /// Parse and execute one `add` line
    pub fn process_add_command(&self, line: &str) -> RegistryResult<String> {
        let cmd = AddCommand::parse(line).map_err(|e| {
            warn!(line = %line, "bad add command");
            e
        })?;
        self.add_command(&cmd)
    }

    fn add_instance(
        &self,
        id: Option<&str>,
        class_name: &str,
        data_type: &str,
        params: &str,
        offset: u64,
    ) -> RegistryResult<AdaptorRef> {
        let mut adaptor = self.factory.create(class_name)?;
        let stream_name = adaptor.parse_args(data_type, params).map_err(|e| {
            warn!(class = %class_name, params = %params, "adaptor rejected params");
            e
        })?;
        let id = match id {
            Some(id) => sanitize_adaptor_id(id),
            None => synthesize_adaptor_id(class_name, data_type, &stream_name),
        };

        let mut adaptors = self.adaptors.write();
        if let Some(existing) = adaptors.get(&id) {
            info!(adaptor_id = %id, "adaptor already running, not starting a second copy");
            return Ok(existing.adaptor_ref.clone());
        }

        let adaptor_ref = AdaptorRef::new(id.clone(), self.next_instance.fetch_add(1, Ordering::SeqCst) + 1);
        adaptor
            .start(StartContext {
                adaptor: adaptor_ref.clone(),
                data_type: data_type.to_string(),
                offset,
                dest: self.dest.clone(),
            })
            .map_err(|e| {
                error!(adaptor_id = %id, error = %e, "adaptor failed to start");
                e
            })?;

        adaptors.insert(
            id.clone(),
            Arc::new(AdaptorRecord {
                adaptor_ref: adaptor_ref.clone(),
                class_name: class_name.to_string(),
                data_type: data_type.to_string(),
                params: params.to_string(),
                start_offset: offset,
                started_at: Utc::now().to_rfc3339(),
                offset: OffsetTracker::new(offset),
                adaptor: Mutex::new(adaptor),
            }),
        );
        drop(adaptors);
        self.mark_dirty();

        info!(adaptor_id = %id, class = %class_name, offset, "adaptor started");
        Ok(adaptor_ref)
    }

    /// Stop and forget an adaptor; returns the offset it reached
    pub fn remove(&self, id: &str, policy: ShutdownPolicy) -> RegistryResult<u64> {
        let record = self.adaptors.write().remove(id).ok_or_else(|| {
            warn!(adaptor_id = %id, "tried to stop an adaptor that is not running");
            RegistryError::NotRunning(id.to_string())
        })?;
        self.mark_dirty();
        Ok(Self::stop_record(&record, policy))
    }

    fn stop_record(record: &AdaptorRecord, policy: ShutdownPolicy) -> u64 {
        let result = record.adaptor.lock().shutdown(policy);
        match result {
            Ok(offset) => {
                info!(adaptor_id = %record.id(), %policy, offset, "adaptor stopped");
                offset
            }
            Err(e) => {
                error!(adaptor_id = %record.id(), %policy, error = %e, "adaptor failed to stop cleanly");
                record.committed_offset()
            }
        }
    }

    /// Stop every adaptor; returns how many were stopped
    pub fn stop_all(&self, policy: ShutdownPolicy) -> usize {
        let ids: Vec<String> = self.adaptors.read().keys().cloned().collect();
        ids.iter()
            .filter(|id| self.remove(id, policy).is_ok())
            .count()
    }

    /// Shut every adaptor down but keep the records, so a final checkpoint
    /// still lists them
    pub fn halt_all(&self) -> usize {
        let records: Vec<Arc<AdaptorRecord>> = self.adaptors.read().values().cloned().collect();
        for record in &records {
            Self::stop_record(record, ShutdownPolicy::HardStop);
        }
        records.len()
    }

    /// Forget every record without stopping anything
    pub fn clear(&self) {
        self.adaptors.write().clear();
    }

    pub fn get(&self, id: &str) -> Option<Arc<AdaptorRecord>> {
        self.adaptors.read().get(id).cloned()
    }

    pub fn count(&self) -> usize {
        self.adaptors.read().len()
    }

    /// id -> "class status offset", sorted by id
    pub fn list(&self) -> BTreeMap<String, String> {
        self.records()
            .into_iter()
            .map(|r| {
                let line = format!("{} {} {}", r.class_name, r.status(), r.committed_offset());
                (r.id().to_string(), line)
            })
            .collect()
    }

    pub fn snapshot(&self) -> Vec<AdaptorSnapshot> {
        self.records()
            .into_iter()
            .map(|r| AdaptorSnapshot {
                id: r.id().to_string(),
                instance: r.adaptor_ref.instance,
                class_name: r.class_name.clone(),
                data_type: r.data_type.clone(),
                params: r.replay_params(),
                offset: r.committed_offset(),
                status: r.status(),
                started_at: r.started_at.clone(),
            })
            .collect()
    }

    /// One replayable add line per running adaptor, sorted by id
    pub fn checkpoint_lines(&self) -> Vec<String> {
        self.records()
            .into_iter()
            .map(|r| r.replay_command().to_line())
            .collect()
    }

    fn records(&self) -> Vec<Arc<AdaptorRecord>> {
        let mut records: Vec<Arc<AdaptorRecord>> = self.adaptors.read().values().cloned().collect();
        records.sort_by(|a, b| a.id().cmp(b.id()));
        records
    }

    /// The running record for exactly this instance
    fn instance(&self, adaptor: &AdaptorRef) -> Option<Arc<AdaptorRecord>> {
        self.adaptors
            .read()
            .get(&adaptor.id)
            .filter(|r| r.adaptor_ref.instance == adaptor.instance)
            .cloned()
    }

    pub fn is_running(&self, adaptor: &AdaptorRef) -> bool {
        self.instance(adaptor).is_some()
    }

    /// Committed offset of a running instance
    pub fn offset_of(&self, adaptor: &AdaptorRef) -> Option<u64> {
        self.instance(adaptor).map(|r| r.committed_offset())
    }

    /// Record that everything up to `offset` is durable downstream.
    ///
    /// Returns true if the committed offset advanced.
    pub fn report_commit(&self, adaptor: &AdaptorRef, offset: u64) -> bool {
        let Some(record) = self.instance(adaptor) else {
            warn!(adaptor = %adaptor, offset, "commit for adaptor that is no longer running");
            return false;
        };
        let advanced = record.offset.advance(offset);
        if advanced {
            debug!(adaptor_id = %adaptor.id, offset, "offset committed");
            self.mark_dirty();
        }
        advanced
    }

    /// Stop an instance and start it again at its committed offset.
    ///
    /// Returns the new instance, or `None` if the instance already went away.
    pub fn reset_adaptor(&self, adaptor: &AdaptorRef) -> RegistryResult<Option<AdaptorRef>> {
        let record = {
            let mut adaptors = self.adaptors.write();
            let current = adaptors
                .get(&adaptor.id)
                .map_or(false, |r| r.adaptor_ref.instance == adaptor.instance);
            if current {
                adaptors.remove(&adaptor.id)
            } else {
                None
            }
        };
        let Some(record) = record else {
            debug!(adaptor = %adaptor, "adaptor gone before reset, skipping");
            return Ok(None);
        };

        let replay = record.replay_command();
        Self::stop_record(&record, ShutdownPolicy::Restarting);
        self.mark_dirty();

        let restarted = self.add_instance(
            replay.id.as_deref(),
            &replay.class_name,
            &replay.data_type,
            &replay.params,
            replay.offset,
        )?;
        info!(adaptor_id = %restarted.id, offset = replay.offset, "adaptor reset to committed offset");
        Ok(Some(restarted))
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Clear the dirty flag, returning its previous value
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::SeqCst)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }
}
