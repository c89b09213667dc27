//! Checkpoint write/restore and crash recovery

mod common;

use anyhow::{bail, Result};
use collect_agent::{
    Agent, AgentConfig, CheckpointManager, CheckpointStore, FsCheckpointStore, ShutdownPolicy,
};
use common::{adaptor_ref, scripted_factory, scripted_registry, StartLog, SCRIPTED};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const BASE: &str = "agent_checkpoint_";

fn manager(dir: &Path) -> CheckpointManager {
    CheckpointManager::new(Box::new(FsCheckpointStore::new(dir, BASE)))
}

fn checkpoint_files(dir: &Path) -> BTreeSet<String> {
    fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .filter(|n| n.starts_with(BASE))
        .collect()
}

/// (class, datatype, params, offset) for every adaptor
fn tuples(registry: &collect_agent::AdaptorRegistry) -> Vec<(String, String, String, u64)> {
    registry
        .snapshot()
        .into_iter()
        .map(|s| (s.class_name, s.data_type, s.params, s.offset))
        .collect()
}

#[test]
fn test_round_trip_restores_every_adaptor() {
    // Given: three adaptors with committed progress
    let dir = TempDir::new().unwrap();
    let (registry, _, _) = scripted_registry();
    registry.add(Some("a"), SCRIPTED, "logs", "/var/log/a", 0).unwrap();
    registry.add(Some("b"), SCRIPTED, "metrics", "cpu mem", 10).unwrap();
    registry.add(None, SCRIPTED, "logs", "/var/log/c", 0).unwrap();
    registry.report_commit(&adaptor_ref(&registry, "adaptor_a"), 300);
    let before = tuples(&registry);

    // When: a checkpoint is written, the registry cleared, and restored
    let writer = manager(dir.path());
    writer.write_checkpoint(&registry).unwrap();
    registry.stop_all(ShutdownPolicy::HardStop);
    assert_eq!(registry.count(), 0);

    let (restored, log, _) = scripted_registry();
    let reader = manager(dir.path());
    assert!(reader.restore(&restored).unwrap());

    // Then: identical tuples, started at their committed offsets
    assert_eq!(tuples(&restored), before);
    assert_eq!(log.starts_of("adaptor_a"), vec![300]);
    assert_eq!(reader.next_generation(), 1);
}

#[test]
fn test_new_generation_replaces_previous() {
    let dir = TempDir::new().unwrap();
    let (registry, _, _) = scripted_registry();
    registry.add(Some("a"), SCRIPTED, "logs", "p", 0).unwrap();

    let m = manager(dir.path());
    assert_eq!(m.write_checkpoint(&registry).unwrap(), 0);
    assert_eq!(m.write_checkpoint(&registry).unwrap(), 1);
    assert_eq!(m.write_checkpoint(&registry).unwrap(), 2);

    assert_eq!(checkpoint_files(dir.path()), BTreeSet::from([format!("{}2", BASE)]));
}

#[test]
fn test_crash_between_write_and_delete_restores_older_generation() {
    // Given: generation 4 is authoritative; generation 5 was being written
    // when the agent died, so both files exist
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join(format!("{}4", BASE)),
        "ADD adaptor_a = ScriptedAdaptor logs p 40\n",
    )
    .unwrap();
    fs::write(
        dir.path().join(format!("{}5", BASE)),
        "ADD adaptor_a = ScriptedAdaptor logs p 50\nADD adaptor_b = Scripted",
    )
    .unwrap();

    // When: restoring
    let (registry, log, _) = scripted_registry();
    let m = manager(dir.path());
    assert!(m.restore(&registry).unwrap());

    // Then: the lowest generation wins and numbering continues after it
    assert_eq!(log.starts(), vec![("adaptor_a".to_string(), 40)]);
    assert_eq!(m.next_generation(), 5);

    // and the next write replaces the partial file and removes the old one
    m.write_checkpoint(&registry).unwrap();
    assert_eq!(checkpoint_files(dir.path()), BTreeSet::from([format!("{}5", BASE)]));
    let content = fs::read_to_string(dir.path().join(format!("{}5", BASE))).unwrap();
    assert_eq!(content, "ADD adaptor_a = ScriptedAdaptor logs p 40\n");
}

#[test]
fn test_restore_with_extra_files_still_uses_lowest() {
    let dir = TempDir::new().unwrap();
    for (n, offset) in [(7, 70), (9, 90), (8, 80)] {
        fs::write(
            dir.path().join(format!("{}{}", BASE, n)),
            format!("ADD adaptor_a = ScriptedAdaptor logs p {}\n", offset),
        )
        .unwrap();
    }
    let (registry, log, _) = scripted_registry();
    let m = manager(dir.path());
    assert!(m.restore(&registry).unwrap());
    assert_eq!(log.starts_of("adaptor_a"), vec![70]);
    assert_eq!(m.next_generation(), 8);
}

#[test]
fn test_restore_skips_lines_that_fail() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join(format!("{}0", BASE)),
        "ADD adaptor_a = UnknownAdaptor logs p 1\nnot a command\nADD adaptor_b = ScriptedAdaptor logs p 2\n",
    )
    .unwrap();
    let (registry, _, _) = scripted_registry();
    assert!(manager(dir.path()).restore(&registry).unwrap());
    assert_eq!(registry.count(), 1);
    assert!(registry.get("adaptor_b").is_some());
}

#[test]
fn test_restore_without_checkpoints_returns_false() {
    let dir = TempDir::new().unwrap();
    let (registry, _, _) = scripted_registry();
    assert!(!manager(&dir.path().join("missing")).restore(&registry).unwrap());
    assert_eq!(registry.count(), 0);
}

#[test]
fn test_checkpoint_only_when_dirty() {
    let dir = TempDir::new().unwrap();
    let (registry, _, _) = scripted_registry();
    let m = manager(dir.path());

    assert!(!m.checkpoint_if_dirty(&registry).unwrap());
    registry.add(Some("a"), SCRIPTED, "logs", "p", 0).unwrap();
    assert!(m.checkpoint_if_dirty(&registry).unwrap());
    assert!(!m.checkpoint_if_dirty(&registry).unwrap());
}

/// Store whose writes always fail
struct BrokenStore;

impl CheckpointStore for BrokenStore {
    fn list_generations(&self) -> Result<Vec<u64>> {
        Ok(Vec::new())
    }
    fn write_generation(&self, _generation: u64, _lines: &[String]) -> Result<()> {
        bail!("disk full")
    }
    fn read_generation(&self, _generation: u64) -> Result<Vec<String>> {
        bail!("no such generation")
    }
    fn delete_generation(&self, _generation: u64) -> Result<()> {
        Ok(())
    }
}

#[test]
fn test_failed_write_keeps_registry_dirty() {
    let (registry, _, _) = scripted_registry();
    registry.add(Some("a"), SCRIPTED, "logs", "p", 0).unwrap();
    let m = CheckpointManager::new(Box::new(BrokenStore));

    assert!(m.checkpoint_if_dirty(&registry).is_err());
    assert!(registry.is_dirty());
    assert_eq!(m.next_generation(), 0);
}

#[test]
fn test_initial_adaptors_only_on_first_boot() {
    // Given: an initial adaptors file and an empty checkpoint dir
    let dir = TempDir::new().unwrap();
    let initial = dir.path().join("initial_adaptors");
    fs::write(&initial, "# seed\nadd seed = ScriptedAdaptor logs p 0\n").unwrap();

    let mut config = AgentConfig::default();
    config.checkpoint.dir = Some(dir.path().join("checkpoints"));
    config.initial_adaptors = Some(initial);

    // When: the first boot restores
    let log = StartLog::default();
    let agent = Agent::new(config.clone(), scripted_factory(&log));
    agent.restore();

    // Then: the seed adaptor runs
    assert!(agent.registry().get("adaptor_seed").is_some());

    // Given: a checkpoint that no longer lists the seed adaptor
    agent
        .registry()
        .remove("adaptor_seed", ShutdownPolicy::HardStop)
        .unwrap();
    agent.registry().add(Some("other"), SCRIPTED, "logs", "p", 0).unwrap();
    agent
        .checkpoints()
        .unwrap()
        .write_checkpoint(agent.registry())
        .unwrap();

    // When: the agent boots again
    let second = Agent::new(config, scripted_factory(&log));
    second.restore();

    // Then: state comes from the checkpoint, not the initial file
    assert!(second.registry().get("adaptor_other").is_some());
    assert!(second.registry().get("adaptor_seed").is_none());
}
