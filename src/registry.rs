//! Shared on-disk instance registry.
//!
//! Any number of cooperating processes on one machine read and rewrite a
//! single JSON file through an advisory filesystem mutex (a lock sentinel
//! created with exclusive-create semantics). The algorithm assumes nothing
//! beyond `create-exclusive`, `stat`, `rename` and `unlink`, so it behaves
//! identically on every POSIX-like target, with no `flock`/`fcntl`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};

pub const REGISTRY_FILE: &str = "instances.json";
pub const LOCK_FILE: &str = "registry.lock";

/// One live editor instance, as advertised to every other process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub id: String,
    pub name: String,
    pub workspace_path: String,
    pub port: u16,
    pub pid: u32,
    /// Wall-clock milliseconds since epoch of the owner's last registry write.
    pub last_heartbeat: i64,
}

/// Persisted form: `{"instances": [...]}`. Record order is preserved across
/// writes purely to minimize diff churn; it has no semantic meaning.
#[derive(Serialize, Deserialize, Default)]
struct RegistryFile {
    #[serde(default)]
    instances: Vec<InstanceRecord>,
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Serializable read-modify-write access to the registry file.
///
/// Cheap to clone; every clone points at the same directory and follows the
/// same locking protocol.
#[derive(Clone)]
pub struct RegistryStore {
    dir: PathBuf,
    stale_threshold_ms: i64,
    lock_retry_limit: u32,
    lock_retry_delay: Duration,
    lock_stale: Duration,
}

impl RegistryStore {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            dir: config.registry_dir(),
            stale_threshold_ms: config.stale_threshold_ms as i64,
            lock_retry_limit: config.lock_retry_limit,
            lock_retry_delay: Duration::from_millis(config.lock_retry_delay_ms),
            lock_stale: Duration::from_millis(config.lock_stale_ms),
        }
    }

    /// Non-locking read of the current registry with stale records filtered.
    ///
    /// May observe slightly stale data, but never a torn record: writers
    /// replace the file atomically, so a reader sees either the old or the
    /// new complete contents. A corrupt or missing file reads as empty.
    pub fn snapshot(&self) -> Vec<InstanceRecord> {
        self.filter_stale(self.read_records(), now_ms())
    }

    /// Acquire the registry mutex, read, filter stale entries, apply `f`,
    /// atomically replace the file, release the mutex.
    ///
    /// `f` is a pure function over the record list; it runs inside the
    /// critical section, so keep it fast.
    pub fn modify<F>(&self, f: F) -> Result<Vec<InstanceRecord>>
    where
        F: FnOnce(Vec<InstanceRecord>) -> Vec<InstanceRecord>,
    {
        fs::create_dir_all(&self.dir)?;
        let _guard = self.acquire_lock()?;
        let records = self.filter_stale(self.read_records(), now_ms());
        let updated = f(records);
        self.write_atomic(&updated)?;
        Ok(updated)
    }

    fn registry_path(&self) -> PathBuf {
        self.dir.join(REGISTRY_FILE)
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }

    fn read_records(&self) -> Vec<InstanceRecord> {
        match fs::read_to_string(self.registry_path()) {
            Ok(text) => match serde_json::from_str::<RegistryFile>(&text) {
                Ok(file) => file.instances,
                Err(e) => {
                    // Self-healing: the next modify rewrites a valid file.
                    warn!(target: "registry", "corrupt registry file, treating as empty: {e}");
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!(target: "registry", "registry read failed, treating as empty: {e}");
                Vec::new()
            }
        }
    }

    /// Drop records whose heartbeat is older than the stale threshold.
    /// Pruning on read is normal operation, not an error.
    fn filter_stale(&self, records: Vec<InstanceRecord>, now: i64) -> Vec<InstanceRecord> {
        records
            .into_iter()
            .filter(|record| {
                let fresh = now - record.last_heartbeat <= self.stale_threshold_ms;
                if !fresh {
                    debug!(
                        target: "registry",
                        "pruning stale instance {} (pid {})", record.id, record.pid
                    );
                }
                fresh
            })
            .collect()
    }

    /// Write to a process-private temp file, then rename over the registry.
    /// Readers always observe either the old or the new complete file.
    fn write_atomic(&self, records: &[InstanceRecord]) -> Result<()> {
        let file = RegistryFile {
            instances: records.to_vec(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| RelayError::RegistryIo(std::io::Error::other(e)))?;

        let target = self.registry_path();
        let temp = self
            .dir
            .join(format!("{REGISTRY_FILE}.{}.tmp", std::process::id()));

        if let Err(e) = fs::write(&temp, json) {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&temp, &target) {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }
        Ok(())
    }

    /// Create the lock sentinel with exclusive-create semantics.
    ///
    /// A sentinel older than the lock stale timeout is presumed abandoned
    /// (its writer died mid-section) and is deleted before retrying. On
    /// live contention, back off a fixed delay up to the retry budget.
    fn acquire_lock(&self) -> Result<LockGuard> {
        let path = self.lock_path();
        for attempt in 0..=self.lock_retry_limit {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    // Writer pid, for diagnostics only.
                    let _ = file.write_all(std::process::id().to_string().as_bytes());
                    return Ok(LockGuard { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if sentinel_is_stale(&path, self.lock_stale) {
                        debug!(target: "registry", "removing abandoned registry lock");
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    if attempt < self.lock_retry_limit {
                        std::thread::sleep(self.lock_retry_delay);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(RelayError::LockTimeout)
    }
}

fn sentinel_is_stale(path: &Path, lock_stale: Duration) -> bool {
    let Ok(metadata) = fs::metadata(path) else {
        // Already gone; the retry loop will attempt a fresh create.
        return false;
    };
    let Ok(modified) = metadata.modified() else {
        return false;
    };
    SystemTime::now()
        .duration_since(modified)
        .map(|age| age > lock_stale)
        .unwrap_or(false)
}

/// Deletes the sentinel on drop. "Already gone" is tolerated: another
/// process may have seized an apparently-stale lock.
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> RegistryStore {
        let config = RelayConfig {
            data_dir: Some(dir.path().to_path_buf()),
            ..RelayConfig::default()
        };
        RegistryStore::new(&config)
    }

    fn record(id: &str, port: u16, last_heartbeat: i64) -> InstanceRecord {
        InstanceRecord {
            id: id.to_string(),
            name: format!("workspace-{id}"),
            workspace_path: format!("/home/dev/{id}"),
            port,
            pid: 4242,
            last_heartbeat,
        }
    }

    #[test]
    fn snapshot_of_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(store_in(&dir).snapshot().is_empty());
    }

    #[test]
    fn register_then_unregister_restores_empty_registry() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        store
            .modify(|mut records| {
                records.push(record("100-aabbccdd", 41970, now_ms()));
                records
            })
            .unwrap();
        assert_eq!(store.snapshot().len(), 1);

        store
            .modify(|mut records| {
                records.retain(|r| r.id != "100-aabbccdd");
                records
            })
            .unwrap();
        assert!(store.snapshot().is_empty());

        // The file is still valid JSON with an empty list.
        let text = fs::read_to_string(dir.path().join(REGISTRY_FILE)).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["instances"], serde_json::json!([]));
    }

    #[test]
    fn snapshot_filters_stale_records() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let now = now_ms();

        store
            .modify(move |mut records| {
                records.push(record("1-fresh000", 41970, now));
                records
            })
            .unwrap();

        // Write a long-dead record behind the store's back.
        let mut on_disk: RegistryFile = serde_json::from_str(
            &fs::read_to_string(dir.path().join(REGISTRY_FILE)).unwrap(),
        )
        .unwrap();
        on_disk.instances.push(record("2-dead0000", 41971, now - 3_600_000));
        fs::write(
            dir.path().join(REGISTRY_FILE),
            serde_json::to_string(&on_disk).unwrap(),
        )
        .unwrap();

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, "1-fresh000");
    }

    #[test]
    fn modify_purges_stale_records_from_disk() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let file = RegistryFile {
            instances: vec![
                record("1-fresh000", 41970, now_ms()),
                record("2-dead0000", 41971, now_ms() - 3_600_000),
            ],
        };
        fs::write(
            dir.path().join(REGISTRY_FILE),
            serde_json::to_string(&file).unwrap(),
        )
        .unwrap();

        // Identity modify still rewrites without the dead record.
        let written = store.modify(|records| records).unwrap();
        assert_eq!(written.len(), 1);

        let text = fs::read_to_string(dir.path().join(REGISTRY_FILE)).unwrap();
        assert!(!text.contains("2-dead0000"));
    }

    #[test]
    fn corrupt_file_reads_empty_and_self_heals() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        fs::write(dir.path().join(REGISTRY_FILE), "not valid json{{{").unwrap();

        assert!(store.snapshot().is_empty());

        store
            .modify(|mut records| {
                records.push(record("7-healed00", 41972, now_ms()));
                records
            })
            .unwrap();

        let text = fs::read_to_string(dir.path().join(REGISTRY_FILE)).unwrap();
        let parsed: RegistryFile = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.instances.len(), 1);
    }

    #[test]
    fn record_order_is_preserved_across_writes() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let now = now_ms();

        store
            .modify(move |mut records| {
                records.push(record("1-aaaaaaaa", 41970, now));
                records.push(record("2-bbbbbbbb", 41971, now));
                records.push(record("3-cccccccc", 41972, now));
                records
            })
            .unwrap();

        // Refresh the middle record in place, as a heartbeat would.
        store
            .modify(|mut records| {
                if let Some(r) = records.iter_mut().find(|r| r.id == "2-bbbbbbbb") {
                    r.last_heartbeat = now_ms();
                }
                records
            })
            .unwrap();

        let ids: Vec<String> = store.snapshot().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["1-aaaaaaaa", "2-bbbbbbbb", "3-cccccccc"]);
    }

    #[test]
    fn back_to_back_heartbeats_change_only_the_timestamp() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        store
            .modify(|mut records| {
                records.push(record("9-beatbeat", 41975, now_ms()));
                records
            })
            .unwrap();

        let refresh = |records: Vec<InstanceRecord>| {
            records
                .into_iter()
                .map(|mut r| {
                    r.last_heartbeat = now_ms();
                    r
                })
                .collect()
        };
        let first = store.modify(refresh).unwrap();
        let second = store.modify(refresh).unwrap();

        assert_eq!(first.len(), second.len());
        assert_eq!(first[0].id, second[0].id);
        assert_eq!(first[0].name, second[0].name);
        assert_eq!(first[0].workspace_path, second[0].workspace_path);
        assert_eq!(first[0].port, second[0].port);
        assert_eq!(first[0].pid, second[0].pid);
    }

    #[test]
    fn sentinel_holds_writer_pid_during_critical_section() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let lock_path = dir.path().join(LOCK_FILE);

        store
            .modify(|records| {
                let pid_text = fs::read_to_string(&lock_path).unwrap();
                assert_eq!(pid_text, std::process::id().to_string());
                records
            })
            .unwrap();

        // Released afterwards.
        assert!(!lock_path.exists());
    }

    #[test]
    fn held_lock_times_out_contenders() {
        let dir = TempDir::new().unwrap();
        let config = RelayConfig {
            data_dir: Some(dir.path().to_path_buf()),
            lock_retry_limit: 3,
            lock_retry_delay_ms: 10,
            ..RelayConfig::default()
        };
        let store = RegistryStore::new(&config);

        fs::create_dir_all(dir.path()).unwrap();
        fs::write(dir.path().join(LOCK_FILE), "9999").unwrap();

        match store.modify(|records| records) {
            Err(RelayError::LockTimeout) => {}
            other => panic!("expected LockTimeout, got {other:?}"),
        }
    }

    #[test]
    fn abandoned_sentinel_is_taken_over() {
        let dir = TempDir::new().unwrap();
        let config = RelayConfig {
            data_dir: Some(dir.path().to_path_buf()),
            lock_stale_ms: 50,
            lock_retry_delay_ms: 10,
            ..RelayConfig::default()
        };
        let store = RegistryStore::new(&config);

        fs::create_dir_all(dir.path()).unwrap();
        fs::write(dir.path().join(LOCK_FILE), "9999").unwrap();
        std::thread::sleep(Duration::from_millis(120));

        let written = store
            .modify(|mut records| {
                records.push(record("5-takeover", 41973, now_ms()));
                records
            })
            .unwrap();
        assert_eq!(written.len(), 1);
        assert!(!dir.path().join(LOCK_FILE).exists());
    }

    #[test]
    fn concurrent_writers_serialize() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .modify(move |mut records| {
                            records.push(record(&format!("{i}-deadbeef"), 41970 + i, now_ms()));
                            records
                        })
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.snapshot().len(), 8);
    }

    #[test]
    fn wire_names_are_camel_case() {
        let json = serde_json::to_value(record("1-abcdef01", 41970, 1_700_000_000_000)).unwrap();
        assert!(json.get("workspacePath").is_some());
        assert!(json.get("lastHeartbeat").is_some());
        assert!(json.get("workspace_path").is_none());
    }
}
