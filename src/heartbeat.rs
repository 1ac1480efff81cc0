//! Periodic liveness refresh for this instance's registry record.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::identity::InstanceIdentity;
use crate::registry::{now_ms, InstanceRecord, RegistryStore};

/// Spawn the heartbeat loop. Each tick refreshes this instance's record so
/// other processes and clients keep treating it as alive.
///
/// A failed tick (I/O, lock timeout) is logged and swallowed; the next tick
/// retries. Persistent failure is not fatal to the owning process; clients
/// will correctly treat the instance as dead once the record goes stale.
/// `stop.notify_one()` cancels the loop at its next await point.
pub(crate) fn spawn_heartbeat(
    registry: RegistryStore,
    identity: InstanceIdentity,
    interval: Duration,
    stop: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.notified() => {
                    debug!(target: "heartbeat", "heartbeat loop for {} stopped", identity.id);
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }

            let registry = registry.clone();
            let identity = identity.clone();
            let tick = tokio::task::spawn_blocking(move || {
                registry.modify(move |records| beat(records, &identity))
            })
            .await;

            match tick {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(target: "heartbeat", "heartbeat skipped: {e}"),
                Err(e) => warn!(target: "heartbeat", "heartbeat task panicked: {e}"),
            }
        }
    })
}

/// Refresh this instance's record in place, or reinsert the full record if
/// another process purged it as apparently stale (e.g. after a long stall).
fn beat(mut records: Vec<InstanceRecord>, identity: &InstanceIdentity) -> Vec<InstanceRecord> {
    let now = now_ms();
    match records.iter_mut().find(|r| r.id == identity.id) {
        Some(own) => {
            own.last_heartbeat = now;
            own.port = identity.port;
        }
        None => records.push(identity.to_record(now)),
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use tempfile::TempDir;

    fn identity() -> InstanceIdentity {
        InstanceIdentity::new("web", "/home/dev/web").with_port(41970)
    }

    #[test]
    fn beat_refreshes_own_record_in_place() {
        let me = identity();
        let other = InstanceIdentity::new("api", "/home/dev/api")
            .with_port(41971)
            .to_record(500);

        let records = vec![other.clone(), me.to_record(500)];
        let updated = beat(records, &me);

        assert_eq!(updated.len(), 2);
        assert_eq!(updated[0], other, "strangers' records are untouched");
        assert_eq!(updated[1].id, me.id);
        assert!(updated[1].last_heartbeat > 500);
    }

    #[test]
    fn beat_reinserts_after_foreign_purge() {
        let me = identity();
        let updated = beat(Vec::new(), &me);
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].id, me.id);
        assert_eq!(updated[0].port, 41970);
    }

    #[tokio::test]
    async fn loop_writes_and_stops_on_notify() {
        let dir = TempDir::new().unwrap();
        let config = RelayConfig {
            data_dir: Some(dir.path().to_path_buf()),
            ..RelayConfig::default()
        };
        let registry = RegistryStore::new(&config);
        let me = identity();
        let stop = Arc::new(Notify::new());

        let handle = spawn_heartbeat(
            registry.clone(),
            me.clone(),
            Duration::from_millis(20),
            stop.clone(),
        );

        tokio::time::sleep(Duration::from_millis(120)).await;
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, me.id);

        stop.notify_one();
        handle.await.unwrap();
    }
}
