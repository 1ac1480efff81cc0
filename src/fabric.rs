//! Lifecycle coordinator: start/register/serve, pause/resume, and graceful
//! unregister on shutdown.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::heartbeat;
use crate::identity::InstanceIdentity;
use crate::registry::{now_ms, RegistryStore};
use crate::server::{self, ServerPhase, ServerState};

/// Host-provided async callback that realizes a `send`: the fabric hands it
/// the payload string and awaits the outcome. Return
/// `DownstreamUnavailable` when the delivery target is not attached (the
/// request maps to 503) and `DownstreamFailed` when delivery blew up (500).
pub type DispatchHook =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

/// Wrap a plain async closure into a [`DispatchHook`].
pub fn dispatch_hook<F, Fut>(f: F) -> DispatchHook
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |content| Box::pin(f(content)))
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct RelayStatus {
    pub listening: bool,
    pub port: u16,
    pub pid: u32,
    pub instance_id: String,
    /// Whole seconds since the listener started; 0 when stopped.
    pub uptime: u64,
}

/// One embedded fabric instance.
///
/// The host constructs it once, calls [`Relay::start`], and keeps it for
/// the life of the window/process. Pausing suspends only the downstream
/// dispatch; the instance stays discoverable so clients can still learn
/// about it; `send` answers 503 until [`Relay::resume`].
pub struct Relay {
    name: String,
    workspace_path: String,
    config: RelayConfig,
    registry: RegistryStore,
    dispatch: DispatchHook,
    paused: Arc<AtomicBool>,
    running: Option<Running>,
}

struct Running {
    identity: InstanceIdentity,
    started_at: Instant,
    phase: Arc<Mutex<ServerPhase>>,
    heartbeat_stop: Arc<Notify>,
    heartbeat_handle: JoinHandle<()>,
    server_shutdown: oneshot::Sender<()>,
    server_handle: JoinHandle<()>,
}

impl Relay {
    pub fn new(
        name: impl Into<String>,
        workspace_path: impl Into<String>,
        config: RelayConfig,
        dispatch: DispatchHook,
    ) -> Self {
        let registry = RegistryStore::new(&config);
        Self {
            name: name.into(),
            workspace_path: workspace_path.into(),
            config,
            registry,
            dispatch,
            paused: Arc::new(AtomicBool::new(false)),
            running: None,
        }
    }

    /// Bind a port, start serving, insert this instance's registry record,
    /// and start the heartbeat. Returns the actually bound port.
    ///
    /// Startup errors propagate so the host can decide to exit; calling
    /// `start` on an already-running relay just returns the bound port.
    pub async fn start(&mut self, preferred_port: u16) -> Result<u16> {
        if let Some(running) = &self.running {
            return Ok(running.identity.port);
        }

        let listener = server::bind_listener(preferred_port, &self.config).await?;
        let port = listener.local_addr().map_err(RelayError::Bind)?.port();
        let identity = InstanceIdentity::new(&self.name, &self.workspace_path).with_port(port);
        let started_at = Instant::now();

        let phase = Arc::new(Mutex::new(ServerPhase::Starting));
        let state = Arc::new(ServerState {
            identity: identity.clone(),
            registry: self.registry.clone(),
            dispatch: self.dispatch.clone(),
            paused: self.paused.clone(),
            started_at,
        });
        let router = server::build_router(state, &self.config);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let server_handle = server::spawn_server(listener, router, shutdown_rx, phase.clone());

        if let Err(e) = self.register(identity.clone()).await {
            // No record was inserted; take the listener back down.
            let _ = shutdown_tx.send(());
            let _ = server_handle.await;
            return Err(e);
        }

        let heartbeat_stop = Arc::new(Notify::new());
        let heartbeat_handle = heartbeat::spawn_heartbeat(
            self.registry.clone(),
            identity.clone(),
            Duration::from_millis(self.config.heartbeat_interval_ms),
            heartbeat_stop.clone(),
        );

        info!(
            target: "server",
            "instance {} ({}) listening on 127.0.0.1:{port}", identity.id, identity.name
        );
        self.running = Some(Running {
            identity,
            started_at,
            phase,
            heartbeat_stop,
            heartbeat_handle,
            server_shutdown: shutdown_tx,
            server_handle,
        });
        Ok(port)
    }

    /// Orderly shutdown: cancel the heartbeat, remove this instance's
    /// record, then drain and stop the listener. Unregister failures are
    /// logged, not propagated; the stale threshold is the safety net.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        running.heartbeat_stop.notify_one();
        let _ = running.heartbeat_handle.await;

        let registry = self.registry.clone();
        let id = running.identity.id.clone();
        let unregister = tokio::task::spawn_blocking(move || {
            registry.modify(move |mut records| {
                records.retain(|r| r.id != id);
                records
            })
        })
        .await;
        match unregister {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                warn!(target: "server", "unregister failed, stale pruning will reclaim the record: {e}")
            }
            Err(e) => warn!(target: "server", "unregister task panicked: {e}"),
        }

        let _ = running.server_shutdown.send(());
        let _ = running.server_handle.await;
        info!(target: "server", "instance {} stopped", running.identity.id);
    }

    pub fn status(&self) -> RelayStatus {
        match &self.running {
            Some(running) => RelayStatus {
                listening: *running.phase.lock() == ServerPhase::Listening,
                port: running.identity.port,
                pid: running.identity.pid,
                instance_id: running.identity.id.clone(),
                uptime: running.started_at.elapsed().as_secs(),
            },
            None => RelayStatus {
                listening: false,
                port: 0,
                pid: std::process::id(),
                instance_id: String::new(),
                uptime: 0,
            },
        }
    }

    /// Suspend the downstream dispatch. The fabric itself keeps serving
    /// `/health` and `/instances`; `send` answers 503.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    async fn register(&self, identity: InstanceIdentity) -> Result<()> {
        let registry = self.registry.clone();
        tokio::task::spawn_blocking(move || {
            registry.modify(move |mut records| {
                // A purged-and-recreated instance must not leave two records.
                records.retain(|r| r.id != identity.id);
                records.push(identity.to_record(now_ms()));
                records
            })
        })
        .await
        .map_err(|e| RelayError::RegistryIo(std::io::Error::other(e)))??;
        Ok(())
    }
}
