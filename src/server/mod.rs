//! Per-instance HTTP surface: three routes over one loopback port.
//!
//! The listener binds the loopback interface only. Binding anything else
//! (including `0.0.0.0`) would expose the fabric to the network and is a
//! security regression, not a configuration choice.

mod origin;
mod routes;
mod types;

pub use types::{HealthResponse, SendResponse};

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::fabric::DispatchHook;
use crate::identity::InstanceIdentity;
use crate::registry::RegistryStore;

/// `Starting → Listening → Draining → Stopped`. Draining refuses new
/// connections while in-flight requests complete.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerPhase {
    Starting,
    Listening,
    Draining,
    Stopped,
}

/// Everything the handlers need, shared behind an `Arc`.
pub(crate) struct ServerState {
    pub identity: InstanceIdentity,
    pub registry: RegistryStore,
    pub dispatch: DispatchHook,
    pub paused: Arc<AtomicBool>,
    pub started_at: Instant,
}

/// Bind a loopback listener on the first free port of the reserved range,
/// starting at `preferred`. Exhausting the range is fatal at startup.
pub(crate) async fn bind_listener(preferred: u16, config: &RelayConfig) -> Result<TcpListener> {
    let base = config.port_base;
    let end = config.port_range_end();
    let start = if (base..end).contains(&preferred) {
        preferred
    } else {
        base
    };

    for port in start..end {
        match TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, port)).await {
            Ok(listener) => {
                info!(target: "server", "bound 127.0.0.1:{port}");
                return Ok(listener);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => continue,
            Err(e) => return Err(RelayError::Bind(e)),
        }
    }
    Err(RelayError::PortExhausted { base, end })
}

/// Build the router (exposed to tests the same way it runs in production).
pub(crate) fn build_router(state: Arc<ServerState>, config: &RelayConfig) -> Router {
    let policy = Arc::new(origin::OriginPolicy::new(&config.allowed_origin_prefixes));
    Router::new()
        .route("/health", get(routes::health))
        .route("/instances", get(routes::instances))
        .route("/instance/{id}/send", post(routes::send))
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(middleware::from_fn_with_state(policy, origin::origin_layer))
        .with_state(state)
}

/// Serve until the shutdown channel fires, then drain in-flight requests.
pub(crate) fn spawn_server(
    listener: TcpListener,
    router: Router,
    shutdown_rx: oneshot::Receiver<()>,
    phase: Arc<Mutex<ServerPhase>>,
) -> JoinHandle<()> {
    // The listener is bound before this point; connections queue already.
    *phase.lock() = ServerPhase::Listening;
    tokio::spawn(async move {
        let drain_phase = phase.clone();
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
                *drain_phase.lock() = ServerPhase::Draining;
            })
            .await;
        if let Err(e) = result {
            warn!(target: "server", "listener error: {e}");
        }
        *phase.lock() = ServerPhase::Stopped;
    })
}
