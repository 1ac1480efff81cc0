//! Loopback dispatch fabric for multi-instance editor hosts.
//!
//! Many editor windows run on one developer machine at once. Each embeds a
//! [`Relay`]: it binds a loopback port from a reserved range, advertises
//! itself in a shared on-disk registry, and serves three HTTP routes
//! (`/health`, `/instances`, `/instance/{id}/send`) under a strict
//! browser-extension origin policy. Browser-side callers use
//! [`DiscoveryClient`] to locate a specific, verified-live instance and
//! dispatch a payload to it: to that exact window, not whichever one
//! happens to answer first.
//!
//! Liveness is heartbeat-based: every instance periodically refreshes its
//! registry record, and every reader prunes records whose heartbeat aged
//! past the stale threshold, so SIGKILLed instances disappear on their own.
//! The fabric never leaves loopback, carries no authentication, and keeps
//! no message queue; delivery is live-or-nothing.
//!
//! ```no_run
//! use prompt_relay::{dispatch_hook, Relay, RelayConfig};
//!
//! # async fn run() -> prompt_relay::Result<()> {
//! let hook = dispatch_hook(|content| async move {
//!     println!("payload for this window: {content}");
//!     Ok(())
//! });
//! let config = RelayConfig::default();
//! let mut relay = Relay::new("my-project", "/home/dev/my-project", config.clone(), hook);
//! let port = relay.start(config.port_base).await?;
//! println!("listening on 127.0.0.1:{port}");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod fabric;
mod heartbeat;
pub mod identity;
pub mod registry;
mod server;

pub use config::RelayConfig;
pub use discovery::DiscoveryClient;
pub use error::{RelayError, Result};
pub use fabric::{dispatch_hook, DispatchHook, Relay, RelayStatus};
pub use identity::InstanceIdentity;
pub use registry::{InstanceRecord, RegistryStore};
pub use server::{HealthResponse, SendResponse};
