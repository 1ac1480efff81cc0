use thiserror::Error;

/// Everything the fabric can produce or surface.
///
/// Startup errors (`PortExhausted`, unrecoverable registry failures)
/// propagate to the host so it can decide to exit. Per-request errors are
/// mapped to HTTP statuses in the handlers and never terminate the
/// listener. Heartbeat failures are logged and swallowed.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("could not acquire the registry lock within the retry budget")]
    LockTimeout,

    #[error("registry I/O failed: {0}")]
    RegistryIo(#[from] std::io::Error),

    #[error("no free loopback port in {base}..{end}")]
    PortExhausted { base: u16, end: u16 },

    #[error("failed to bind loopback listener: {0}")]
    Bind(std::io::Error),

    #[error("missing or invalid content")]
    BadRequest,

    #[error("instance not found on this server")]
    WrongInstance,

    #[error("dispatch target unavailable: {0}")]
    DownstreamUnavailable(String),

    #[error("dispatch failed: {0}")]
    DownstreamFailed(String),

    #[error("forbidden: invalid origin")]
    ForbiddenOrigin,

    #[error("http request failed: {0}")]
    Http(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;
