use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Tunables for one embedded fabric instance.
///
/// Every field has a serde default so hosts can persist a partial config
/// and pick up new knobs without migration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayConfig {
    /// First port of the reserved loopback range.
    #[serde(default = "default_port_base")]
    pub port_base: u16,
    /// Number of consecutive ports the fabric may try, starting at `port_base`.
    #[serde(default = "default_port_range_len")]
    pub port_range_len: u16,
    /// How often this instance refreshes its registry record.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Age past which a registry record is dead and gets purged.
    /// Must stay at least twice `heartbeat_interval_ms` so one missed beat
    /// does not evict a live instance.
    #[serde(default = "default_stale_threshold_ms")]
    pub stale_threshold_ms: u64,
    /// Registry lock acquisition attempts before giving up.
    #[serde(default = "default_lock_retry_limit")]
    pub lock_retry_limit: u32,
    /// Delay between registry lock attempts.
    #[serde(default = "default_lock_retry_delay_ms")]
    pub lock_retry_delay_ms: u64,
    /// Age past which a lock sentinel may be forcibly removed. Strictly
    /// longer than any legitimate critical section.
    #[serde(default = "default_lock_stale_ms")]
    pub lock_stale_ms: u64,
    /// Request body cap for `/instance/{id}/send`.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Per-port timeout when scanning the reserved range.
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,
    /// Timeout for targeted `/health` verification and dispatch requests.
    #[serde(default = "default_verify_timeout_ms")]
    pub verify_timeout_ms: u64,
    /// Origin prefixes allowed to call the HTTP surface, matched against
    /// the scheme-and-authority start of the `Origin` header.
    #[serde(default = "default_allowed_origin_prefixes")]
    pub allowed_origin_prefixes: Vec<String>,
    /// Override for the registry directory. `None` resolves to
    /// `$PROMPT_RELAY_DATA_DIR`, falling back to `~/.prompt-relay`.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

fn default_port_base() -> u16 {
    41970
}

fn default_port_range_len() -> u16 {
    100
}

fn default_heartbeat_interval_ms() -> u64 {
    10_000
}

fn default_stale_threshold_ms() -> u64 {
    30_000
}

fn default_lock_retry_limit() -> u32 {
    50
}

fn default_lock_retry_delay_ms() -> u64 {
    100
}

fn default_lock_stale_ms() -> u64 {
    10_000
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

fn default_scan_timeout_ms() -> u64 {
    500
}

fn default_verify_timeout_ms() -> u64 {
    2_000
}

fn default_allowed_origin_prefixes() -> Vec<String> {
    vec![
        "chrome-extension://".to_string(),
        "moz-extension://".to_string(),
        "safari-web-extension://".to_string(),
    ]
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port_base: default_port_base(),
            port_range_len: default_port_range_len(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            stale_threshold_ms: default_stale_threshold_ms(),
            lock_retry_limit: default_lock_retry_limit(),
            lock_retry_delay_ms: default_lock_retry_delay_ms(),
            lock_stale_ms: default_lock_stale_ms(),
            max_body_bytes: default_max_body_bytes(),
            scan_timeout_ms: default_scan_timeout_ms(),
            verify_timeout_ms: default_verify_timeout_ms(),
            allowed_origin_prefixes: default_allowed_origin_prefixes(),
            data_dir: None,
        }
    }
}

impl RelayConfig {
    /// Resolve the directory holding the registry file and lock sentinel.
    pub fn registry_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        if let Ok(dir) = std::env::var("PROMPT_RELAY_DATA_DIR") {
            return PathBuf::from(dir);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".prompt-relay")
    }

    /// Exclusive upper bound of the reserved port range.
    pub fn port_range_end(&self) -> u16 {
        self.port_base.saturating_add(self.port_range_len)
    }
}
