//! Browser-side discovery: locate a specific, verified-live instance
//! before dispatching a payload.
//!
//! The caller starts from a nominal endpoint (any port it remembers). If
//! that instance is gone, the reserved range is scanned in parallel (a
//! serial scan of 100 ports at 500 ms each would take nearly a minute)
//! and the first responder becomes the registry source. Every record is
//! then verified against its own `/health` before it is trusted, because
//! registry entries can outlive their process by up to the stale threshold
//! and ports can be reused by a different instance.

use std::time::Duration;

use futures_util::future::join_all;
use reqwest::Client;
use tracing::debug;

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::registry::InstanceRecord;
use crate::server::{HealthResponse, SendResponse};

pub struct DiscoveryClient {
    http: Client,
    port_base: u16,
    port_range_len: u16,
    scan_timeout: Duration,
    verify_timeout: Duration,
}

impl DiscoveryClient {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            http: Client::new(),
            port_base: config.port_base,
            port_range_len: config.port_range_len,
            scan_timeout: Duration::from_millis(config.scan_timeout_ms),
            verify_timeout: Duration::from_millis(config.verify_timeout_ms),
        }
    }

    fn url(port: u16, path: &str) -> String {
        format!("http://127.0.0.1:{port}{path}")
    }

    /// Produce the set of verified-live instances, starting from a nominal
    /// port. Records that fail their probe, or whose `/health` reports a
    /// different id than the registry claims, are silently dropped.
    pub async fn discover(&self, nominal_port: u16) -> Result<Vec<InstanceRecord>> {
        let records = match self.fetch_instances(nominal_port).await {
            Ok(records) => records,
            Err(e) => {
                debug!(
                    target: "discovery",
                    "nominal endpoint :{nominal_port} unreachable ({e}), scanning range"
                );
                let Some(port) = self.scan_range().await else {
                    return Ok(Vec::new());
                };
                self.fetch_instances(port).await?
            }
        };

        let checks = records.into_iter().map(|record| async move {
            let health = self.probe_health(record.port, self.verify_timeout).await?;
            if health.instance_id == record.id {
                Some(record)
            } else {
                debug!(
                    target: "discovery",
                    "port {} now serves {} instead of {}, dropping record",
                    record.port, health.instance_id, record.id
                );
                None
            }
        });
        Ok(join_all(checks).await.into_iter().flatten().collect())
    }

    /// Dispatch `content` to a verified instance. The request goes to the
    /// record's own port, never the nominal endpoint, because each
    /// instance serves only its own id.
    pub async fn send(&self, record: &InstanceRecord, content: &str) -> Result<()> {
        let url = Self::url(record.port, &format!("/instance/{}/send", record.id));
        let response = self
            .http
            .post(url)
            .json(&serde_json::json!({ "content": content }))
            .timeout(self.verify_timeout)
            .send()
            .await
            .map_err(|e| RelayError::Http(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 403 {
            // The 403 body carries no `success` field; don't try to parse it.
            return Err(RelayError::ForbiddenOrigin);
        }
        let body: SendResponse = response
            .json()
            .await
            .map_err(|e| RelayError::Http(e.to_string()))?;
        if body.success {
            return Ok(());
        }

        let reason = body.error.unwrap_or_else(|| status.to_string());
        Err(match status.as_u16() {
            400 => RelayError::BadRequest,
            404 => RelayError::WrongInstance,
            503 => RelayError::DownstreamUnavailable(reason),
            _ => RelayError::DownstreamFailed(reason),
        })
    }

    async fn fetch_instances(&self, port: u16) -> Result<Vec<InstanceRecord>> {
        #[derive(serde::Deserialize)]
        struct Body {
            instances: Vec<InstanceRecord>,
        }

        let response = self
            .http
            .get(Self::url(port, "/instances"))
            .timeout(self.verify_timeout)
            .send()
            .await
            .map_err(|e| RelayError::Http(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RelayError::Http(format!(
                "/instances on :{port} returned {}",
                response.status()
            )));
        }
        let body: Body = response
            .json()
            .await
            .map_err(|e| RelayError::Http(e.to_string()))?;
        Ok(body.instances)
    }

    /// Probe `/health`; `None` on timeout, refusal, or a malformed answer.
    async fn probe_health(&self, port: u16, timeout: Duration) -> Option<HealthResponse> {
        let response = self
            .http
            .get(Self::url(port, "/health"))
            .timeout(timeout)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.json().await.ok()
    }

    /// Probe every port of the reserved range concurrently and return the
    /// lowest one with a healthy instance.
    async fn scan_range(&self) -> Option<u16> {
        let probes = (0..self.port_range_len).map(|offset| {
            let port = self.port_base.saturating_add(offset);
            async move { self.probe_health(port, self.scan_timeout).await.map(|_| port) }
        });
        join_all(probes).await.into_iter().flatten().next()
    }
}
