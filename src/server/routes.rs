use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use tracing::warn;

use super::types::{HealthResponse, InstancesResponse, SendResponse};
use super::ServerState;
use crate::error::RelayError;

pub(super) async fn health(State(state): State<Arc<ServerState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
        capability_available: !state.paused.load(Ordering::Relaxed),
        workspace_name: state.identity.name.clone(),
        workspace_path: state.identity.workspace_path.clone(),
        instance_id: state.identity.id.clone(),
        port: state.identity.port,
        pid: state.identity.pid,
        uptime: state.started_at.elapsed().as_secs(),
    })
}

/// This instance's view of the shared registry, stale records already
/// pruned. Records are returned raw; liveness verification is the
/// caller's job.
pub(super) async fn instances(State(state): State<Arc<ServerState>>) -> Json<InstancesResponse> {
    Json(InstancesResponse {
        instances: state.registry.snapshot(),
    })
}

/// Deliver a payload to this instance. The id in the path must match;
/// every instance serves only its own id and never forwards.
pub(super) async fn send(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> (StatusCode, Json<SendResponse>) {
    if id != state.identity.id {
        return (
            StatusCode::NOT_FOUND,
            Json(SendResponse::failure("Instance not found on this server")),
        );
    }

    let Some(content) = parse_content(&body) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(SendResponse::failure("Missing or invalid content")),
        );
    };

    if state.paused.load(Ordering::Relaxed) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(SendResponse::failure("Dispatch target is paused")),
        );
    }

    match (state.dispatch)(content).await {
        Ok(()) => (StatusCode::OK, Json(SendResponse::ok())),
        Err(RelayError::DownstreamUnavailable(reason)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(SendResponse::failure(reason)),
        ),
        Err(e) => {
            warn!(target: "server", "dispatch failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(SendResponse::failure(e.to_string())),
            )
        }
    }
}

/// Accept only a JSON object carrying a non-empty string `content`.
fn parse_content(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    match value.get("content") {
        Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_content_accepts_plain_payload() {
        assert_eq!(
            parse_content(br#"{"content":"hello"}"#),
            Some("hello".to_string())
        );
    }

    #[test]
    fn parse_content_rejects_invalid_json() {
        assert_eq!(parse_content(b"not json"), None);
    }

    #[test]
    fn parse_content_rejects_missing_field() {
        assert_eq!(parse_content(br#"{"payload":"hello"}"#), None);
    }

    #[test]
    fn parse_content_rejects_wrong_type() {
        assert_eq!(parse_content(br#"{"content":42}"#), None);
    }

    #[test]
    fn parse_content_rejects_empty_string() {
        assert_eq!(parse_content(br#"{"content":""}"#), None);
    }
}
