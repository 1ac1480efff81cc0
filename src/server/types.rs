use serde::{Deserialize, Serialize};

// --- Wire types shared by the server and the discovery client ---

/// Body of `GET /health`: liveness plus enough identity for a caller to
/// verify it is talking to the instance it thinks it is.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: String,
    /// Whether the downstream dispatch target currently accepts payloads
    /// (false while the host has paused it).
    pub capability_available: bool,
    pub workspace_name: String,
    pub workspace_path: String,
    pub instance_id: String,
    pub port: u16,
    pub pid: u32,
    /// Whole seconds since the listener started.
    pub uptime: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct InstancesResponse {
    pub instances: Vec<crate::registry::InstanceRecord>,
}

/// Body of every `POST /instance/{id}/send` response.
#[derive(Debug, Serialize, Deserialize)]
pub struct SendResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SendResponse {
    pub(crate) fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub(crate) fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
        }
    }
}
