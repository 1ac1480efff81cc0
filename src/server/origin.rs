//! Origin policy for the loopback HTTP surface.
//!
//! Browser-extension pages send their `chrome-extension://...` (or
//! equivalent) origin; extension service workers and curl-class clients
//! send none at all, and sandboxed contexts send the literal `null`. All of
//! those are allowed: the loopback binding and the per-instance id check
//! on send are the compensating guards. Anything else is a regular web page
//! probing localhost and gets a hard 403 with no CORS echo.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;

pub(crate) struct OriginPolicy {
    allowed_prefixes: Vec<String>,
}

impl OriginPolicy {
    pub(crate) fn new(allowed_prefixes: &[String]) -> Self {
        Self {
            allowed_prefixes: allowed_prefixes.to_vec(),
        }
    }
}

pub(crate) enum OriginCheck {
    /// No `Origin` header; nothing to echo back.
    Absent,
    /// Permitted origin, echoed back verbatim (never `*`).
    Allowed(HeaderValue),
    Forbidden,
}

pub(crate) fn check_origin(
    origin: Option<&HeaderValue>,
    allowed_prefixes: &[String],
) -> OriginCheck {
    let Some(value) = origin else {
        return OriginCheck::Absent;
    };
    let Ok(text) = value.to_str() else {
        return OriginCheck::Forbidden;
    };
    if text == "null" {
        return OriginCheck::Allowed(value.clone());
    }
    if allowed_prefixes.iter().any(|p| text.starts_with(p.as_str())) {
        return OriginCheck::Allowed(value.clone());
    }
    OriginCheck::Forbidden
}

/// Runs before routing: rejects forbidden origins for every method
/// (including preflights), answers permitted preflights with 204, and
/// stamps CORS headers onto permitted responses.
pub(crate) async fn origin_layer(
    State(policy): State<Arc<OriginPolicy>>,
    req: Request,
    next: Next,
) -> Response {
    match check_origin(req.headers().get(header::ORIGIN), &policy.allowed_prefixes) {
        OriginCheck::Forbidden => (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({"error": "Forbidden: invalid origin"})),
        )
            .into_response(),
        OriginCheck::Absent => {
            if req.method() == Method::OPTIONS {
                return StatusCode::NO_CONTENT.into_response();
            }
            next.run(req).await
        }
        OriginCheck::Allowed(origin) => {
            let mut response = if req.method() == Method::OPTIONS {
                StatusCode::NO_CONTENT.into_response()
            } else {
                next.run(req).await
            };
            let headers = response.headers_mut();
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_METHODS,
                HeaderValue::from_static("GET, POST, OPTIONS"),
            );
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                HeaderValue::from_static("Content-Type"),
            );
            response
        }
    }
}
