//! The data-plane proxy: decode, transform, select, forward, meter, charge.

pub mod forward;
pub mod stream;
pub mod usage;

use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{OriginalUri, State};
use axum::response::{IntoResponse, Response};
use serde_json::{Map, Value};

use crate::admission::AuthedCaller;
use crate::codex;
use crate::context::AppState;
use crate::error::GatewayError;
use crate::models::Upstream;
use crate::upstream::fallback_from_settings;

pub async fn proxy_handler(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    caller: AuthedCaller,
    body: Bytes,
) -> Response {
    let started = Instant::now();

    let Ok(Value::Object(mut body)) = serde_json::from_slice::<Value>(&body) else {
        return GatewayError::InvalidBody.into_response();
    };

    let path = uri.path().to_string();
    if is_codex_chat_route(&path) {
        codex::transform_request(&mut body);
    }

    let model = body
        .get("model")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .unwrap_or(codex::DEFAULT_MODEL)
        .to_string();
    let streaming = body
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let upstream = match select_upstream(&state, &caller) {
        Ok(upstream) => upstream,
        Err(e) => return e.into_response(),
    };

    // Pricing resolves after the upstream call, once usage is known.
    if streaming {
        stream::stream_proxy(state, caller, upstream, body, path, model, started).await
    } else {
        forward::forward_proxy(state, caller, upstream, body, path, model, started).await
    }
}

fn select_upstream(state: &AppState, caller: &AuthedCaller) -> Result<Upstream, GatewayError> {
    match state.registry.select_for_user(caller.user.id) {
        Ok(upstream) => Ok(upstream),
        Err(GatewayError::NoUpstreamAvailable) => state
            .store
            .get_settings()
            .ok()
            .as_ref()
            .and_then(fallback_from_settings)
            .ok_or(GatewayError::NoUpstreamAvailable),
        Err(e) => Err(e),
    }
}

/// The Codex rewrite applies to chat completions only; `/responses` and
/// plain `/completions` pass through.
fn is_codex_chat_route(path: &str) -> bool {
    path.ends_with("/chat/completions")
}

pub(crate) fn upstream_url(upstream: &Upstream, path: &str) -> String {
    format!("{}{}", upstream.base_url, path)
}

/// First 2 KiB of an upstream error body, for the 502 surface.
pub(crate) fn truncate_error_body(body: &[u8]) -> String {
    const LIMIT: usize = 2048;
    let slice = &body[..body.len().min(LIMIT)];
    String::from_utf8_lossy(slice).into_owned()
}

pub(crate) fn body_value(body: Map<String, Value>) -> Value {
    Value::Object(body)
}
