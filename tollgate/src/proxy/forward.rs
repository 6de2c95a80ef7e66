//! Non-streaming forwarding with retry across upstreams.

use std::time::Instant;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::{Map, Value};

use super::usage::extract_from_response;
use super::{body_value, truncate_error_body, upstream_url};
use crate::admission::AuthedCaller;
use crate::context::AppState;
use crate::error::GatewayError;
use crate::models::Upstream;
use crate::pricing::compute_cost;

/// Why an attempt failed, and whether another upstream may be tried.
struct SendFailure {
    retryable: bool,
    reason: String,
}

#[allow(clippy::too_many_arguments)]
pub async fn forward_proxy(
    state: AppState,
    caller: AuthedCaller,
    upstream: Upstream,
    mut body: Map<String, Value>,
    path: String,
    model: String,
    started: Instant,
) -> Response {
    body.insert("stream".to_string(), Value::Bool(false));
    let payload = body_value(body);

    // Hard upstream errors (transport failures, 5xx) move on to another
    // upstream while no byte has reached the client yet.
    let mut current = upstream;
    let mut attempts_left = current.max_retries;
    let mut tried: Vec<i64> = Vec::new();
    let (response, raw_body) = loop {
        match send_upstream(&state, &current, &path, &payload).await {
            Ok(resp) => break resp,
            Err(failure) => {
                log::warn!("upstream {} failed: {}", current.name, failure.reason);
                tried.push(current.id);
                if !failure.retryable || attempts_left == 0 {
                    return GatewayError::Upstream(failure.reason).into_response();
                }
                attempts_left -= 1;
                match state
                    .registry
                    .select_with_fallback(caller.user.id, &tried)
                {
                    Ok(next) => current = next,
                    Err(_) => return GatewayError::Upstream(failure.reason).into_response(),
                }
            }
        }
    };

    let totals = extract_from_response(&response).unwrap_or_default();
    // An unpriceable model fails here, before any charge; the caller gets the
    // error instead of the artifact, exactly like a billing failure.
    let quote = match state.catalog.price(&model) {
        Ok(quote) => quote,
        Err(e) => return e.into_response(),
    };
    let cost = compute_cost(&quote, &totals);
    let latency_ms = started.elapsed().as_millis() as i64;

    // A call that cannot be billed must not hand over the artifact.
    if let Err(e) = state.billing.charge(
        caller.user.id,
        caller.api_key.id,
        &model,
        &totals,
        cost,
        latency_ms,
        StatusCode::OK.as_u16(),
    ) {
        return e.into_response();
    }

    // The upstream body goes back verbatim.
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        raw_body,
    )
        .into_response()
}

async fn send_upstream(
    state: &AppState,
    upstream: &Upstream,
    path: &str,
    payload: &Value,
) -> Result<(Value, axum::body::Bytes), SendFailure> {
    let mut request = state
        .http
        .post(upstream_url(upstream, path))
        .header(header::CONTENT_TYPE, "application/json")
        .header(
            header::AUTHORIZATION,
            format!("Bearer {}", upstream.api_key),
        )
        .json(payload);
    if upstream.timeout_seconds > 0 {
        request = request.timeout(std::time::Duration::from_secs(upstream.timeout_seconds));
    }
    let resp = request
        .send()
        .await
        .map_err(|e| SendFailure {
            retryable: true,
            reason: format!("request failed: {e}"),
        })?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.bytes().await.unwrap_or_default();
        return Err(SendFailure {
            retryable: status.is_server_error(),
            reason: format!(
                "upstream returned status {}: {}",
                status.as_u16(),
                truncate_error_body(&body)
            ),
        });
    }

    let bytes = resp.bytes().await.map_err(|e| SendFailure {
        retryable: true,
        reason: format!("read body: {e}"),
    })?;
    let value = serde_json::from_slice(&bytes).map_err(|e| SendFailure {
        retryable: false,
        reason: format!("invalid upstream JSON: {e}"),
    })?;
    Ok((value, bytes))
}
