//! Streaming (SSE) forwarding with in-stream usage extraction.
//!
//! Upstream bytes are relayed to the client line by line, verbatim. Each
//! `data:` payload is also inspected for usage so the call can be billed when
//! the stream ends, whether it ends cleanly, errors out, or the client walks
//! away mid-stream. Once SSE headers are written the only error channel left
//! is closing the stream; billing failures at that point are logged, not
//! surfaced.

use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::usage::{estimate, observe_stream_event, StreamObservation, UsageTotals};
use super::{body_value, truncate_error_body, upstream_url};
use crate::admission::AuthedCaller;
use crate::context::AppState;
use crate::error::GatewayError;
use crate::models::Upstream;
use crate::pricing::compute_cost;

/// Upper bound for a single buffered SSE line.
const MAX_LINE_BYTES: usize = 1024 * 1024;
const CHANNEL_CAPACITY: usize = 64;

#[allow(clippy::too_many_arguments)]
pub async fn stream_proxy(
    state: AppState,
    caller: AuthedCaller,
    upstream: Upstream,
    mut body: Map<String, Value>,
    path: String,
    model: String,
    started: Instant,
) -> Response {
    body.insert("stream".to_string(), Value::Bool(true));
    if path.ends_with("/chat/completions") {
        // Ask ChatGPT-shape upstreams to append a usage chunk.
        let options = body
            .entry("stream_options".to_string())
            .or_insert_with(|| json!({}));
        if let Some(options) = options.as_object_mut() {
            options.insert("include_usage".to_string(), Value::Bool(true));
        }
    }

    let mut request = state
        .http
        .post(upstream_url(&upstream, &path))
        .header(header::CONTENT_TYPE, "application/json")
        .header(
            header::AUTHORIZATION,
            format!("Bearer {}", upstream.api_key),
        )
        .json(&body_value(body));
    if upstream.timeout_seconds > 0 {
        request = request.timeout(std::time::Duration::from_secs(upstream.timeout_seconds));
    }
    let resp = request.send().await;
    let resp = match resp {
        Ok(resp) => resp,
        Err(e) => {
            return GatewayError::Upstream(format!("request failed: {e}")).into_response();
        }
    };

    // No SSE headers have been written yet, so a JSON error is still fine.
    if resp.status() != StatusCode::OK {
        let status = resp.status().as_u16();
        let bytes = resp.bytes().await.unwrap_or_default();
        return GatewayError::Upstream(format!(
            "upstream returned status {status}: {}",
            truncate_error_body(&bytes)
        ))
        .into_response();
    }

    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(CHANNEL_CAPACITY);
    tokio::spawn(relay(resp, tx, state, caller, model, started));

    let stream_body = Body::from_stream(ReceiverStream::new(rx));
    match Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(stream_body)
    {
        Ok(response) => response,
        Err(e) => GatewayError::Storage(format!("build streaming response: {e}")).into_response(),
    }
}

struct StreamTally {
    last_usage: Option<UsageTotals>,
    output_bytes: u64,
    chunks: u64,
}

async fn relay(
    resp: reqwest::Response,
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
    state: AppState,
    caller: AuthedCaller,
    model: String,
    started: Instant,
) {
    let mut upstream_stream = resp.bytes_stream();
    let mut buf: Vec<u8> = Vec::new();
    let mut tally = StreamTally {
        last_usage: None,
        output_bytes: 0,
        chunks: 0,
    };

    'read: while let Some(item) = upstream_stream.next().await {
        let bytes = match item {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("stream read error: {e}");
                break;
            }
        };
        buf.extend_from_slice(&bytes);

        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            observe_line(&line, &mut tally);
            if tx.send(Ok(Bytes::from(line))).await.is_err() {
                // Client went away; dropping the upstream body cancels the
                // request. Billing still runs on what was observed.
                break 'read;
            }
        }

        // A pathological line without newlines gets flushed raw rather than
        // buffered without bound.
        if buf.len() > MAX_LINE_BYTES {
            let oversized: Vec<u8> = std::mem::take(&mut buf);
            if tx.send(Ok(Bytes::from(oversized))).await.is_err() {
                break 'read;
            }
        }
    }

    if !buf.is_empty() {
        observe_line(&buf, &mut tally);
        let _ = tx.send(Ok(Bytes::from(buf))).await;
    }
    drop(upstream_stream);

    bill_stream(&state, &caller, &model, &tally, started);
}

fn observe_line(line: &[u8], tally: &mut StreamTally) {
    let Ok(text) = std::str::from_utf8(line) else {
        return;
    };
    let Some(payload) = text.trim().strip_prefix("data:") else {
        return;
    };
    let payload = payload.trim();
    if payload.is_empty() || payload == "[DONE]" {
        return;
    }
    tally.chunks += 1;
    let Ok(value) = serde_json::from_str::<Value>(payload) else {
        return;
    };
    match observe_stream_event(&value) {
        StreamObservation::Usage(totals) => tally.last_usage = Some(totals),
        StreamObservation::OutputDelta(len) => tally.output_bytes += len as u64,
        StreamObservation::Nothing => {}
    }
}

/// Charge for what the stream delivered: authoritative usage when an event
/// carried it, a byte-based estimate when only content flowed, nothing when
/// nothing flowed.
fn bill_stream(
    state: &AppState,
    caller: &AuthedCaller,
    model: &str,
    tally: &StreamTally,
    started: Instant,
) {
    let totals = match tally.last_usage {
        Some(totals) if totals.total() > 0 => totals,
        _ if tally.output_bytes > 0 || tally.chunks > 0 => {
            estimate(tally.output_bytes, tally.chunks)
        }
        _ => return,
    };

    // SSE headers are long gone, so an unpriced model can only be logged.
    let quote = match state.catalog.price(model) {
        Ok(quote) => quote,
        Err(e) => {
            log::warn!("stream for user {} not billed: {e}", caller.user.id);
            return;
        }
    };
    let cost = compute_cost(&quote, &totals);
    let latency_ms = started.elapsed().as_millis() as i64;
    if let Err(e) = state.billing.charge(
        caller.user.id,
        caller.api_key.id,
        model,
        &totals,
        cost,
        latency_ms,
        StatusCode::OK.as_u16(),
    ) {
        // The client already has the bytes; nothing to surface.
        log::warn!(
            "post-stream billing failed for user {}: {e}",
            caller.user.id
        );
    }
}
