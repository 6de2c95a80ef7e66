//! Token-usage normalization across upstream schemas.
//!
//! Two shapes exist in the wild: ChatGPT-style
//! (`prompt_tokens`/`completion_tokens` with `prompt_tokens_details`) and
//! Codex Responses-style (`input_tokens`/`output_tokens` with
//! `input_tokens_details`, sometimes spelled `input_token_details`).

use serde_json::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageTotals {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cached_tokens: i64,
    pub cache_creation_tokens: i64,
    /// Total as reported by the upstream; 0 when the schema carried none.
    pub total_tokens: i64,
}

impl UsageTotals {
    /// Input tokens charged at the full input rate.
    pub fn billable_input(&self) -> i64 {
        (self.input_tokens - self.cached_tokens - self.cache_creation_tokens).max(0)
    }

    /// Total for quota accounting. Uses the upstream total when present;
    /// otherwise input + output, corrected for schemas that report cache
    /// counts outside the input figure.
    pub fn total(&self) -> i64 {
        if self.total_tokens > 0 {
            return self.total_tokens;
        }
        let cache = self.cached_tokens + self.cache_creation_tokens;
        if cache > self.input_tokens {
            cache + self.output_tokens
        } else {
            self.input_tokens + self.output_tokens
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

fn int(value: &Value, key: &str) -> i64 {
    value.get(key).and_then(Value::as_i64).unwrap_or(0)
}

fn first_int(value: &Value, keys: &[&str]) -> i64 {
    keys.iter()
        .filter_map(|k| value.get(*k).and_then(Value::as_i64))
        .next()
        .unwrap_or(0)
}

/// Normalize a `usage` object of either schema.
pub fn usage_from_object(usage: &Value) -> Option<UsageTotals> {
    if !usage.is_object() {
        return None;
    }

    let mut totals = UsageTotals::default();
    if usage.get("prompt_tokens").is_some() || usage.get("completion_tokens").is_some() {
        totals.input_tokens = int(usage, "prompt_tokens");
        totals.output_tokens = int(usage, "completion_tokens");
    } else {
        totals.input_tokens = int(usage, "input_tokens");
        totals.output_tokens = int(usage, "output_tokens");
    }
    totals.total_tokens = int(usage, "total_tokens");

    let details = usage
        .get("prompt_tokens_details")
        .or_else(|| usage.get("input_tokens_details"))
        .or_else(|| usage.get("input_token_details"));
    if let Some(details) = details {
        totals.cached_tokens = first_int(details, &["cached_tokens", "cache_read_tokens"]);
        totals.cache_creation_tokens =
            first_int(details, &["cache_creation_tokens", "cache_creation_input_tokens"]);
    }

    if totals == UsageTotals::default() {
        None
    } else {
        Some(totals)
    }
}

/// Extract usage from a complete (non-streaming) upstream response body.
pub fn extract_from_response(body: &Value) -> Option<UsageTotals> {
    body.get("usage").and_then(usage_from_object)
}

/// Inspect one SSE `data:` payload. Returns new authoritative totals when the
/// event carries them, and the output-delta byte length otherwise.
pub enum StreamObservation {
    Usage(UsageTotals),
    OutputDelta(usize),
    Nothing,
}

pub fn observe_stream_event(payload: &Value) -> StreamObservation {
    match payload.get("type").and_then(Value::as_str) {
        // The Codex completion event is authoritative.
        Some("response.completed") => {
            let usage = payload
                .get("response")
                .and_then(|r| r.get("usage"))
                .and_then(usage_from_object);
            match usage {
                Some(totals) => StreamObservation::Usage(totals),
                None => StreamObservation::Nothing,
            }
        }
        Some("response.output_text.delta") | Some("response.content_part.delta") => {
            let len = payload
                .get("delta")
                .and_then(Value::as_str)
                .map_or(0, str::len);
            StreamObservation::OutputDelta(len)
        }
        _ => {
            // ChatGPT-shape chunk with a populated usage block.
            if let Some(totals) = payload.get("usage").and_then(usage_from_object) {
                if totals.total_tokens > 0 {
                    return StreamObservation::Usage(totals);
                }
            }
            // Some upstreams put the counts directly on the chunk.
            if payload.get("input_tokens").is_some() || payload.get("output_tokens").is_some() {
                if let Some(totals) = usage_from_object(payload) {
                    return StreamObservation::Usage(totals);
                }
            }
            StreamObservation::Nothing
        }
    }
}

/// Best-effort estimate when a stream ended without authoritative usage:
/// roughly four output bytes per token, ten tokens per chunk as a floor, and
/// a tenth of the output as presumed input.
pub fn estimate(output_bytes: u64, chunks: u64) -> UsageTotals {
    let mut output = (output_bytes + 3) / 4;
    if output == 0 && chunks > 0 {
        output = chunks * 10;
    }
    let input = output / 10;
    UsageTotals {
        input_tokens: input as i64,
        output_tokens: output as i64,
        cached_tokens: 0,
        cache_creation_tokens: 0,
        total_tokens: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chatgpt_shape_with_details() {
        let usage = json!({
            "prompt_tokens": 100,
            "completion_tokens": 20,
            "total_tokens": 120,
            "prompt_tokens_details": {"cached_tokens": 60}
        });
        let totals = usage_from_object(&usage).unwrap();
        assert_eq!(totals.input_tokens, 100);
        assert_eq!(totals.output_tokens, 20);
        assert_eq!(totals.cached_tokens, 60);
        assert_eq!(totals.total(), 120);
        assert_eq!(totals.billable_input(), 40);
    }

    #[test]
    fn codex_shape_with_alt_detail_key() {
        let usage = json!({
            "input_tokens": 1234,
            "output_tokens": 77,
            "input_token_details": {"cache_read_tokens": 1000}
        });
        let totals = usage_from_object(&usage).unwrap();
        assert_eq!(totals.input_tokens, 1234);
        assert_eq!(totals.cached_tokens, 1000);
        assert_eq!(totals.billable_input(), 234);
        assert_eq!(totals.total(), 1311);
    }

    #[test]
    fn total_corrected_when_cache_exceeds_input() {
        let totals = UsageTotals {
            input_tokens: 50,
            output_tokens: 10,
            cached_tokens: 40,
            cache_creation_tokens: 20,
            total_tokens: 0,
        };
        assert_eq!(totals.total(), 70);
        assert_eq!(totals.billable_input(), 0);
    }

    #[test]
    fn response_completed_is_authoritative() {
        let payload = json!({
            "type": "response.completed",
            "response": {"usage": {
                "input_tokens": 50,
                "output_tokens": 80,
                "input_tokens_details": {"cache_read_tokens": 40}
            }}
        });
        match observe_stream_event(&payload) {
            StreamObservation::Usage(totals) => {
                assert_eq!(totals.input_tokens, 50);
                assert_eq!(totals.output_tokens, 80);
                assert_eq!(totals.cached_tokens, 40);
                assert_eq!(totals.billable_input(), 10);
            }
            _ => panic!("expected usage"),
        }
    }

    #[test]
    fn output_deltas_report_byte_length() {
        let payload = json!({"type": "response.output_text.delta", "delta": "hello"});
        match observe_stream_event(&payload) {
            StreamObservation::OutputDelta(5) => {}
            _ => panic!("expected 5-byte delta"),
        }
    }

    #[test]
    fn chat_chunk_without_usage_is_nothing() {
        let payload = json!({"choices": [{"delta": {"content": "hi"}}]});
        assert!(matches!(
            observe_stream_event(&payload),
            StreamObservation::Nothing
        ));
        let payload = json!({"choices": [], "usage": {"total_tokens": 0}});
        assert!(matches!(
            observe_stream_event(&payload),
            StreamObservation::Nothing
        ));
    }

    #[test]
    fn chat_chunk_with_final_usage() {
        let payload = json!({
            "choices": [],
            "usage": {"prompt_tokens": 9, "completion_tokens": 3, "total_tokens": 12}
        });
        match observe_stream_event(&payload) {
            StreamObservation::Usage(totals) => assert_eq!(totals.total(), 12),
            _ => panic!("expected usage"),
        }
    }

    #[test]
    fn estimator_lower_bounds() {
        let est = estimate(200, 7);
        assert_eq!(est.output_tokens, 50);
        assert_eq!(est.input_tokens, 5);

        let est = estimate(0, 3);
        assert_eq!(est.output_tokens, 30);
        assert_eq!(est.input_tokens, 3);

        let est = estimate(0, 0);
        assert!(est.is_empty());
    }
}
