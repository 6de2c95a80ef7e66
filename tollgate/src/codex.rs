//! Request rewriting for the Codex route.
//!
//! Applied to `/chat/completions` bodies only; `/responses` and plain
//! `/completions` pass through untouched.

use serde_json::{Map, Value};

/// Instructions injected when the caller supplies none.
const CODEX_INSTRUCTIONS: &str = "You are Codex, a coding agent running in a \
user's terminal. You help with software engineering tasks: reading and \
editing files, running commands, and explaining code. Be precise and concise.";

/// Default model when the request carries none.
pub const DEFAULT_MODEL: &str = "gpt-5.1-codex";

/// Normalize a requested model name onto the served Codex family.
pub fn normalize_model_name(model: &str) -> &'static str {
    if model.is_empty() {
        return "gpt-5.1";
    }

    // Strip `provider/model` path form.
    let model_id = model.rsplit('/').next().unwrap_or(model);

    match model_id {
        "gpt-5.1-codex" | "gpt-5.1-codex-low" | "gpt-5.1-codex-medium" | "gpt-5.1-codex-high" => {
            "gpt-5.1-codex"
        }
        "gpt-5.1-codex-max" | "gpt-5.1-codex-max-low" | "gpt-5.1-codex-max-medium"
        | "gpt-5.1-codex-max-high" => "gpt-5.1-codex-max",
        "gpt-5.2" => "gpt-5.2",
        "gpt-5.2-codex" | "gpt-5.2-codex-low" | "gpt-5.2-codex-medium" | "gpt-5.2-codex-high" => {
            "gpt-5.2-codex"
        }
        "gpt-5.1-codex-mini" | "codex-mini-latest" => "gpt-5.1-codex-mini",
        "gpt-5.1" | "gpt-5" => "gpt-5.1",
        "gpt-5-codex" => "gpt-5.1-codex",
        other => fuzzy_match(other),
    }
}

// Longest, most specific substrings first.
fn fuzzy_match(model: &str) -> &'static str {
    let normalized = model.to_lowercase();
    let has = |needle: &str| {
        normalized.contains(needle) || normalized.contains(&needle.replace('-', " "))
    };

    if has("gpt-5.2-codex") {
        return "gpt-5.2-codex";
    }
    if has("gpt-5.2") {
        return "gpt-5.2";
    }
    if has("gpt-5.1-codex-max") {
        return "gpt-5.1-codex-max";
    }
    if has("gpt-5.1-codex-mini") {
        return "gpt-5.1-codex-mini";
    }
    if has("gpt-5.1-codex") {
        return "gpt-5.1-codex";
    }
    if has("gpt-5.1") {
        return "gpt-5.1";
    }
    if normalized.contains("codex") {
        return "gpt-5.1-codex";
    }
    if has("gpt-5") {
        return "gpt-5.1";
    }
    "gpt-5.1"
}

/// Apply the Codex transformations in place. Returns whether the body changed.
pub fn transform_request(body: &mut Map<String, Value>) -> bool {
    let mut modified = false;

    let model = body
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let normalized = normalize_model_name(&model);
    if normalized != model {
        body.insert("model".to_string(), Value::String(normalized.to_string()));
        modified = true;
    }

    // store=true breaks OAuth-forwarded upstreams.
    if !matches!(body.get("store"), Some(Value::Bool(false))) {
        body.insert("store".to_string(), Value::Bool(false));
        modified = true;
    }

    let needs_instructions = body
        .get("instructions")
        .and_then(Value::as_str)
        .map_or(true, |s| s.trim().is_empty());
    if needs_instructions {
        body.insert(
            "instructions".to_string(),
            Value::String(CODEX_INSTRUCTIONS.to_string()),
        );
        modified = true;
    }

    for unsupported in ["max_output_tokens", "max_completion_tokens"] {
        if body.remove(unsupported).is_some() {
            modified = true;
        }
    }

    modified
}
