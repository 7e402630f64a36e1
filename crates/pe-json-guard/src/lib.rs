// SPDX-License-Identifier: MIT OR Apache-2.0
//! Guardrails and extraction helpers for untrusted worker-completion text.
//!
//! Two concerns live here: bounding the size/depth of a JSON payload before
//! it is handed to `serde_json`, and pulling a JSON object candidate out of
//! a raw model completion per the output contract's extraction algorithm.

use serde_json::Value;

/// Limits used to validate JSON payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JsonGuardLimits {
    /// Maximum allowed depth of objects/arrays.
    pub max_depth: usize,
    /// Maximum allowed UTF-8 byte size after JSON serialization.
    pub max_size_bytes: usize,
}

impl JsonGuardLimits {
    pub const fn new(max_depth: usize, max_size_bytes: usize) -> Self {
        Self {
            max_depth,
            max_size_bytes,
        }
    }

    /// Defaults sized for a single worker completion payload.
    pub const fn default_for_agent_output() -> Self {
        Self::new(16, 2_000_000)
    }
}

/// Validates that `value` is a JSON object and does not exceed depth/size
/// constraints. Returns a vector of validation errors; empty means the
/// payload passed all checks.
pub fn validate_json_payload(value: &Value, limits: JsonGuardLimits) -> Vec<String> {
    let mut errors = Vec::new();

    if !value.is_object() {
        errors.push("payload must be a JSON object".into());
        return errors;
    }

    if exceeds_depth(value, limits.max_depth) {
        errors.push(format!(
            "payload exceeds maximum nesting depth of {}",
            limits.max_depth
        ));
    }

    if value.to_string().len() > limits.max_size_bytes {
        let max_mb = limits.max_size_bytes / 1_000_000;
        if max_mb > 0 {
            errors.push(format!("payload exceeds maximum size of {max_mb}MB"));
        } else {
            errors.push(format!(
                "payload exceeds maximum size of {} bytes",
                limits.max_size_bytes
            ));
        }
    }

    errors
}

fn exceeds_depth(value: &Value, max_depth: usize) -> bool {
    if max_depth == 0 {
        return value.is_object() || value.is_array();
    }
    match value {
        Value::Object(map) => map.values().any(|v| exceeds_depth(v, max_depth - 1)),
        Value::Array(arr) => arr.iter().any(|v| exceeds_depth(v, max_depth - 1)),
        _ => false,
    }
}

/// Extract the first embedded JSON object candidate from raw completion
/// text, per the output contract's extraction algorithm: a fenced block
/// tagged `json` takes precedence over a standalone object whose keys
/// intersect `expected_keys`.
#[must_use]
pub fn extract_json_candidate(text: &str, expected_keys: &[&str]) -> Option<String> {
    if let Some(fenced) = extract_fenced_json(text) {
        return Some(fenced);
    }
    extract_standalone_object(text, expected_keys)
}

fn extract_fenced_json(text: &str) -> Option<String> {
    let marker = "```json";
    let start = text.find(marker)? + marker.len();
    let rest = &text[start..];
    let end = rest.find("```")?;
    Some(rest[..end].trim().to_string())
}

/// Scan for the first top-level `{...}` span whose parsed keys intersect
/// `expected_keys`. Bracket matching is depth-aware but ignores braces
/// inside string literals only at a coarse level (sufficient for
/// well-formed model output; malformed output fails the subsequent parse
/// anyway).
fn extract_standalone_object(text: &str, expected_keys: &[&str]) -> Option<String> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = matching_brace(text, i) {
                let candidate = &text[i..=end];
                if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(candidate) {
                    if expected_keys.is_empty() || map.keys().any(|k| expected_keys.contains(&k.as_str())) {
                        return Some(candidate.to_string());
                    }
                }
                i = end + 1;
                continue;
            }
        }
        i += 1;
    }
    None
}

fn matching_brace(text: &str, open: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (idx, &b) in bytes.iter().enumerate().skip(open) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

/// Verdict tokens recognized by the last-resort scan, matched case
/// insensitively within the final 512 bytes of a completion.
pub const VERDICT_SCAN_TOKENS: &[&str] = &[
    "APPROVE", "SHIP", "DONE", "PASS", "REJECT", "REVISE", "HOLD", "NEED_INFO", "FAIL",
];

/// Fallback scan used when no JSON object could be extracted: search the
/// last 512 bytes of `text` case-insensitively for a recognized verdict
/// token. Returns the first match found.
#[must_use]
pub fn scan_verdict_fallback(text: &str) -> Option<&'static str> {
    let tail_start = text.len().saturating_sub(512);
    // Walk back to a char boundary so we don't panic slicing mid-codepoint.
    let mut start = tail_start;
    while start < text.len() && !text.is_char_boundary(start) {
        start += 1;
    }
    let tail = text[start..].to_ascii_uppercase();
    VERDICT_SCAN_TOKENS.iter().find(|tok| tail.contains(*tok)).copied()
}
