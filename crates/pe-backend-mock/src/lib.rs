// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deterministic mock backend adapter for local development and tests.
//!
//! Routes on a substring of the persona identifier (`"coder"`, `"qa"`,
//! `"reviewer"`, `"pm"`) to a canned, contract-valid completion so the
//! supervisor loop, guard, and decision machine can be exercised without a
//! real model call. Anything unrecognised falls back to a generic approval.

use async_trait::async_trait;
use pe_backend::{BackendAdapter, BackendCall, CallOptions, Usage};
use pe_error::PeError;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// A backend that never leaves the process, returning fixed or
/// persona-routed completions.
#[derive(Debug, Default)]
pub struct MockBackend {
    calls: AtomicU64,
}

impl MockBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `call` invocations served so far, for test assertions.
    #[must_use]
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    fn canned_response(persona: &str) -> &'static str {
        let p = persona.to_ascii_lowercase();
        if p.contains("coder") {
            r#"{"role":"coder","summary":"added retry handling to the backend client","files_changed":["src/client.rs"],"diff":"--- a/src/client.rs\n+++ b/src/client.rs\n@@ -1,1 +1,2 @@\n+retry","todo_next":[]}"#
        } else if p.contains("qa") {
            r#"{"role":"qa","verdict":"PASS","tests":["test_retry_succeeds"],"coverage":0.92,"issues":[]}"#
        } else if p.contains("reviewer") {
            r#"{"role":"reviewer","verdict":"APPROVE","risks":[],"security_score":8,"approved_files":["src/client.rs"],"blocked_files":[]}"#
        } else if p.contains("pm") {
            r#"{"role":"pm","action":"DONE","tasks":[],"summary":"all work approved and merged"}"#
        } else {
            r#"{"role":"generic","verdict":"APPROVE","fields":{}}"#
        }
    }
}

#[async_trait]
impl BackendAdapter for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn call(
        &self,
        persona: &str,
        _payload: &Value,
        _options: &CallOptions,
    ) -> Result<BackendCall, PeError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let text = Self::canned_response(persona).to_string();
        Ok(BackendCall {
            usage: Usage {
                prompt_tokens: 64,
                completion_tokens: text.len() as u32 / 4,
            },
            latency_ms: started.elapsed().as_millis() as u64,
            text,
        })
    }
}
