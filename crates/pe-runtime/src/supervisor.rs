// SPDX-License-Identifier: MIT OR Apache-2.0
//! Dual-engine supervisor: the write → contract → guard → audit → stamp
//! loop a single worker job runs through before its output is handed to
//! the orchestrator.
//!
//! Modeled as an explicit state machine rather than exception-style
//! control flow, per the redesign notes: every stage returns a value, the
//! audit-reject-then-rewrite structure is a bounded loop capped at
//! `MAX_REWRITES`, and nothing holds a lock across a backend call.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use pe_backend::{resolve_options, BackendAdapter, CallOptions, Stage};
use pe_core::{content_hash, AgentOutput, EscalationLevel, FailureSignature, Role, Verdict};
use pe_error::{ErrorCode, PeError};
use pe_escalate::Escalator;
use pe_guard::guard_agent_output;
use pe_json_guard::{extract_json_candidate, scan_verdict_fallback};
use pe_retry::{retry_async, RetryPolicy, TimeoutConfig};
use serde_json::{json, Value};
use tracing::instrument;

use crate::cancel::CancellationToken;
use crate::contract::extract_agent_output;
use crate::registry::BackendRegistry;

/// Summarizes a payload that triggered a context-window-overflow error,
/// producing a compacted replacement to retry with. Implementations are
/// external to this crate — typically a smaller, cheaper backend call
/// that rewrites prior turns into a shorter digest.
#[async_trait]
pub trait Compactor: Send + Sync {
    async fn compact(&self, payload: &Value) -> Result<Value, PeError>;
}

/// A stamp backend's structured verdict on an already-approved output.
#[derive(Debug, Clone)]
pub struct StampResult {
    pub verdict: Verdict,
    pub score: Option<f64>,
    pub blocking_issues: Vec<String>,
    pub requires_escalation: bool,
}

/// Terminal result of one supervisor invocation.
#[derive(Debug, Clone)]
pub enum SupervisorOutcome {
    /// The auditor approved the writer's output (optionally after rewrites).
    /// `requires_escalation` is set when the stamp stage flagged it, which
    /// is binding regardless of the stamp's own verdict.
    Approved {
        output: AgentOutput,
        degraded_parse: bool,
        stamp: Option<StampResult>,
        requires_escalation: bool,
    },
    /// The auditor rejected the output, or the rewrite budget was
    /// exhausted without reaching approval.
    Blocked { reason: String },
    /// The pipeline's cancellation token fired mid-loop.
    Cancelled,
}

/// Drives the write/audit/stamp loop for a single role's backend calls.
pub struct Supervisor {
    max_rewrites: u32,
    retry_policy: RetryPolicy,
    timeouts: TimeoutConfig,
    compactor: Option<Arc<dyn Compactor>>,
}

impl Supervisor {
    #[must_use]
    pub fn new(max_rewrites: u32, retry_policy: RetryPolicy, timeouts: TimeoutConfig) -> Self {
        Self {
            max_rewrites,
            retry_policy,
            timeouts,
            compactor: None,
        }
    }

    /// Attach a [`Compactor`] used to retry once, with a compacted
    /// payload, on a context-window-overflow error from any backend call.
    #[must_use]
    pub fn with_compactor(mut self, compactor: Arc<dyn Compactor>) -> Self {
        self.compactor = Some(compactor);
        self
    }

    /// Run the loop for `role` against `persona`'s writer/auditor/stamp
    /// backends, starting from `payload`. `candidate_profiles` are
    /// alternate personas the escalator may hand back for a role-switch
    /// retry on contract/guard failure.
    #[instrument(target = "pe.supervisor", skip(self, registry, escalator, cancellation, payload, candidate_profiles), fields(role = ?role, persona = %persona))]
    pub async fn run(
        &self,
        registry: &BackendRegistry,
        escalator: &mut Escalator,
        cancellation: &CancellationToken,
        role: Role,
        persona: &str,
        mut payload: Value,
        candidate_profiles: &[String],
    ) -> Result<SupervisorOutcome, PeError> {
        let mut current_persona = persona.to_string();

        for rewrite in 0..=self.max_rewrites {
            if cancellation.is_cancelled() {
                return Ok(SupervisorOutcome::Cancelled);
            }

            let writer = registry.get(&backend_name(&current_persona, Stage::Writer))?;
            let options = resolve_options(role, Stage::Writer, CallOptions::default());
            let call = self
                .call_with_context_retry(writer, &current_persona, &payload, &options)
                .await;

            let raw = match call {
                Ok(call) => call.text,
                Err(err) => return Ok(self.escalate_or_blocked(escalator, role, &current_persona, &payload, err)),
            };

            let outcome = match extract_agent_output(role, &raw) {
                Ok(outcome) => outcome,
                Err(err) => return Ok(self.escalate_or_blocked(escalator, role, &current_persona, &payload, err)),
            };

            let violations = guard_agent_output(&outcome.output);
            if !violations.is_empty() {
                let err = PeError::new(
                    ErrorCode::SemanticNull,
                    format!("{} guard violation(s)", violations.len()),
                );
                return Ok(self.escalate_or_blocked(escalator, role, &current_persona, &payload, err));
            }

            if cancellation.is_cancelled() {
                return Ok(SupervisorOutcome::Cancelled);
            }

            let auditor = registry.get(&backend_name(&current_persona, Stage::Auditor))?;
            let audit_options = resolve_options(role, Stage::Auditor, CallOptions::default());
            let audit_payload = json!({"output": outcome.output, "role": role});
            let audit_call = match self
                .call_with_context_retry(auditor, &current_persona, &audit_payload, &audit_options)
                .await
            {
                Ok(call) => call,
                Err(err) => return Ok(self.escalate_or_blocked(escalator, role, &current_persona, &payload, err)),
            };
            let verdict = parse_verdict(&audit_call.text)?;

            match verdict {
                Verdict::Approve => {
                    if cancellation.is_cancelled() {
                        return Ok(SupervisorOutcome::Cancelled);
                    }

                    let stamp = match self.run_stamp(registry, role, &current_persona, &outcome.output).await {
                        Ok(stamp) => stamp,
                        Err(err) => {
                            return Ok(self.escalate_or_blocked(escalator, role, &current_persona, &payload, err))
                        }
                    };
                    let requires_escalation = stamp.as_ref().is_some_and(|s| s.requires_escalation);
                    return Ok(SupervisorOutcome::Approved {
                        output: outcome.output,
                        degraded_parse: outcome.degraded_parse,
                        stamp,
                        requires_escalation,
                    });
                }
                Verdict::Reject => {
                    return Ok(SupervisorOutcome::Blocked {
                        reason: format!("auditor rejected {role:?} output: {}", audit_call.text),
                    });
                }
                Verdict::Revise => {
                    if rewrite + 1 > self.max_rewrites {
                        return Ok(SupervisorOutcome::Blocked {
                            reason: format!("{role:?} exhausted rewrite budget without approval"),
                        });
                    }
                    payload = append_audit_notes(payload, &audit_call.text);
                }
            }
        }

        Ok(SupervisorOutcome::Blocked {
            reason: format!("{role:?} exhausted rewrite budget without approval"),
        })
    }

    async fn run_stamp(
        &self,
        registry: &BackendRegistry,
        role: Role,
        persona: &str,
        output: &AgentOutput,
    ) -> Result<Option<StampResult>, PeError> {
        let Ok(stamp_backend) = registry.get(&backend_name(persona, Stage::Stamp)) else {
            return Ok(None);
        };
        let options = resolve_options(role, Stage::Stamp, CallOptions::default());
        let payload = json!({"output": output});
        let call = self.call_with_context_retry(stamp_backend, persona, &payload, &options).await?;
        Ok(Some(parse_stamp(&call.text)?))
    }

    async fn call_with_retry(
        &self,
        backend: &dyn BackendAdapter,
        persona: &str,
        payload: &Value,
        options: &CallOptions,
    ) -> Result<pe_backend::BackendCall, PeError> {
        let outcome = retry_async(&self.retry_policy, &self.timeouts, || backend.call(persona, payload, options)).await?;
        Ok(outcome.value)
    }

    /// Call, and on a context-window-overflow error invoke the configured
    /// [`Compactor`] (if any) to retry exactly once with a compacted
    /// payload. Any other error, or a context-overflow error with no
    /// compactor configured, propagates unchanged.
    async fn call_with_context_retry(
        &self,
        backend: &dyn BackendAdapter,
        persona: &str,
        payload: &Value,
        options: &CallOptions,
    ) -> Result<pe_backend::BackendCall, PeError> {
        match self.call_with_retry(backend, persona, payload, options).await {
            Err(err) if err.code == ErrorCode::ContextOverflow => {
                let Some(compactor) = &self.compactor else {
                    return Err(err);
                };
                let compacted = compactor.compact(payload).await?;
                self.call_with_retry(backend, persona, &compacted, options).await
            }
            other => other,
        }
    }

    /// Record the failure against the escalator and either recommend a
    /// role-switch retry (left to the caller, which owns the loop) or a
    /// terminal `Blocked` outcome on hard-fail.
    fn escalate_or_blocked(
        &self,
        escalator: &mut Escalator,
        role: Role,
        persona: &str,
        payload: &Value,
        err: PeError,
    ) -> SupervisorOutcome {
        let prompt_hash = content_hash(payload).unwrap_or_default();
        let signature = FailureSignature::new(err.code.as_str(), missing_fields(&err), role, prompt_hash);
        let outcome = escalator.record_failure(signature, &[persona.to_string()]);
        SupervisorOutcome::Blocked {
            reason: format!(
                "{role:?} failed contract/guard check ({}): escalation level {:?} after {} attempt(s)",
                err, outcome.level, outcome.count
            ),
        }
    }
}

fn missing_fields(err: &PeError) -> Vec<String> {
    err.context
        .get("missing_fields")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default()
}

fn backend_name(persona: &str, stage: Stage) -> String {
    let suffix = match stage {
        Stage::Writer => "writer",
        Stage::Auditor => "auditor",
        Stage::Stamp => "stamp",
    };
    format!("{persona}:{suffix}")
}

fn append_audit_notes(payload: Value, notes: &str) -> Value {
    let mut payload = payload;
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("audit_notes".to_string(), Value::String(notes.to_string()));
        obj.insert("rewritten_at".to_string(), Value::String(Utc::now().to_rfc3339()));
        payload
    } else {
        json!({"prior_payload": payload, "audit_notes": notes})
    }
}

fn parse_verdict(raw: &str) -> Result<Verdict, PeError> {
    if let Some(candidate) = extract_json_candidate(raw, &["verdict"]) {
        if let Ok(value) = serde_json::from_str::<Value>(&candidate) {
            if let Some(token) = value.get("verdict").and_then(Value::as_str) {
                return Verdict::normalize(token)
                    .ok_or_else(|| PeError::new(ErrorCode::InvalidValue, format!("unrecognized verdict token: {token}")));
            }
        }
    }
    scan_verdict_fallback(raw)
        .and_then(Verdict::normalize)
        .ok_or_else(|| PeError::new(ErrorCode::SemanticNull, "auditor response carried no verdict"))
}

fn parse_stamp(raw: &str) -> Result<StampResult, PeError> {
    let candidate = extract_json_candidate(raw, &["verdict", "score", "requires_escalation"])
        .ok_or_else(|| PeError::new(ErrorCode::SemanticNull, "stamp response carried no json object"))?;
    let value: Value = serde_json::from_str(&candidate)
        .map_err(|e| PeError::new(ErrorCode::JsonParse, format!("malformed stamp response: {e}")))?;

    let token = value.get("verdict").and_then(Value::as_str).unwrap_or("REJECT");
    let verdict = Verdict::normalize(token).unwrap_or(Verdict::Reject);
    Ok(StampResult {
        verdict,
        score: value.get("score").and_then(Value::as_f64),
        blocking_issues: value
            .get("blocking_issues")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default(),
        requires_escalation: value.get("requires_escalation").and_then(Value::as_bool).unwrap_or(false),
    })
}

/// Monotonic escalation level reached is surfaced to callers deciding
/// whether a role-switch retry is worth another supervisor invocation.
#[must_use]
pub fn should_retry_with_role_switch(level: EscalationLevel) -> bool {
    level == EscalationLevel::RoleSwitch
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_verdict_reads_fenced_json() {
        let raw = "```json\n{\"verdict\": \"APPROVE\"}\n```";
        assert_eq!(parse_verdict(raw).unwrap(), Verdict::Approve);
    }

    #[test]
    fn parse_verdict_falls_back_to_scan() {
        assert_eq!(parse_verdict("my final answer is reject").unwrap(), Verdict::Reject);
    }

    #[test]
    fn parse_verdict_errors_without_any_token() {
        assert!(parse_verdict("no signal here").is_err());
    }

    #[test]
    fn parse_stamp_reads_full_payload() {
        let raw = r#"{"verdict": "APPROVE", "score": 0.9, "blocking_issues": [], "requires_escalation": false}"#;
        let stamp = parse_stamp(raw).unwrap();
        assert_eq!(stamp.verdict, Verdict::Approve);
        assert_eq!(stamp.score, Some(0.9));
        assert!(!stamp.requires_escalation);
    }

    #[test]
    fn parse_stamp_defaults_missing_verdict_to_reject() {
        let raw = r#"{"requires_escalation": true}"#;
        let stamp = parse_stamp(raw).unwrap();
        assert_eq!(stamp.verdict, Verdict::Reject);
        assert!(stamp.requires_escalation);
    }

    #[test]
    fn backend_name_encodes_stage_suffix() {
        assert_eq!(backend_name("coder", Stage::Writer), "coder:writer");
        assert_eq!(backend_name("coder", Stage::Auditor), "coder:auditor");
        assert_eq!(backend_name("coder", Stage::Stamp), "coder:stamp");
    }

    #[test]
    fn role_switch_is_only_recommended_at_that_level() {
        assert!(!should_retry_with_role_switch(EscalationLevel::SelfRepair));
        assert!(should_retry_with_role_switch(EscalationLevel::RoleSwitch));
        assert!(!should_retry_with_role_switch(EscalationLevel::HardFail));
    }

    #[test]
    fn append_audit_notes_preserves_original_object_fields() {
        let payload = json!({"task": "implement"});
        let updated = append_audit_notes(payload, "please add tests");
        assert_eq!(updated["task"], "implement");
        assert_eq!(updated["audit_notes"], "please add tests");
    }

    struct FlakyBackend {
        calls: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl BackendAdapter for FlakyBackend {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn call(
            &self,
            _persona: &str,
            payload: &Value,
            _options: &CallOptions,
        ) -> Result<pe_backend::BackendCall, PeError> {
            let attempt = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if attempt == 0 {
                Err(PeError::new(ErrorCode::ContextOverflow, "prompt exceeds context window"))
            } else {
                Ok(pe_backend::BackendCall {
                    text: format!("ok:{}", payload.get("compacted").is_some()),
                    usage: pe_backend::Usage::default(),
                    latency_ms: 1,
                })
            }
        }
    }

    struct StubCompactor;

    #[async_trait]
    impl Compactor for StubCompactor {
        async fn compact(&self, _payload: &Value) -> Result<Value, PeError> {
            Ok(json!({"compacted": true}))
        }
    }

    #[tokio::test]
    async fn context_overflow_retries_once_with_compacted_payload() {
        let supervisor = Supervisor::new(0, RetryPolicy::default(), TimeoutConfig::default())
            .with_compactor(std::sync::Arc::new(StubCompactor));
        let backend = FlakyBackend {
            calls: std::sync::atomic::AtomicU32::new(0),
        };
        let options = CallOptions::default();

        let call = supervisor
            .call_with_context_retry(&backend, "persona", &json!({"task": "x"}), &options)
            .await
            .unwrap();
        assert_eq!(call.text, "ok:true");
    }

    #[tokio::test]
    async fn context_overflow_without_a_compactor_propagates_the_error() {
        let supervisor = Supervisor::new(0, RetryPolicy::default(), TimeoutConfig::default());
        let backend = FlakyBackend {
            calls: std::sync::atomic::AtomicU32::new(0),
        };
        let options = CallOptions::default();

        let err = supervisor
            .call_with_context_retry(&backend, "persona", &json!({"task": "x"}), &options)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ContextOverflow);
    }
}
