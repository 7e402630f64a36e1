// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Backend adapter trait and static model-tier routing.
//!
//! A backend adapter is the only thing in this workspace that actually
//! talks to a language model. Everything upstream of it — the supervisor,
//! the decision machine, the guard — works with typed [`AgentOutput`] and
//! never sees a raw completion until the output contract has parsed one.

use async_trait::async_trait;
use pe_core::Role;
use pe_error::PeError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Stage of the dual-engine supervisor loop a backend call belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// The worker attempt that produces the role's primary output.
    Writer,
    /// The audit pass that reviews a writer's output.
    Auditor,
    /// The advisory/mandatory stamp pass after an audit approves.
    Stamp,
}

/// Per-call options threaded through to the backend.
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Model tier to route to; defaults to the static `(role, stage)` table.
    pub model_tier: Option<&'static str>,
    /// Per-call timeout. The caller (typically `pe-retry`) enforces this;
    /// it is advisory context here, not independently enforced by adapters.
    pub timeout: Duration,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            model_tier: None,
            timeout: Duration::from_secs(300),
        }
    }
}

/// Token accounting for a single backend call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Raw result of one backend invocation, before the output contract parses it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendCall {
    /// Raw completion text, not yet validated against any schema.
    pub text: String,
    pub usage: Usage,
    pub latency_ms: u64,
}

/// Something that can turn a persona + payload into a raw completion.
///
/// Implementors own everything vendor-specific (HTTP client, API key,
/// request shaping); this crate only defines the seam.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Human-readable name used in routing logs and error context.
    fn name(&self) -> &str;

    /// Invoke the backend. `persona` is an opaque prompt bundle identifier;
    /// only the output contract downstream interprets its declared schema.
    async fn call(
        &self,
        persona: &str,
        payload: &serde_json::Value,
        options: &CallOptions,
    ) -> Result<BackendCall, PeError>;
}

/// Static routing table from `(role, stage)` to a model tier name. Real
/// tier-to-vendor-model mapping lives in adapter configuration; this table
/// only decides which tier a call should prefer.
#[must_use]
pub fn model_tier_for(role: Role, stage: Stage) -> &'static str {
    match (role, stage) {
        (_, Stage::Stamp) => "fast",
        (Role::Pm | Role::Strategist | Role::Reviewer, Stage::Auditor) => "frontier",
        (Role::Pm | Role::Strategist | Role::Reviewer, Stage::Writer) => "frontier",
        (Role::Coder | Role::Researcher, _) => "standard",
        (Role::Qa | Role::Analyst | Role::Excavator, _) => "standard",
        (Role::Stamp, _) => "fast",
        (Role::Council, _) => "frontier",
    }
}

/// Resolve the effective options for a `(role, stage)` call, filling in
/// [`CallOptions::model_tier`] from [`model_tier_for`] when unset.
#[must_use]
pub fn resolve_options(role: Role, stage: Stage, mut options: CallOptions) -> CallOptions {
    if options.model_tier.is_none() {
        options.model_tier = Some(model_tier_for(role, stage));
    }
    options
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamp_calls_always_route_to_the_fast_tier() {
        assert_eq!(model_tier_for(Role::Pm, Stage::Stamp), "fast");
        assert_eq!(model_tier_for(Role::Coder, Stage::Stamp), "fast");
    }

    #[test]
    fn pm_writer_calls_route_to_frontier() {
        assert_eq!(model_tier_for(Role::Pm, Stage::Writer), "frontier");
    }

    #[test]
    fn coder_writer_calls_route_to_standard() {
        assert_eq!(model_tier_for(Role::Coder, Stage::Writer), "standard");
    }

    #[test]
    fn resolve_options_fills_in_unset_tier() {
        let resolved = resolve_options(Role::Qa, Stage::Writer, CallOptions::default());
        assert_eq!(resolved.model_tier, Some("standard"));
    }

    #[test]
    fn resolve_options_preserves_an_explicit_tier() {
        let options = CallOptions {
            model_tier: Some("frontier"),
            ..CallOptions::default()
        };
        let resolved = resolve_options(Role::Qa, Stage::Writer, options);
        assert_eq!(resolved.model_tier, Some("frontier"));
    }
}
