// SPDX-License-Identifier: MIT OR Apache-2.0
//! Decision machine: validate PM decision transitions and derive a
//! normalized [`Decision`] from a parsed PM output.
//!
//! The transition graph is `DISPATCH → {RETRY, DONE, BLOCKED}`,
//! `RETRY → {DISPATCH, BLOCKED}`, `BLOCKED → {ESCALATE}`,
//! `ESCALATE → {DONE}`, with `DONE` terminal and no outgoing edges. A
//! pipeline's first decision has no `from` state and must be `DISPATCH`.
//! CEO-requires conditions (deploy, api key rotation, payment, destructive
//! data deletion, dependency changes, security) are detected from the PM's
//! summary independent of its declared action and always win: a detected
//! reason forces `ESCALATE` regardless of what the model said.

use pe_core::{AgentOutput, Decision, DecisionAction, EscalationReason, Role};
use pe_error::{ErrorCode, PeError};
use pe_guard::find_blacklisted_phrase;
use pe_rule_engine::{classify, keyword_dictionary, RuleEngine};

/// Builds the escalation-reason keyword dictionary once and evaluates PM
/// summaries against it.
pub struct DecisionMachine {
    escalation_dictionary: RuleEngine,
}

impl Default for DecisionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl DecisionMachine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            escalation_dictionary: keyword_dictionary(&[
                ("deploy", "deploy", 0),
                ("api_key", "api_key", 0),
                ("payment", "payment", 0),
                ("data_delete", "data_delete", 0),
                ("dependency", "dependency", 0),
                ("security", "security", 0),
            ]),
        }
    }

    /// Scan `text` for a CEO-requires-attention keyword, returning the
    /// matching [`EscalationReason`] if any.
    #[must_use]
    pub fn detect_escalation_reason(&self, text: &str) -> Option<EscalationReason> {
        classify(&self.escalation_dictionary, text).map(|tag| match tag.as_str() {
            "deploy" => EscalationReason::Deploy,
            "api_key" => EscalationReason::ApiKey,
            "payment" => EscalationReason::Payment,
            "data_delete" => EscalationReason::DataDelete,
            "dependency" => EscalationReason::Dependency,
            "security" => EscalationReason::Security,
            _ => EscalationReason::None,
        })
    }

    /// Derive a normalized [`Decision`] from a parsed PM output. Returns an
    /// [`ErrorCode::Internal`] error if `output` is not the `Pm` variant —
    /// callers are expected to route only PM completions here.
    pub fn derive_decision(&self, output: &AgentOutput) -> Result<Decision, PeError> {
        let AgentOutput::Pm {
            action,
            tasks,
            summary,
            requires_escalation_reason,
        } = output
        else {
            return Err(PeError::new(ErrorCode::Internal, "derive_decision requires a Pm output"));
        };

        let detected = self.detect_escalation_reason(summary);
        let (action, reason) = if let Some(detected) = detected {
            (DecisionAction::Escalate, detected)
        } else {
            (*action, requires_escalation_reason.unwrap_or(EscalationReason::None))
        };

        let (action, tasks) = match action {
            DecisionAction::Dispatch if is_valid_dispatch(tasks) => (action, tasks.clone()),
            DecisionAction::Dispatch => (DecisionAction::Blocked, Vec::new()),
            DecisionAction::Done if summary.trim().is_empty() => (DecisionAction::Blocked, Vec::new()),
            other => (other, tasks.clone()),
        };

        let confidence = if find_blacklisted_phrase(summary).is_some() { 0.5 } else { 1.0 };

        let mut decision = Decision {
            action,
            tasks,
            summary: summary.clone(),
            requires_escalation_reason: reason,
            confidence,
        };
        decision.clamp_summary();
        Ok(decision)
    }
}

fn is_valid_dispatch(tasks: &[pe_core::TaskDescriptor]) -> bool {
    !tasks.is_empty() && tasks.iter().all(|t| Role::allowed_from_pm().contains(&t.role))
}

/// Validate a transition from `from` (`None` for a pipeline's first
/// decision) to `to` against the decision machine's state graph.
pub fn validate_transition(from: Option<DecisionAction>, to: DecisionAction) -> Result<(), PeError> {
    let allowed: &[DecisionAction] = match from {
        None => &[DecisionAction::Dispatch],
        Some(DecisionAction::Dispatch) => &[DecisionAction::Retry, DecisionAction::Done, DecisionAction::Blocked],
        Some(DecisionAction::Retry) => &[DecisionAction::Dispatch, DecisionAction::Blocked],
        Some(DecisionAction::Blocked) => &[DecisionAction::Escalate],
        Some(DecisionAction::Escalate) => &[DecisionAction::Done],
        Some(DecisionAction::Done) => &[],
    };
    if allowed.contains(&to) {
        Ok(())
    } else {
        Err(PeError::new(
            ErrorCode::InvalidTransition,
            format!("{from:?} -> {to:?} is not an allowed decision transition"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pe_core::{JobMode, TaskDescriptor};
    use serde_json::Value;

    fn pm(action: DecisionAction, tasks: Vec<TaskDescriptor>, summary: &str) -> AgentOutput {
        AgentOutput::Pm {
            action,
            tasks,
            summary: summary.into(),
            requires_escalation_reason: None,
        }
    }

    fn task(role: Role) -> TaskDescriptor {
        TaskDescriptor {
            role,
            mode: JobMode::Worker,
            payload: Value::Null,
            context: Value::Null,
        }
    }

    #[test]
    fn initial_transition_must_be_dispatch() {
        assert!(validate_transition(None, DecisionAction::Dispatch).is_ok());
        assert!(validate_transition(None, DecisionAction::Done).is_err());
    }

    #[test]
    fn dispatch_allows_retry_done_or_blocked() {
        for to in [DecisionAction::Retry, DecisionAction::Done, DecisionAction::Blocked] {
            assert!(validate_transition(Some(DecisionAction::Dispatch), to).is_ok());
        }
        assert!(validate_transition(Some(DecisionAction::Dispatch), DecisionAction::Escalate).is_err());
    }

    #[test]
    fn done_is_terminal() {
        assert!(validate_transition(Some(DecisionAction::Done), DecisionAction::Dispatch).is_err());
    }

    #[test]
    fn blocked_only_allows_escalate() {
        assert!(validate_transition(Some(DecisionAction::Blocked), DecisionAction::Escalate).is_ok());
        assert!(validate_transition(Some(DecisionAction::Blocked), DecisionAction::Dispatch).is_err());
    }

    #[test]
    fn deploy_keyword_overrides_declared_action() {
        let machine = DecisionMachine::new();
        let output = pm(DecisionAction::Done, vec![], "ready to deploy production now");
        let decision = machine.derive_decision(&output).unwrap();
        assert_eq!(decision.action, DecisionAction::Escalate);
        assert_eq!(decision.requires_escalation_reason, EscalationReason::Deploy);
    }

    #[test]
    fn dispatch_with_no_tasks_is_coerced_to_blocked() {
        let machine = DecisionMachine::new();
        let output = pm(DecisionAction::Dispatch, vec![], "kick off implementation");
        let decision = machine.derive_decision(&output).unwrap();
        assert_eq!(decision.action, DecisionAction::Blocked);
    }

    #[test]
    fn dispatch_to_a_role_pm_cannot_hand_work_to_is_coerced_to_blocked() {
        let machine = DecisionMachine::new();
        let output = pm(DecisionAction::Dispatch, vec![task(Role::Pm)], "hand off to self");
        let decision = machine.derive_decision(&output).unwrap();
        assert_eq!(decision.action, DecisionAction::Blocked);
    }

    #[test]
    fn valid_dispatch_keeps_tasks() {
        let machine = DecisionMachine::new();
        let output = pm(DecisionAction::Dispatch, vec![task(Role::Coder)], "implement fn x");
        let decision = machine.derive_decision(&output).unwrap();
        assert_eq!(decision.action, DecisionAction::Dispatch);
        assert_eq!(decision.tasks.len(), 1);
    }

    #[test]
    fn rubber_stamp_summary_halves_confidence() {
        let machine = DecisionMachine::new();
        let output = pm(DecisionAction::Done, vec![], "looks good, no issues");
        let decision = machine.derive_decision(&output).unwrap();
        assert_eq!(decision.confidence, 0.5);
    }

    #[test]
    fn done_with_empty_summary_is_coerced_to_blocked() {
        let machine = DecisionMachine::new();
        let output = pm(DecisionAction::Done, vec![], "   ");
        let decision = machine.derive_decision(&output).unwrap();
        assert_eq!(decision.action, DecisionAction::Blocked);
    }

    #[test]
    fn non_pm_output_is_rejected() {
        let machine = DecisionMachine::new();
        let output = AgentOutput::Generic {
            verdict: None,
            fields: Default::default(),
        };
        assert!(machine.derive_decision(&output).is_err());
    }
}
