// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Rule-based classification engine with prioritized, composable conditions.
//!
//! Domain-agnostic by design: the decision machine's escalation-reason
//! keyword dictionary is built on top of this engine by tagging each rule's
//! effect with a classification string, but nothing here knows about
//! pipelines, jobs, or escalation reasons.

use globset::Glob;
use serde::{Deserialize, Serialize};

/// A composable predicate that decides whether a rule applies to a resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCondition {
    /// Matches every resource.
    Always,
    /// Matches no resource.
    Never,
    /// Matches resources whose name satisfies the glob pattern.
    Pattern(String),
    /// Matches resources containing `needle`, case-insensitively.
    Keyword(String),
    /// All child conditions must match.
    And(Vec<RuleCondition>),
    /// At least one child condition must match.
    Or(Vec<RuleCondition>),
    /// Negates the inner condition.
    Not(Box<RuleCondition>),
}

impl RuleCondition {
    /// Evaluate this condition against `resource`.
    #[must_use]
    pub fn matches(&self, resource: &str) -> bool {
        match self {
            Self::Always => true,
            Self::Never => false,
            Self::Pattern(pat) => Glob::new(pat)
                .ok()
                .is_some_and(|g| g.compile_matcher().is_match(resource)),
            Self::Keyword(needle) => resource
                .to_ascii_lowercase()
                .contains(&needle.to_ascii_lowercase()),
            Self::And(conds) => conds.iter().all(|c| c.matches(resource)),
            Self::Or(conds) => conds.iter().any(|c| c.matches(resource)),
            Self::Not(inner) => !inner.matches(resource),
        }
    }
}

/// The action taken when a rule matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleEffect {
    /// Permit the action.
    Allow,
    /// Deny the action.
    Deny,
    /// Allow but emit a log entry.
    Log,
    /// Allow but apply a rate limit.
    Throttle {
        /// Maximum number of allowed invocations.
        max: u32,
    },
    /// Tag the match with an arbitrary classification string, used by
    /// keyword dictionaries that sort matches into named categories.
    Classify(String),
}

/// A single rule with a condition, effect, and priority.
///
/// Rules are evaluated in **descending** priority order (higher number wins).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub description: String,
    pub condition: RuleCondition,
    pub effect: RuleEffect,
    /// Higher priority rules are evaluated first and take precedence.
    pub priority: u32,
}

/// Result of evaluating a single rule against a resource.
#[derive(Debug, Clone)]
pub struct RuleEvaluation {
    pub rule_id: String,
    pub matched: bool,
    pub effect: RuleEffect,
}

/// Engine that evaluates an ordered set of [`Rule`]s against a resource.
///
/// When multiple rules match, the one with the **highest priority** wins.
/// Ties are broken by insertion order (earlier rule wins).
#[derive(Debug, Clone, Default)]
pub struct RuleEngine {
    rules: Vec<Rule>,
}

impl RuleEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    /// Evaluate `resource` and return the effect of the highest-priority
    /// matching rule. Returns [`RuleEffect::Allow`] when no rule matches.
    #[must_use]
    pub fn evaluate(&self, resource: &str) -> RuleEffect {
        self.rules
            .iter()
            .filter(|r| r.condition.matches(resource))
            .max_by_key(|r| r.priority)
            .map_or(RuleEffect::Allow, |r| r.effect.clone())
    }

    #[must_use]
    pub fn evaluate_all(&self, resource: &str) -> Vec<RuleEvaluation> {
        self.rules
            .iter()
            .map(|r| RuleEvaluation {
                rule_id: r.id.clone(),
                matched: r.condition.matches(resource),
                effect: r.effect.clone(),
            })
            .collect()
    }

    #[must_use]
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn remove_rule(&mut self, id: &str) {
        self.rules.retain(|r| r.id != id);
    }

    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

/// `(keyword, classification tag, priority)` entries for a dictionary built
/// with [`keyword_dictionary`]. A `priority` of `0` means "assign by
/// position" (earlier entries outrank later ones).
pub type DictionaryEntry = (&'static str, &'static str, u32);

/// Build a [`RuleEngine`] that classifies text by the first keyword it
/// contains, with earlier entries in `entries` winning ties.
#[must_use]
pub fn keyword_dictionary(entries: &[DictionaryEntry]) -> RuleEngine {
    let mut engine = RuleEngine::new();
    let n = entries.len() as u32;
    for (i, (keyword, tag, explicit_priority)) in entries.iter().enumerate() {
        let priority = if *explicit_priority > 0 {
            *explicit_priority
        } else {
            n - i as u32
        };
        engine.add_rule(Rule {
            id: format!("kw:{keyword}"),
            description: format!("classifies text containing \"{keyword}\" as {tag}"),
            condition: RuleCondition::Keyword((*keyword).to_string()),
            effect: RuleEffect::Classify((*tag).to_string()),
            priority,
        });
    }
    engine
}

/// Classify `text` against `engine`, returning the tag of the
/// highest-priority matching rule, if any matched.
#[must_use]
pub fn classify(engine: &RuleEngine, text: &str) -> Option<String> {
    match engine.evaluate(text) {
        RuleEffect::Classify(tag) => Some(tag),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_condition_is_case_insensitive() {
        let cond = RuleCondition::Keyword("Deploy".into());
        assert!(cond.matches("please deploy production now"));
        assert!(!cond.matches("nothing relevant here"));
    }

    #[test]
    fn highest_priority_match_wins() {
        let mut engine = RuleEngine::new();
        engine.add_rule(Rule {
            id: "low".into(),
            description: String::new(),
            condition: RuleCondition::Always,
            effect: RuleEffect::Allow,
            priority: 1,
        });
        engine.add_rule(Rule {
            id: "high".into(),
            description: String::new(),
            condition: RuleCondition::Always,
            effect: RuleEffect::Deny,
            priority: 10,
        });
        assert_eq!(engine.evaluate("anything"), RuleEffect::Deny);
    }

    #[test]
    fn no_match_defaults_to_allow() {
        let engine = RuleEngine::new();
        assert_eq!(engine.evaluate("anything"), RuleEffect::Allow);
    }

    #[test]
    fn keyword_dictionary_classifies_first_match() {
        let dict = keyword_dictionary(&[
            ("deploy", "deploy", 0),
            ("api_key", "api_key", 0),
            ("payment", "payment", 0),
        ]);
        assert_eq!(
            classify(&dict, "we need to deploy production"),
            Some("deploy".into())
        );
        assert_eq!(
            classify(&dict, "rotate the api_key please"),
            Some("api_key".into())
        );
        assert_eq!(classify(&dict, "nothing to see here"), None);
    }

    #[test]
    fn earlier_dictionary_entries_win_ties() {
        let dict = keyword_dictionary(&[("deploy", "deploy", 0), ("key", "api_key", 0)]);
        assert_eq!(
            classify(&dict, "deploy with the right key"),
            Some("deploy".into())
        );
    }

    #[test]
    fn removing_a_rule_drops_it_from_evaluation() {
        let mut engine = RuleEngine::new();
        engine.add_rule(Rule {
            id: "only".into(),
            description: String::new(),
            condition: RuleCondition::Always,
            effect: RuleEffect::Deny,
            priority: 1,
        });
        engine.remove_rule("only");
        assert_eq!(engine.rule_count(), 0);
        assert_eq!(engine.evaluate("anything"), RuleEffect::Allow);
    }
}
