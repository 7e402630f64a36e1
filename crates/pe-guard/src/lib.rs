// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

//! Semantic guard: a second line of defense after the output contract that
//! catches syntactically valid but semantically empty worker output — a
//! rubber-stamped review, a one-line "looks good" standing in for an audit,
//! or a coder claiming a diff with no files changed.
//!
//! This complements `pe-json-guard` (which bounds the *shape* of the JSON)
//! and the output contract in `pe-core` (which bounds the *schema*); this
//! crate checks field *content* against per-role rules.

use pe_core::{AgentOutput, QaVerdict, Verdict};
use pe_error::ErrorCode;
use serde::{Deserialize, Serialize};

/// Phrases that signal a rubber-stamped, non-substantive review. Matched
/// case-insensitively for the Latin entries; the Hangul entries are matched
/// as literal substrings since Korean has no case folding.
const BLACKLIST_PHRASES: &[&str] = &[
    "i have reviewed",
    "looks good",
    "no issues",
    "seems fine",
    "검토했습니다",
    "문제없습니다",
    "문제 없습니다",
    "괜찮아 보입니다",
];

/// A single failed field rule, carrying the [`ErrorCode`] the escalator
/// should file it under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardViolation {
    pub code: ErrorCode,
    pub field: String,
    pub message: String,
}

impl GuardViolation {
    fn new(code: ErrorCode, field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Find the first blacklisted phrase contained in `text`, if any.
#[must_use]
pub fn find_blacklisted_phrase(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    BLACKLIST_PHRASES
        .iter()
        .find(|phrase| lower.contains(&phrase.to_lowercase()))
        .copied()
}

/// Run every applicable rule against `output`, returning every violation
/// found (never short-circuits on the first failure — the escalator wants
/// the full picture for its failure signature).
#[must_use]
pub fn guard_agent_output(output: &AgentOutput) -> Vec<GuardViolation> {
    match output {
        AgentOutput::Coder {
            summary,
            files_changed,
            diff,
            ..
        } => guard_coder(summary, files_changed, diff),
        AgentOutput::Qa { verdict, tests, .. } => guard_qa(*verdict, tests),
        AgentOutput::Reviewer {
            verdict,
            risks,
            security_score,
            ..
        } => guard_reviewer(*verdict, risks, *security_score),
        AgentOutput::Pm { summary, .. } => guard_blacklist_only("summary", summary),
        AgentOutput::Generic { fields, .. } => fields
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k, s)))
            .flat_map(|(k, s)| guard_blacklist_only(k, s))
            .collect(),
    }
}

fn guard_blacklist_only(field: &str, text: &str) -> Vec<GuardViolation> {
    find_blacklisted_phrase(text)
        .map(|phrase| {
            vec![GuardViolation::new(
                ErrorCode::SemanticNull,
                field,
                format!("contains rubber-stamp phrase \"{phrase}\""),
            )]
        })
        .unwrap_or_default()
}

/// Heuristic check that `text` reads like a sentence rather than a single
/// bare token: at least `min_len` characters and more than one whitespace
/// separated word.
fn looks_like_a_sentence(text: &str, min_len: usize) -> bool {
    text.chars().count() >= min_len && text.split_whitespace().count() >= 2
}

const UNIFIED_DIFF_HEADERS: &[&str] = &["--- ", "+++ ", "diff --git ", "@@ "];

fn guard_coder(summary: &str, files_changed: &[String], diff: &str) -> Vec<GuardViolation> {
    let mut violations = Vec::new();

    if let Some(v) = guard_blacklist_only("summary", summary).into_iter().next() {
        violations.push(v);
    } else if !looks_like_a_sentence(summary, 10) {
        violations.push(GuardViolation::new(
            ErrorCode::FieldTooShort,
            "summary",
            "summary must be at least 10 characters and read as a sentence",
        ));
    }

    let diff_len = diff.chars().count();
    let has_diff_header = UNIFIED_DIFF_HEADERS.iter().any(|h| diff.contains(h));
    if diff_len < 20 || !has_diff_header {
        violations.push(GuardViolation::new(
            ErrorCode::FieldTooShort,
            "diff",
            "diff must be at least 20 characters and include a unified diff header",
        ));
    }

    if !diff.trim().is_empty() && files_changed.is_empty() {
        violations.push(GuardViolation::new(
            ErrorCode::SemanticNull,
            "files_changed",
            "files_changed must not be empty when diff is non-empty",
        ));
    }

    violations
}

fn guard_qa(verdict: QaVerdict, tests: &[String]) -> Vec<GuardViolation> {
    let mut violations = Vec::new();
    if matches!(verdict, QaVerdict::Pass) && tests.is_empty() {
        violations.push(GuardViolation::new(
            ErrorCode::SemanticNull,
            "tests",
            "tests must not be empty when verdict is PASS",
        ));
    }
    violations
}

fn guard_reviewer(verdict: Verdict, risks: &[String], security_score: u8) -> Vec<GuardViolation> {
    let mut violations = Vec::new();

    if security_score > 10 {
        violations.push(GuardViolation::new(
            ErrorCode::InvalidValue,
            "security_score",
            "security_score must be between 0 and 10",
        ));
    }

    if matches!(verdict, Verdict::Reject) && risks.is_empty() {
        violations.push(GuardViolation::new(
            ErrorCode::SemanticNull,
            "risks",
            "risks must not be empty when verdict is REJECT",
        ));
    }

    violations
}
