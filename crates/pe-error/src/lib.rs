// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

//! Unified error taxonomy for the pipeline engine.
//!
//! Every engine error carries an [`ErrorCode`] (a stable, machine-readable
//! tag), a human-readable message, an optional cause chain, and arbitrary
//! key-value context. The four [`ErrorCategory`] families mirror the
//! propagation rules of the error handling design: `Transient` errors are
//! retried within an attempt budget, `Contract` errors feed the escalator,
//! `Structural` errors are reported to the caller unretried, and `Fatal`
//! errors force a pipeline-level escalation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Broad family that an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Retried by the supervisor/queue within the attempt budget.
    Transient,
    /// Fed to the escalator as a contract violation.
    Contract,
    /// Reported to the caller, never retried.
    Structural,
    /// Forces pipeline-level escalation; no further scheduling.
    Fatal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::Contract => "contract",
            Self::Structural => "structural",
            Self::Fatal => "fatal",
        };
        write!(f, "{s}")
    }
}

/// Stable, machine-readable error code. Serialized in `SCREAMING_SNAKE_CASE`
/// so it can be matched on by external operators without relying on the
/// Rust type's variant names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // ── Transient ──────────────────────────────────────────────────────
    Timeout,
    ContextOverflow,
    BackendServerError,

    // ── Contract ───────────────────────────────────────────────────────
    JsonParse,
    FieldTooShort,
    InvalidValue,
    SemanticNull,

    // ── Structural ─────────────────────────────────────────────────────
    InvalidTransition,
    DuplicatePush,
    LeaseExpired,

    // ── Fatal ──────────────────────────────────────────────────────────
    HardFail,
    CeoRequired,

    /// Catch-all for conditions with no dedicated code yet.
    Internal,
}

impl ErrorCode {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Timeout | Self::ContextOverflow | Self::BackendServerError => {
                ErrorCategory::Transient
            }
            Self::JsonParse | Self::FieldTooShort | Self::InvalidValue | Self::SemanticNull => {
                ErrorCategory::Contract
            }
            Self::InvalidTransition | Self::DuplicatePush | Self::LeaseExpired => {
                ErrorCategory::Structural
            }
            Self::HardFail | Self::CeoRequired => ErrorCategory::Fatal,
            Self::Internal => ErrorCategory::Structural,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "TIMEOUT",
            Self::ContextOverflow => "CONTEXT_OVERFLOW",
            Self::BackendServerError => "BACKEND_SERVER_ERROR",
            Self::JsonParse => "JSON_PARSE",
            Self::FieldTooShort => "FIELD_TOO_SHORT",
            Self::InvalidValue => "INVALID_VALUE",
            Self::SemanticNull => "SEMANTIC_NULL",
            Self::InvalidTransition => "INVALID_TRANSITION",
            Self::DuplicatePush => "DUPLICATE_PUSH",
            Self::LeaseExpired => "LEASE_EXPIRED",
            Self::HardFail => "HARD_FAIL",
            Self::CeoRequired => "CEO_REQUIRED",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A classified engine error: a stable code, a message, optional structured
/// context, and an optional source error for chaining.
#[derive(Debug, Serialize, Deserialize)]
pub struct PeError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default)]
    pub context: BTreeMap<String, serde_json::Value>,
    #[serde(skip)]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl PeError {
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: BTreeMap::new(),
            source: None,
        }
    }

    /// Attach structured context. Silently dropped if `value` fails to
    /// serialize, since context is diagnostic, never load-bearing.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }
}

impl fmt::Display for PeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for PeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_mapping_matches_taxonomy() {
        assert_eq!(ErrorCode::Timeout.category(), ErrorCategory::Transient);
        assert_eq!(ErrorCode::JsonParse.category(), ErrorCategory::Contract);
        assert_eq!(
            ErrorCode::InvalidTransition.category(),
            ErrorCategory::Structural
        );
        assert_eq!(ErrorCode::HardFail.category(), ErrorCategory::Fatal);
    }

    #[test]
    fn display_includes_code_and_message() {
        let err = PeError::new(ErrorCode::SemanticNull, "vacuous response");
        let s = err.to_string();
        assert!(s.contains("SEMANTIC_NULL"));
        assert!(s.contains("vacuous response"));
    }

    #[test]
    fn serde_roundtrip_for_error_code() {
        for code in [
            ErrorCode::Timeout,
            ErrorCode::JsonParse,
            ErrorCode::InvalidTransition,
            ErrorCode::HardFail,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            let back: ErrorCode = serde_json::from_str(&json).unwrap();
            assert_eq!(back.as_str(), code.as_str());
        }
    }

    #[test]
    fn context_is_attached() {
        let err = PeError::new(ErrorCode::FieldTooShort, "too short").with_context("field", "summary");
        assert_eq!(
            err.context.get("field").and_then(|v| v.as_str()),
            Some("summary")
        );
    }
}
