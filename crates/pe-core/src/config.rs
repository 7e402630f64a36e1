// SPDX-License-Identifier: MIT OR Apache-2.0
//! Engine-wide tunables and validation of admission requests.

use crate::{JobMode, Role};

/// Severity level for a configuration warning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarningSeverity {
    Info,
    Warning,
    Error,
}

/// A single configuration warning produced by [`RequestValidator`].
#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
}

/// The recognized engine options from §6, with their documented defaults.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineConfig {
    /// Per-role rework cap before a pipeline is forced `BLOCKED`.
    pub max_rework_rounds: u32,
    /// Auditor loop cap inside the supervisor.
    pub max_rewrites: u32,
    /// Lease lifetime, in seconds, before the reaper reclaims a job.
    pub lease_ttl_secs: i64,
    /// Attempts before a job transitions to `failed` and escalates.
    pub max_attempts: u32,
    /// Seconds a job may sit pending before its priority is bumped.
    pub age_threshold_secs: i64,
    /// Per-backend-call timeout, in seconds.
    pub backend_timeout_secs: i64,
    /// Days before an event log file is migrated to the archive subtree.
    pub archive_after_days: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_rework_rounds: 2,
            max_rewrites: 3,
            lease_ttl_secs: 5 * 60,
            max_attempts: 3,
            age_threshold_secs: 60,
            backend_timeout_secs: 5 * 60,
            archive_after_days: 7,
        }
    }
}

/// Validates job-admission requests (`POST /jobs/create`, `/jobs/push`)
/// before they reach the queue.
#[derive(Debug, Default)]
pub struct RequestValidator;

/// Payload shape accepted for admission validation, independent of the
/// wire encoding used by a particular transport.
pub struct AdmissionRequest<'a> {
    pub role: Role,
    pub mode: JobMode,
    pub payload: &'a serde_json::Value,
}

impl RequestValidator {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Validate an admission request and return all detected warnings.
    /// Any [`WarningSeverity::Error`] warning means the request must be
    /// rejected with `422`.
    #[must_use]
    pub fn validate_admission(&self, req: &AdmissionRequest<'_>) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if req.payload.is_null() {
            warnings.push(ConfigWarning {
                field: "payload".into(),
                message: "payload must not be null".into(),
                severity: WarningSeverity::Error,
            });
        }

        if req.role == Role::Pm && req.mode == JobMode::Reviewer {
            warnings.push(ConfigWarning {
                field: "mode".into(),
                message: "pm role has no reviewer mode".into(),
                severity: WarningSeverity::Warning,
            });
        }

        warnings
    }

    /// `true` if any warning in `warnings` is an [`WarningSeverity::Error`].
    #[must_use]
    pub fn has_errors(warnings: &[ConfigWarning]) -> bool {
        warnings.iter().any(|w| w.severity == WarningSeverity::Error)
    }
}
