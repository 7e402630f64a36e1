// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP dispatch API types: request/response envelopes and the structured
//! error body returned on failure.
//!
//! Status codes follow `pe-queue`'s own [`pe_queue::QueueError`] mapping:
//! 200 for data, 204 for an empty pull, 409 for a duplicate push, 410 for a
//! push against an expired lease, 422 for a contract violation or an
//! unknown/unleased job.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use pe_core::{JobId, JobMode, PipelineId, Priority, Role};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// GET /jobs/pull
// ---------------------------------------------------------------------------

/// Query parameters for `GET /jobs/pull`.
#[derive(Debug, Clone, Deserialize)]
pub struct PullQuery {
    pub role: Role,
    #[serde(default = "default_mode")]
    pub mode: JobMode,
}

fn default_mode() -> JobMode {
    JobMode::Worker
}

/// Response body for a successful `GET /jobs/pull` (204 on an empty queue).
#[derive(Debug, Clone, Serialize)]
pub struct PullResponse {
    pub job_id: JobId,
    pub pipeline_id: PipelineId,
    pub payload: Value,
    pub context: Value,
    pub lease_deadline: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// POST /jobs/push
// ---------------------------------------------------------------------------

/// Request body for `POST /jobs/push`. `result` carries the worker's raw
/// completion text, run through the output contract on the daemon side;
/// `error` marks the job as failed without a completion to parse.
#[derive(Debug, Clone, Deserialize)]
pub struct PushRequest {
    pub job_id: JobId,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Response body for `POST /jobs/push`.
#[derive(Debug, Clone, Serialize)]
pub struct PushResponse {
    pub next_jobs: Vec<JobId>,
}

// ---------------------------------------------------------------------------
// POST /jobs/create
// ---------------------------------------------------------------------------

/// Request body for `POST /jobs/create`.
///
/// A job with no `parent_job_id` starts a new pipeline; `root_request` and
/// `session_id` name that pipeline and are required in that case.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateRequest {
    pub role: Role,
    #[serde(default = "default_mode")]
    pub mode: JobMode,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub context: Value,
    #[serde(default)]
    pub parent_job_id: Option<JobId>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub root_request: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Response body for `POST /jobs/create`.
#[derive(Debug, Clone, Serialize)]
pub struct CreateResponse {
    pub job_id: JobId,
    pub pipeline_id: PipelineId,
}

// ---------------------------------------------------------------------------
// GET /jobs/status
// ---------------------------------------------------------------------------

/// Response body for `GET /jobs/status`, mirroring [`pe_queue::QueueStats`].
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub pending: usize,
    pub leased: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl From<pe_queue::QueueStats> for StatusResponse {
    fn from(stats: pe_queue::QueueStats) -> Self {
        Self {
            pending: stats.pending,
            leased: stats.leased,
            succeeded: stats.succeeded,
            failed: stats.failed,
            cancelled: stats.cancelled,
        }
    }
}

// ---------------------------------------------------------------------------
// GET /jobs/list
// ---------------------------------------------------------------------------

/// Query parameters for `GET /jobs/list`.
#[derive(Debug, Clone, Deserialize)]
pub struct ListQuery {
    pub pipeline_id: PipelineId,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Structured API error returned on failure, with a stable `code` callers
/// can match on independent of `message`'s wording.
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// 422 — the referenced job doesn't exist, or isn't currently leased.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", message)
    }

    /// 422 — the request body failed validation before reaching the queue.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new("invalid_request", message)
    }

    /// 422 — the worker's completion failed the output contract or guard.
    pub fn contract_violation(message: impl Into<String>) -> Self {
        Self::new("contract_violation", message)
    }

    /// 409 — the job was already pushed to a terminal state.
    pub fn already_finished(message: impl Into<String>) -> Self {
        Self::new("already_finished", message)
    }

    /// 410 — the job's lease expired and it was reaped before this push.
    pub fn lease_expired(message: impl Into<String>) -> Self {
        Self::new("lease_expired", message)
    }

    /// 500 — a wiring or invariant failure, not a caller mistake.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal_error", message)
    }

    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self.code.as_str() {
            "not_found" | "invalid_request" | "contract_violation" => StatusCode::UNPROCESSABLE_ENTITY,
            "already_finished" => StatusCode::CONFLICT,
            "lease_expired" => StatusCode::GONE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(self)).into_response()
    }
}

impl From<pe_queue::QueueError> for ApiError {
    fn from(err: pe_queue::QueueError) -> Self {
        match err {
            pe_queue::QueueError::NotFound(id) => Self::not_found(format!("job {id} not found")),
            pe_queue::QueueError::NotLeased(id) => Self::not_found(format!("job {id} is not currently leased")),
            pe_queue::QueueError::AlreadyFinished(id) => {
                Self::already_finished(format!("job {id} was already pushed to a terminal state"))
            }
            pe_queue::QueueError::LeaseExpired(id) => Self::lease_expired(format!("job {id}'s lease expired")),
        }
    }
}

impl From<pe_error::PeError> for ApiError {
    fn from(err: pe_error::PeError) -> Self {
        use pe_error::ErrorCategory;
        let message = err.to_string();
        match err.category() {
            ErrorCategory::Contract => Self::contract_violation(message),
            ErrorCategory::Structural => Self::invalid_request(message),
            ErrorCategory::Transient | ErrorCategory::Fatal => Self::internal(message),
        }
    }
}
