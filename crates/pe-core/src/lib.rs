// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

//! Stable data model shared by every crate in the pipeline engine.
//!
//! This crate defines the wire- and log-level shape of a [`Job`], the
//! [`Pipeline`] that owns it, the append-only [`Event`] record, and the
//! typed [`AgentOutput`] a worker produces. Nothing here talks to a queue,
//! a backend, or the filesystem — those concerns live in `pe-queue`,
//! `pe-backend`, and `pe-eventlog` respectively, all built on these types.

pub mod config;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Contract version embedded in every [`Event`] and HTTP response so a
/// worker and the dispatch API can detect schema drift between them.
pub const CONTRACT_VERSION: &str = "pe/v0.1";

pub type JobId = Uuid;
pub type PipelineId = Uuid;
/// Monotonically increasing, totally ordered identifier for a log record.
pub type EventId = u64;

/// A registered persona role. Personas themselves are opaque prompt
/// bundles owned outside this crate; the role is the only part the
/// scheduler interprets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Pm,
    Excavator,
    Strategist,
    Coder,
    Qa,
    Reviewer,
    Researcher,
    Analyst,
    Stamp,
    Council,
}

impl Role {
    /// Roles a PM's `DISPATCH` decision is permitted to hand work to.
    #[must_use]
    pub fn allowed_from_pm() -> &'static [Role] {
        &[
            Role::Excavator,
            Role::Strategist,
            Role::Coder,
            Role::Qa,
            Role::Reviewer,
            Role::Researcher,
            Role::Analyst,
            Role::Council,
        ]
    }
}

/// Whether a job is produced for a primary worker attempt or a review pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    Worker,
    Reviewer,
}

/// Lifecycle state of a [`Job`]. `Succeeded`, `Failed`, and `Cancelled` are
/// terminal — no further transition is valid once reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Leased,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// Scheduling priority. Ordered so that `High > Medium > Low`, matching the
/// queue's `(priority, created_at)` FIFO tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    /// Priority one tier above this one, saturating at `High`. Used by the
    /// queue's aging rule to prevent starvation.
    #[must_use]
    pub fn bump(self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium | Self::High => Self::High,
        }
    }
}

/// The unit of scheduled work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub pipeline_id: PipelineId,
    pub parent_job_id: Option<JobId>,
    pub role: Role,
    pub mode: JobMode,
    pub state: JobState,
    /// Arbitrary input bytes, opaque to the scheduler.
    pub payload: Value,
    /// Free-form additional inputs (e.g. prior audit notes, failing tests).
    #[serde(default)]
    pub context: Value,
    pub priority: Priority,
    /// Position of this job within its `(pipeline_id, role, mode)` lineage;
    /// used for the successor dedup key in `(pipeline_id, role, mode, sequence)`.
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub leased_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub lease_deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempt_count: u32,
}

impl Job {
    /// Key used for successor deduplication per §4.8.
    #[must_use]
    pub fn dedup_key(&self) -> (PipelineId, Role, JobMode, u64) {
        (self.pipeline_id, self.role, self.mode, self.sequence)
    }
}

/// Builds a [`Job`] with the defaults a freshly created job should have.
#[derive(Debug, Clone)]
pub struct JobBuilder {
    pipeline_id: PipelineId,
    parent_job_id: Option<JobId>,
    role: Role,
    mode: JobMode,
    payload: Value,
    context: Value,
    priority: Priority,
    sequence: u64,
}

impl JobBuilder {
    #[must_use]
    pub fn new(pipeline_id: PipelineId, role: Role) -> Self {
        Self {
            pipeline_id,
            parent_job_id: None,
            role,
            mode: JobMode::Worker,
            payload: Value::Null,
            context: Value::Null,
            priority: Priority::Medium,
            sequence: 0,
        }
    }

    #[must_use]
    pub fn parent(mut self, parent_job_id: JobId) -> Self {
        self.parent_job_id = Some(parent_job_id);
        self
    }

    #[must_use]
    pub fn mode(mut self, mode: JobMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    #[must_use]
    pub fn context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    #[must_use]
    pub fn build(self, id: JobId, created_at: DateTime<Utc>) -> Job {
        Job {
            id,
            pipeline_id: self.pipeline_id,
            parent_job_id: self.parent_job_id,
            role: self.role,
            mode: self.mode,
            state: JobState::Pending,
            payload: self.payload,
            context: self.context,
            priority: self.priority,
            sequence: self.sequence,
            created_at,
            leased_at: None,
            finished_at: None,
            lease_deadline: None,
            attempt_count: 0,
        }
    }
}

/// The causal state of a [`Pipeline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Running,
    Blocked,
    Escalated,
    Done,
}

/// The causal thread of a single user request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: PipelineId,
    pub root_request: String,
    pub session_id: String,
    pub state: PipelineState,
    /// Number of rework cycles observed per role so far.
    #[serde(default)]
    pub rework_rounds: BTreeMap<Role, u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Pipeline {
    #[must_use]
    pub fn new(id: PipelineId, root_request: String, session_id: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            root_request,
            session_id,
            state: PipelineState::Running,
            rework_rounds: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn rework_rounds_for(&self, role: Role) -> u32 {
        self.rework_rounds.get(&role).copied().unwrap_or(0)
    }

    /// Increment the rework counter for `role`. Returns `true` if the
    /// counter now exceeds `max_rounds`, signalling a forced `BLOCKED`.
    pub fn increment_rework(&mut self, role: Role, max_rounds: u32, now: DateTime<Utc>) -> bool {
        let entry = self.rework_rounds.entry(role).or_insert(0);
        *entry += 1;
        self.updated_at = now;
        *entry > max_rounds
    }
}

/// Category of an [`Event`] record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Request,
    Response,
    Decision,
    State,
    Error,
}

/// An immutable log record. Once appended, an event is never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    #[serde(rename = "t")]
    pub timestamp: DateTime<Utc>,
    pub pipeline_id: PipelineId,
    pub job_id: JobId,
    pub from_role: Role,
    pub to_role: Option<Role>,
    pub event_type: EventType,
    pub parent_event_id: Option<EventId>,
    pub content: Value,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

/// Equivalence class of a worker/contract failure. Two failures collapse
/// into the same signature iff every field matches.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FailureSignature {
    pub error_kind: String,
    /// Sorted so that field-order differences never split a signature.
    pub missing_output_fields: Vec<String>,
    pub role: Role,
    pub prompt_hash: String,
}

impl FailureSignature {
    #[must_use]
    pub fn new(
        error_kind: impl Into<String>,
        mut missing_output_fields: Vec<String>,
        role: Role,
        prompt_hash: impl Into<String>,
    ) -> Self {
        missing_output_fields.sort();
        missing_output_fields.dedup();
        Self {
            error_kind: error_kind.into(),
            missing_output_fields,
            role,
            prompt_hash: prompt_hash.into(),
        }
    }
}

/// Monotone escalation class of a [`FailureSignature`]'s history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationLevel {
    SelfRepair,
    RoleSwitch,
    HardFail,
}

/// Per-signature failure counter and current escalation level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub count: u32,
    pub level: EscalationLevel,
    /// Alternate profiles already tried via role-switch for this signature,
    /// enforcing "at most once per profile".
    #[serde(default)]
    pub switched_profiles: Vec<String>,
}

impl Default for EscalationRecord {
    fn default() -> Self {
        Self {
            count: 0,
            level: EscalationLevel::SelfRepair,
            switched_profiles: Vec::new(),
        }
    }
}

/// The normalized decision-machine action a PM output resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionAction {
    Dispatch,
    Retry,
    Blocked,
    Escalate,
    Done,
}

/// A CEO-requires-attention category detected in a PM's summary/content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    Deploy,
    ApiKey,
    Payment,
    DataDelete,
    Dependency,
    Security,
    None,
}

/// One successor job requested by a PM's `DISPATCH` decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub role: Role,
    #[serde(default = "default_mode")]
    pub mode: JobMode,
    pub payload: Value,
    #[serde(default)]
    pub context: Value,
}

fn default_mode() -> JobMode {
    JobMode::Worker
}

/// Result of parsing a PM output through the output contract and decision
/// machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub action: DecisionAction,
    #[serde(default)]
    pub tasks: Vec<TaskDescriptor>,
    /// Log-only summary, truncated to 100 characters.
    pub summary: String,
    pub requires_escalation_reason: EscalationReason,
    /// Metadata-only confidence score; never gates scheduling.
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    1.0
}

impl Decision {
    /// Truncate `summary` to the 100-character log-only budget.
    pub fn clamp_summary(&mut self) {
        if self.summary.chars().count() > 100 {
            self.summary = self.summary.chars().take(100).collect();
        }
    }
}

/// A normalized verdict token. `PASS`/`FAIL` collapse into `Approve`/`Revise`
/// wherever a sub-agent's raw verdict is compared against this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Approve,
    Revise,
    Reject,
}

impl Verdict {
    /// Normalize a raw verdict token per §4.2: `{APPROVE, SHIP, DONE, PASS}`
    /// collapse to `Approve`; `{REVISE, HOLD, NEED_INFO, FAIL}` collapse to
    /// `Revise`; a bare `REJECT` maps to `Reject`.
    #[must_use]
    pub fn normalize(token: &str) -> Option<Self> {
        match token.to_ascii_uppercase().as_str() {
            "APPROVE" | "SHIP" | "DONE" | "PASS" => Some(Self::Approve),
            "REVISE" | "HOLD" | "NEED_INFO" | "FAIL" => Some(Self::Revise),
            "REJECT" => Some(Self::Reject),
            _ => None,
        }
    }
}

/// QA's own three-way verdict (`SKIP` has no equivalent in [`Verdict`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QaVerdict {
    Pass,
    Fail,
    Skip,
}

/// Role-specific typed result produced by the output contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum AgentOutput {
    Pm {
        action: DecisionAction,
        #[serde(default)]
        tasks: Vec<TaskDescriptor>,
        summary: String,
        #[serde(default)]
        requires_escalation_reason: Option<EscalationReason>,
    },
    Coder {
        summary: String,
        #[serde(default)]
        files_changed: Vec<String>,
        diff: String,
        #[serde(default)]
        todo_next: Vec<String>,
    },
    Qa {
        verdict: QaVerdict,
        #[serde(default)]
        tests: Vec<String>,
        coverage: Option<f64>,
        #[serde(default)]
        issues: Vec<String>,
    },
    Reviewer {
        verdict: Verdict,
        #[serde(default)]
        risks: Vec<String>,
        security_score: u8,
        #[serde(default)]
        approved_files: Vec<String>,
        #[serde(default)]
        blocked_files: Vec<String>,
    },
    /// Roles with no dedicated schema (researcher, analyst, stamp, council)
    /// still carry a normalized verdict when present plus their raw fields.
    Generic {
        verdict: Option<Verdict>,
        #[serde(default)]
        fields: BTreeMap<String, Value>,
    },
}

impl AgentOutput {
    #[must_use]
    pub fn role(&self) -> Role {
        match self {
            Self::Pm { .. } => Role::Pm,
            Self::Coder { .. } => Role::Coder,
            Self::Qa { .. } => Role::Qa,
            Self::Reviewer { .. } => Role::Reviewer,
            Self::Generic { .. } => Role::Analyst,
        }
    }
}

/// Errors raised by canonicalization helpers.
#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    #[error("json serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serialize `value` with sorted object keys so identical logical content
/// always produces identical bytes, independent of struct field order.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, ContractError> {
    let raw = serde_json::to_value(value)?;
    let sorted = sort_value(raw);
    Ok(serde_json::to_string(&sorted)?)
}

fn sort_value(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: BTreeMap<String, Value> = BTreeMap::new();
            for (k, v) in map {
                sorted.insert(k, sort_value(v));
            }
            serde_json::to_value(sorted).unwrap_or(Value::Null)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_value).collect()),
        other => other,
    }
}

/// Hex-encoded SHA-256 digest of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Canonical hash of any serializable value, used to key
/// [`FailureSignature::prompt_hash`] and to fingerprint an [`AgentOutput`]
/// for dedup comparisons.
pub fn content_hash<T: Serialize>(value: &T) -> Result<String, ContractError> {
    Ok(sha256_hex(canonical_json(value)?.as_bytes()))
}
