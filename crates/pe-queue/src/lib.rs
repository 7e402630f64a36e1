// SPDX-License-Identifier: MIT OR Apache-2.0
//! Role/mode-keyed job queue: admission, lease-based pull/push, a reaper
//! for expired leases, and successor deduplication.
//!
//! This crate owns the in-process storage only. `pe-daemon` wraps it with
//! the HTTP pull/push contract; an embedder can also use [`RunQueue`]
//! directly without going through HTTP, per the resolved "both stay
//! available" design note.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use pe_core::{Job, JobId, JobMode, JobState, PipelineId, Role};

/// Errors raised by queue operations, each mapped to a specific HTTP status
/// by the daemon: [`QueueError::NotFound`]/[`QueueError::NotLeased`] → 422,
/// [`QueueError::AlreadyFinished`] → 409, [`QueueError::LeaseExpired`] → 410.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    NotFound(JobId),
    NotLeased(JobId),
    AlreadyFinished(JobId),
    LeaseExpired(JobId),
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "job {id} not found"),
            Self::NotLeased(id) => write!(f, "job {id} is not currently leased"),
            Self::AlreadyFinished(id) => write!(f, "job {id} already has a terminal result"),
            Self::LeaseExpired(id) => write!(f, "job {id}'s lease has expired"),
        }
    }
}

impl std::error::Error for QueueError {}

/// Snapshot of queue occupancy by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub leased: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// The result of a successful `push`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushOutcome {
    pub job_id: JobId,
    pub final_state: JobState,
}

/// Role/mode-keyed job store with lease semantics.
pub struct RunQueue {
    jobs: HashMap<JobId, Job>,
    dedup_index: HashMap<(PipelineId, Role, JobMode, u64), JobId>,
    max_attempts: u32,
    lease_ttl: Duration,
    age_threshold: Duration,
}

impl RunQueue {
    #[must_use]
    pub fn new(max_attempts: u32, lease_ttl_secs: i64, age_threshold_secs: i64) -> Self {
        Self {
            jobs: HashMap::new(),
            dedup_index: HashMap::new(),
            max_attempts,
            lease_ttl: Duration::seconds(lease_ttl_secs),
            age_threshold: Duration::seconds(age_threshold_secs),
        }
    }

    /// Admit a job. If a job with the same `(pipeline_id, role, mode,
    /// sequence)` successor key already exists, this is a no-op that
    /// returns the existing job's id — the at-least-once delivery
    /// guarantee in §4.6 requires successor creation be idempotent.
    pub fn create(&mut self, job: Job) -> JobId {
        let key = job.dedup_key();
        if let Some(existing) = self.dedup_index.get(&key) {
            return *existing;
        }
        let id = job.id;
        self.dedup_index.insert(key, id);
        self.jobs.insert(id, job);
        id
    }

    /// Atomically dequeue the highest-priority, oldest pending job for
    /// `(role, mode)` and transition it to `leased`.
    pub fn pull(&mut self, role: Role, mode: JobMode, now: DateTime<Utc>) -> Option<Job> {
        self.apply_aging(now);
        let candidate_id = self
            .jobs
            .values()
            .filter(|j| j.role == role && j.mode == mode && j.state == JobState::Pending)
            .max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| b.created_at.cmp(&a.created_at))
            })
            .map(|j| j.id)?;
        let job = self.jobs.get_mut(&candidate_id)?;
        job.state = JobState::Leased;
        job.leased_at = Some(now);
        job.lease_deadline = Some(now + self.lease_ttl);
        Some(job.clone())
    }

    /// Transition a leased job to its terminal result.
    pub fn push(&mut self, job_id: JobId, succeeded: bool, now: DateTime<Utc>) -> Result<PushOutcome, QueueError> {
        let job = self.jobs.get_mut(&job_id).ok_or(QueueError::NotFound(job_id))?;
        if job.state.is_terminal() {
            return Err(QueueError::AlreadyFinished(job_id));
        }
        if job.state != JobState::Leased {
            return Err(QueueError::NotLeased(job_id));
        }
        if let Some(deadline) = job.lease_deadline {
            if now > deadline {
                return Err(QueueError::LeaseExpired(job_id));
            }
        }
        job.state = if succeeded { JobState::Succeeded } else { JobState::Failed };
        job.finished_at = Some(now);
        Ok(PushOutcome {
            job_id,
            final_state: job.state,
        })
    }

    pub fn cancel(&mut self, job_id: JobId, now: DateTime<Utc>) -> Result<(), QueueError> {
        let job = self.jobs.get_mut(&job_id).ok_or(QueueError::NotFound(job_id))?;
        if job.state.is_terminal() {
            return Err(QueueError::AlreadyFinished(job_id));
        }
        job.state = JobState::Cancelled;
        job.finished_at = Some(now);
        Ok(())
    }

    /// Reclaim jobs whose lease has passed its deadline. Returns the ids of
    /// jobs that just hit `MAX_ATTEMPTS` and transitioned to `failed`
    /// (callers should escalate the owning pipeline for these).
    pub fn reap_expired(&mut self, now: DateTime<Utc>) -> Vec<JobId> {
        let mut hard_failed = Vec::new();
        for job in self.jobs.values_mut() {
            if job.state != JobState::Leased {
                continue;
            }
            let Some(deadline) = job.lease_deadline else { continue };
            if now <= deadline {
                continue;
            }
            job.attempt_count += 1;
            job.leased_at = None;
            job.lease_deadline = None;
            if job.attempt_count >= self.max_attempts {
                job.state = JobState::Failed;
                job.finished_at = Some(now);
                hard_failed.push(job.id);
            } else {
                job.state = JobState::Pending;
            }
        }
        hard_failed
    }

    fn apply_aging(&mut self, now: DateTime<Utc>) {
        for job in self.jobs.values_mut() {
            if job.state != JobState::Pending {
                continue;
            }
            if now - job.created_at >= self.age_threshold {
                job.priority = job.priority.bump();
            }
        }
    }

    #[must_use]
    pub fn get(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    #[must_use]
    pub fn list_for_pipeline(&self, pipeline_id: PipelineId) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self.jobs.values().filter(|j| j.pipeline_id == pipeline_id).collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats::default();
        for job in self.jobs.values() {
            match job.state {
                JobState::Pending => stats.pending += 1,
                JobState::Leased => stats.leased += 1,
                JobState::Succeeded => stats.succeeded += 1,
                JobState::Failed => stats.failed += 1,
                JobState::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
