// SPDX-License-Identifier: MIT OR Apache-2.0
//! Pipeline orchestrator: realize the decision machine's state graph over
//! concrete jobs, and route a finished worker's verdict to its successor.
//!
//! Two entry points. [`apply_pm_decision`] turns a PM's [`Decision`] into
//! queue mutations (dispatch successors, re-enqueue a predecessor, block
//! for PM attention, escalate, or finish). [`route_worker_verdict`] turns a
//! Coder/QA/Reviewer's finished output into the next job per the verdict
//! routing table, using the same rework machinery as a PM-declared `RETRY`.
//!
//! Successor creation always goes through [`RunQueue::create`], whose
//! dedup-on-`(pipeline_id, role, mode, sequence)` key already makes
//! duplicate pushes idempotent — nothing here re-implements that check.

use chrono::{DateTime, Utc};
use pe_core::{
    AgentOutput, Decision, DecisionAction, Job, JobBuilder, JobId, JobMode, Pipeline, PipelineState, QaVerdict, Role,
    Verdict,
};
use pe_error::{ErrorCode, PeError};
use pe_queue::RunQueue;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::decision::validate_transition;

/// The collapsed verdict a finished worker's output resolves to, once the
/// dual-engine supervisor has run its write/audit/stamp loop to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerVerdict {
    Approve,
    Revise,
    Reject,
}

/// What the orchestrator did in response to a decision or verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Successor jobs were scheduled; `None` entries mark dedup no-ops that
    /// reused an existing job id.
    Scheduled(Vec<JobId>),
    /// The predecessor was re-enqueued for a rework round.
    Reworked(JobId),
    /// `rework_rounds[role]` exceeded the cap; a PM job was created instead.
    Blocked(JobId),
    /// The pipeline was marked escalated; no further scheduling.
    Escalated,
    /// The pipeline was marked done.
    Done,
}

/// Apply a PM's normalized [`Decision`] to the queue and pipeline state.
/// `predecessor` is the most recent non-PM job in the pipeline, required
/// for `RETRY` and ignored otherwise.
pub fn apply_pm_decision(
    queue: &mut RunQueue,
    pipeline: &mut Pipeline,
    pm_job: &Job,
    decision: &Decision,
    predecessor: Option<&Job>,
    last_action: Option<DecisionAction>,
    max_rework_rounds: u32,
    now: DateTime<Utc>,
) -> Result<RouteOutcome, PeError> {
    validate_transition(last_action, decision.action)?;

    match decision.action {
        DecisionAction::Dispatch => {
            let mut created = Vec::with_capacity(decision.tasks.len());
            for task in &decision.tasks {
                let sequence = next_sequence(queue, pipeline.id, task.role, task.mode);
                let job = JobBuilder::new(pipeline.id, task.role)
                    .parent(pm_job.id)
                    .mode(task.mode)
                    .payload(task.payload.clone())
                    .context(task.context.clone())
                    .sequence(sequence)
                    .build(Uuid::new_v4(), now);
                created.push(queue.create(job));
            }
            Ok(RouteOutcome::Scheduled(created))
        }
        DecisionAction::Retry => {
            let predecessor = predecessor
                .ok_or_else(|| PeError::new(ErrorCode::Internal, "RETRY decision requires a predecessor job"))?;
            rework(
                queue,
                pipeline,
                predecessor,
                predecessor.role,
                json!({"note": decision.summary}),
                max_rework_rounds,
                now,
            )
        }
        DecisionAction::Blocked => Ok(block(queue, pipeline, pm_job, &decision.summary, now)),
        DecisionAction::Escalate => {
            pipeline.state = PipelineState::Escalated;
            pipeline.updated_at = now;
            Ok(RouteOutcome::Escalated)
        }
        DecisionAction::Done => {
            pipeline.state = PipelineState::Done;
            pipeline.updated_at = now;
            Ok(RouteOutcome::Done)
        }
    }
}

/// Route a finished Coder/QA/Reviewer job's collapsed verdict to its
/// successor per the routing table in §4.8. `notes` carries audit notes or
/// failing tests forward into a rework job's context.
pub fn route_worker_verdict(
    queue: &mut RunQueue,
    pipeline: &mut Pipeline,
    completed: &Job,
    verdict: WorkerVerdict,
    notes: Value,
    max_rework_rounds: u32,
    now: DateTime<Utc>,
) -> Result<RouteOutcome, PeError> {
    match (completed.role, verdict) {
        (Role::Coder, WorkerVerdict::Approve) => Ok(schedule_successor(queue, pipeline, completed, Role::Qa, now)),
        (Role::Coder, WorkerVerdict::Revise | WorkerVerdict::Reject) => {
            rework(queue, pipeline, completed, Role::Coder, notes, max_rework_rounds, now)
        }
        (Role::Qa, WorkerVerdict::Approve) => {
            Ok(schedule_successor(queue, pipeline, completed, Role::Reviewer, now))
        }
        (Role::Qa, WorkerVerdict::Revise | WorkerVerdict::Reject) => {
            rework(queue, pipeline, completed, Role::Coder, notes, max_rework_rounds, now)
        }
        (Role::Reviewer, WorkerVerdict::Approve) => {
            pipeline.state = PipelineState::Done;
            pipeline.updated_at = now;
            Ok(RouteOutcome::Done)
        }
        (Role::Reviewer, WorkerVerdict::Revise) => {
            rework(queue, pipeline, completed, Role::Coder, notes, max_rework_rounds, now)
        }
        (Role::Reviewer, WorkerVerdict::Reject) => {
            Ok(block(queue, pipeline, completed, "reviewer rejected the change", now))
        }
        (role, _) => Err(PeError::new(
            ErrorCode::Internal,
            format!("no verdict routing rule for role {role:?}"),
        )),
    }
}

/// Collapse a role's own declared output into the [`WorkerVerdict`] the
/// routing table keys on. Coder carries no verdict of its own — reaching
/// this function for a Coder output only happens once the dual-engine
/// supervisor's auditor has already approved it, so it always collapses to
/// `Approve` here.
#[must_use]
pub fn worker_verdict(output: &AgentOutput) -> WorkerVerdict {
    match output {
        AgentOutput::Qa {
            verdict: QaVerdict::Fail,
            ..
        } => WorkerVerdict::Revise,
        AgentOutput::Qa { .. } => WorkerVerdict::Approve,
        AgentOutput::Reviewer { verdict, .. } => collapse(*verdict),
        AgentOutput::Generic { verdict: Some(v), .. } => collapse(*v),
        _ => WorkerVerdict::Approve,
    }
}

fn collapse(verdict: Verdict) -> WorkerVerdict {
    match verdict {
        Verdict::Approve => WorkerVerdict::Approve,
        Verdict::Revise => WorkerVerdict::Revise,
        Verdict::Reject => WorkerVerdict::Reject,
    }
}

fn schedule_successor(
    queue: &mut RunQueue,
    pipeline: &Pipeline,
    predecessor: &Job,
    next_role: Role,
    now: DateTime<Utc>,
) -> RouteOutcome {
    let sequence = next_sequence(queue, pipeline.id, next_role, JobMode::Worker);
    let job = JobBuilder::new(pipeline.id, next_role)
        .parent(predecessor.id)
        .payload(predecessor.payload.clone())
        .context(predecessor.context.clone())
        .priority(predecessor.priority)
        .sequence(sequence)
        .build(Uuid::new_v4(), now);
    RouteOutcome::Scheduled(vec![queue.create(job)])
}

/// Re-enqueue `role`'s lineage with `notes` attached, incrementing
/// `pipeline.rework_rounds[role]`. Forces `BLOCKED` if that pushes the
/// round count over `max_rework_rounds`.
fn rework(
    queue: &mut RunQueue,
    pipeline: &mut Pipeline,
    predecessor: &Job,
    role: Role,
    notes: Value,
    max_rework_rounds: u32,
    now: DateTime<Utc>,
) -> Result<RouteOutcome, PeError> {
    let over_cap = pipeline.increment_rework(role, max_rework_rounds, now);
    if over_cap {
        return Ok(block(
            queue,
            pipeline,
            predecessor,
            &format!("{role:?} exceeded max rework rounds"),
            now,
        ));
    }

    let sequence = next_sequence(queue, pipeline.id, role, predecessor.mode);
    let job = JobBuilder::new(pipeline.id, role)
        .parent(predecessor.id)
        .mode(predecessor.mode)
        .payload(predecessor.payload.clone())
        .context(notes)
        .priority(predecessor.priority)
        .sequence(sequence)
        .build(Uuid::new_v4(), now);
    Ok(RouteOutcome::Reworked(queue.create(job)))
}

fn block(queue: &mut RunQueue, pipeline: &mut Pipeline, predecessor: &Job, reason: &str, now: DateTime<Utc>) -> RouteOutcome {
    pipeline.state = PipelineState::Blocked;
    pipeline.updated_at = now;

    let sequence = next_sequence(queue, pipeline.id, Role::Pm, JobMode::Worker);
    let job = JobBuilder::new(pipeline.id, Role::Pm)
        .parent(predecessor.id)
        .context(json!({"block_reason": reason}))
        .sequence(sequence)
        .build(Uuid::new_v4(), now);
    RouteOutcome::Blocked(queue.create(job))
}

fn next_sequence(queue: &RunQueue, pipeline_id: pe_core::PipelineId, role: Role, mode: JobMode) -> u64 {
    queue
        .list_for_pipeline(pipeline_id)
        .iter()
        .filter(|j| j.role == role && j.mode == mode)
        .count() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use pe_core::{JobState, Priority, TaskDescriptor};

    fn fresh_pipeline(now: DateTime<Utc>) -> Pipeline {
        Pipeline::new(Uuid::new_v4(), "implement fn x".into(), "session-1".into(), now)
    }

    fn pm_job(pipeline_id: pe_core::PipelineId, now: DateTime<Utc>) -> Job {
        JobBuilder::new(pipeline_id, Role::Pm).build(Uuid::new_v4(), now)
    }

    #[test]
    fn dispatch_creates_one_job_per_task() {
        let now = Utc::now();
        let mut queue = RunQueue::new(3, 300, 60);
        let mut pipeline = fresh_pipeline(now);
        let pm = pm_job(pipeline.id, now);

        let decision = Decision {
            action: DecisionAction::Dispatch,
            tasks: vec![TaskDescriptor {
                role: Role::Coder,
                mode: JobMode::Worker,
                payload: json!({"task": "implement"}),
                context: Value::Null,
            }],
            summary: "dispatching coder".into(),
            requires_escalation_reason: pe_core::EscalationReason::None,
            confidence: 1.0,
        };

        let outcome = apply_pm_decision(&mut queue, &mut pipeline, &pm, &decision, None, None, 2, now).unwrap();
        match outcome {
            RouteOutcome::Scheduled(ids) => assert_eq!(ids.len(), 1),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn coder_approve_routes_to_qa() {
        let now = Utc::now();
        let mut queue = RunQueue::new(3, 300, 60);
        let mut pipeline = fresh_pipeline(now);
        let coder_job = JobBuilder::new(pipeline.id, Role::Coder).build(Uuid::new_v4(), now);

        let outcome =
            route_worker_verdict(&mut queue, &mut pipeline, &coder_job, WorkerVerdict::Approve, Value::Null, 2, now)
                .unwrap();
        match outcome {
            RouteOutcome::Scheduled(ids) => {
                let job = queue.get(ids[0]).unwrap();
                assert_eq!(job.role, Role::Qa);
                assert_eq!(job.state, JobState::Pending);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn qa_fail_reworks_coder_with_notes() {
        let now = Utc::now();
        let mut queue = RunQueue::new(3, 300, 60);
        let mut pipeline = fresh_pipeline(now);
        let qa_job = JobBuilder::new(pipeline.id, Role::Qa).build(Uuid::new_v4(), now);

        let notes = json!({"failing_tests": ["test_a"]});
        let outcome =
            route_worker_verdict(&mut queue, &mut pipeline, &qa_job, WorkerVerdict::Revise, notes.clone(), 2, now)
                .unwrap();
        match outcome {
            RouteOutcome::Reworked(id) => {
                let job = queue.get(id).unwrap();
                assert_eq!(job.role, Role::Coder);
                assert_eq!(job.context, notes);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(pipeline.rework_rounds_for(Role::Coder), 1);
    }

    #[test]
    fn reviewer_approve_marks_pipeline_done() {
        let now = Utc::now();
        let mut queue = RunQueue::new(3, 300, 60);
        let mut pipeline = fresh_pipeline(now);
        let reviewer_job = JobBuilder::new(pipeline.id, Role::Reviewer).build(Uuid::new_v4(), now);

        let outcome = route_worker_verdict(
            &mut queue,
            &mut pipeline,
            &reviewer_job,
            WorkerVerdict::Approve,
            Value::Null,
            2,
            now,
        )
        .unwrap();
        assert_eq!(outcome, RouteOutcome::Done);
        assert_eq!(pipeline.state, PipelineState::Done);
    }

    #[test]
    fn reviewer_reject_blocks_with_pm_job() {
        let now = Utc::now();
        let mut queue = RunQueue::new(3, 300, 60);
        let mut pipeline = fresh_pipeline(now);
        let reviewer_job = JobBuilder::new(pipeline.id, Role::Reviewer).build(Uuid::new_v4(), now);

        let outcome = route_worker_verdict(
            &mut queue,
            &mut pipeline,
            &reviewer_job,
            WorkerVerdict::Reject,
            Value::Null,
            2,
            now,
        )
        .unwrap();
        match outcome {
            RouteOutcome::Blocked(id) => assert_eq!(queue.get(id).unwrap().role, Role::Pm),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(pipeline.state, PipelineState::Blocked);
    }

    #[test]
    fn exceeding_rework_cap_forces_blocked() {
        let now = Utc::now();
        let mut queue = RunQueue::new(3, 300, 60);
        let mut pipeline = fresh_pipeline(now);
        let coder_job = JobBuilder::new(pipeline.id, Role::Coder)
            .priority(Priority::Medium)
            .build(Uuid::new_v4(), now);

        for _ in 0..2 {
            route_worker_verdict(&mut queue, &mut pipeline, &coder_job, WorkerVerdict::Revise, Value::Null, 2, now)
                .unwrap();
        }
        let outcome =
            route_worker_verdict(&mut queue, &mut pipeline, &coder_job, WorkerVerdict::Revise, Value::Null, 2, now)
                .unwrap();
        assert!(matches!(outcome, RouteOutcome::Blocked(_)));
        assert_eq!(pipeline.state, PipelineState::Blocked);
    }

    #[test]
    fn worker_verdict_collapses_qa_fail_to_revise() {
        let output = AgentOutput::Qa {
            verdict: pe_core::QaVerdict::Fail,
            tests: vec![],
            coverage: None,
            issues: vec![],
        };
        assert_eq!(worker_verdict(&output), WorkerVerdict::Revise);
    }

    #[test]
    fn worker_verdict_passes_through_reviewer_reject() {
        let output = AgentOutput::Reviewer {
            verdict: pe_core::Verdict::Reject,
            risks: vec!["r".into()],
            security_score: 2,
            approved_files: vec![],
            blocked_files: vec![],
        };
        assert_eq!(worker_verdict(&output), WorkerVerdict::Reject);
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let now = Utc::now();
        let mut queue = RunQueue::new(3, 300, 60);
        let mut pipeline = fresh_pipeline(now);
        let pm = pm_job(pipeline.id, now);
        let decision = Decision {
            action: DecisionAction::Escalate,
            tasks: vec![],
            summary: "skip straight to escalate".into(),
            requires_escalation_reason: pe_core::EscalationReason::None,
            confidence: 1.0,
        };
        let err = apply_pm_decision(&mut queue, &mut pipeline, &pm, &decision, None, None, 2, now).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidTransition);
    }
}
