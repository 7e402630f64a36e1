// SPDX-License-Identifier: MIT OR Apache-2.0
//! pe-runtime
//!
//! The pipeline scheduler and execution engine: wires the job queue, event
//! log, escalator, decision machine, and backend registry into the
//! dual-engine supervisor loop and the orchestrator's routing rules.
//!
//! Responsibilities:
//! - hold the durable-enough-for-a-process job queue and event log
//! - run a worker job through write/contract/guard/audit/stamp
//! - derive and apply PM decisions, and route worker verdicts to successors
//! - track per-signature escalation history and per-pipeline cancellation

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Cancellation primitives for pipeline execution.
pub mod cancel;
/// Output contract: raw completion to typed [`pe_core::AgentOutput`].
pub mod contract;
/// Decision machine: PM decision derivation and transition validation.
pub mod decision;
/// Pipeline orchestrator: decision/verdict routing over the job queue.
pub mod orchestrator;
/// Backend registry for named writer/auditor/stamp adapter lookup.
pub mod registry;
/// Retry policies and timeout configuration for resilient backend calls.
pub mod retry;
/// Dual-engine supervisor: the write/contract/guard/audit/stamp loop.
pub mod supervisor;

use std::path::Path;

use pe_escalate::Escalator;
use pe_eventlog::{EventLog, EventLogError};
use pe_queue::RunQueue;

pub use cancel::{CancellableRun, CancellationReason, CancellationToken, PipelineCancellations};
pub use contract::{extract_agent_output, ContractOutcome};
pub use decision::DecisionMachine;
pub use orchestrator::{apply_pm_decision, route_worker_verdict, worker_verdict, RouteOutcome, WorkerVerdict};
pub use registry::BackendRegistry;
pub use retry::{retry_async, RetryOutcome, RetryPolicy, RetryPolicyBuilder, TimeoutConfig};
pub use supervisor::{Supervisor, SupervisorOutcome};

/// Tunables for an [`Engine`], mirroring the configuration surface
/// described for the dispatch service: queue lease/aging behavior, event
/// log retention, the supervisor's rewrite budget, and the orchestrator's
/// rework-round cap.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum pull attempts before a job is treated as permanently failed.
    pub max_attempts: u32,
    /// How long a pulled job's lease is held before it's eligible for reap.
    pub lease_ttl_secs: i64,
    /// Age at which a pending job's priority is bumped to avoid starvation.
    pub age_threshold_secs: i64,
    /// Days a day-file stays in the live event log directory before archival.
    pub archive_after_days: i64,
    /// Escalator's minimum signature capacity (`pe-escalate::MIN_CAPACITY` floor applies).
    pub escalator_capacity: usize,
    /// `MAX_REWRITES` — supervisor rewrite attempts before a worker job blocks.
    pub max_rewrites: u32,
    /// `MAX_REWORK_ROUNDS` — orchestrator rework rounds per role before blocking.
    pub max_rework_rounds: u32,
    /// Backend call retry policy.
    pub retry_policy: RetryPolicy,
    /// Backend call timeout configuration.
    pub timeouts: TimeoutConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            lease_ttl_secs: 300,
            age_threshold_secs: 60,
            archive_after_days: 30,
            escalator_capacity: pe_escalate::MIN_CAPACITY,
            max_rewrites: 3,
            max_rework_rounds: 3,
            retry_policy: RetryPolicy::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

/// Top-level facade tying the queue, event log, escalator, decision
/// machine, backend registry, and cancellation map together.
///
/// Holds no backends by default — register writer/auditor/stamp adapters
/// via [`Engine::registry_mut`] before running a [`Supervisor`] loop.
pub struct Engine {
    /// Job queue: pull/push/cancel/reap over pending and leased jobs.
    pub queue: RunQueue,
    /// Append-only day-keyed event log.
    pub events: EventLog,
    /// Per-failure-signature escalation ladder.
    pub escalator: Escalator,
    /// Named writer/auditor/stamp backend adapters.
    pub backends: BackendRegistry,
    /// Per-pipeline cancellation tokens.
    pub cancellations: PipelineCancellations,
    /// CEO-requires-keyword detection and PM decision normalization.
    pub decisions: DecisionMachine,
    /// Write/contract/guard/audit/stamp loop driver.
    pub supervisor: Supervisor,
    config: EngineConfig,
}

impl Engine {
    /// Open an engine rooted at `event_log_root` (the event log's on-disk
    /// home; the queue and escalator are in-memory for the life of the
    /// process per the best-effort persistence note in the design).
    ///
    /// # Errors
    ///
    /// Returns an [`EventLogError`] if the event log's directories cannot
    /// be created or its existing day-files fail to hydrate.
    pub async fn open(event_log_root: impl AsRef<Path>, config: EngineConfig) -> Result<Self, EventLogError> {
        let events = EventLog::open(event_log_root.as_ref().to_path_buf(), config.archive_after_days).await?;
        let queue = RunQueue::new(config.max_attempts, config.lease_ttl_secs, config.age_threshold_secs);
        let escalator = Escalator::new(config.escalator_capacity);
        let supervisor = Supervisor::new(config.max_rewrites, config.retry_policy.clone(), config.timeouts.clone());

        Ok(Self {
            queue,
            events,
            escalator,
            backends: BackendRegistry::default(),
            cancellations: PipelineCancellations::new(),
            decisions: DecisionMachine::new(),
            supervisor,
            config,
        })
    }

    /// The configuration this engine was opened with.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Mutable access to the backend registry, for wiring writer/auditor/stamp adapters.
    pub fn registry_mut(&mut self) -> &mut BackendRegistry {
        &mut self.backends
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_creates_an_empty_engine() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(dir.path(), EngineConfig::default()).await.unwrap();
        assert!(engine.queue.is_empty());
        assert!(engine.escalator.is_empty());
        assert!(engine.backends.list().is_empty());
    }

    #[tokio::test]
    async fn config_default_matches_documented_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(dir.path(), EngineConfig::default()).await.unwrap();
        assert_eq!(engine.config().max_rewrites, 3);
        assert_eq!(engine.config().max_rework_rounds, 3);
    }

    #[tokio::test]
    async fn reopening_the_same_root_reuses_event_ids() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = Engine::open(dir.path(), EngineConfig::default()).await.unwrap();
            let builder = pe_eventlog::EventBuilder::new(
                uuid::Uuid::new_v4(),
                uuid::Uuid::new_v4(),
                pe_core::Role::Pm,
                pe_core::EventType::Request,
            );
            engine.events.append(builder.build()).await.unwrap();
        }
        let reopened = Engine::open(dir.path(), EngineConfig::default()).await.unwrap();
        let builder = pe_eventlog::EventBuilder::new(
            uuid::Uuid::new_v4(),
            uuid::Uuid::new_v4(),
            pe_core::Role::Pm,
            pe_core::EventType::Response,
        );
        let id = reopened.events.append(builder.build()).await.unwrap();
        assert_eq!(id, 2);
    }
}
