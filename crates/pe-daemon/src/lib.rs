// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! HTTP dispatch service: the thin, stateless-per-request wrapper around a
//! [`pe_runtime::Engine`] that implements `GET /jobs/pull`, `POST
//! /jobs/push`, `POST /jobs/create`, `GET /jobs/status`, and `GET
//! /jobs/list` for out-of-process workers.
//!
//! A single [`tokio::sync::Mutex`] guards the engine's queue together with
//! the daemon's per-pipeline bookkeeping (the rework-round and
//! last-decision state [`pe_runtime::orchestrator::apply_pm_decision`]
//! needs but [`pe_runtime::Engine`] doesn't itself track), so a pull/push/
//! create sequence observes a consistent queue snapshot even under
//! concurrent callers.

pub mod api;
pub mod middleware;
pub mod validation;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    middleware::from_fn,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use pe_core::{Job, JobBuilder, JobMode, Pipeline, PipelineId, PipelineState, Role};
use pe_guard::guard_agent_output;
use pe_queue::RunQueue;
use pe_runtime::{apply_pm_decision, extract_agent_output, route_worker_verdict, worker_verdict, Engine, RouteOutcome};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

pub use api::{
    ApiError, CreateRequest, CreateResponse, ListQuery, PullQuery, PullResponse, PushRequest, PushResponse,
    StatusResponse,
};
pub use middleware::{request_id_middleware, CorsConfig, RateLimiter, RequestLogger};
pub use validation::RequestValidator;

/// Default sliding-window rate limit applied uniformly across `/jobs/*` —
/// generous enough for a tight worker poll loop, tight enough to catch a
/// misbehaving client hammering the queue.
const DEFAULT_RATE_LIMIT_REQUESTS: u32 = 600;
const DEFAULT_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// Per-pipeline state the dispatch API needs but [`Engine`] doesn't track
/// on its own: the decision machine's last action (for transition
/// validation) and the most recent non-PM job (the `RETRY` predecessor).
#[derive(Debug, Clone)]
struct PipelineRuntime {
    pipeline: Pipeline,
    last_action: Option<pe_core::DecisionAction>,
    predecessor: Option<pe_core::JobId>,
}

impl PipelineRuntime {
    fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            last_action: None,
            predecessor: None,
        }
    }
}

struct Dispatch {
    engine: Engine,
    pipelines: HashMap<PipelineId, PipelineRuntime>,
}

/// Shared daemon state, cloned cheaply into every handler via [`State`].
#[derive(Clone)]
pub struct AppState {
    dispatch: Arc<Mutex<Dispatch>>,
}

impl AppState {
    #[must_use]
    pub fn new(engine: Engine) -> Self {
        Self {
            dispatch: Arc::new(Mutex::new(Dispatch {
                engine,
                pipelines: HashMap::new(),
            })),
        }
    }
}

/// Build the Axum router with all dispatch routes and the shared
/// middleware stack (request id, structured access log, permissive CORS
/// for local tooling).
pub fn build_app(state: AppState) -> Router {
    let cors = CorsConfig::default().to_cors_layer();
    let rate_limiter = RateLimiter::new(DEFAULT_RATE_LIMIT_REQUESTS, DEFAULT_RATE_LIMIT_WINDOW).into_layer();

    Router::new()
        .route("/health", get(jobs_health))
        .route("/jobs/pull", get(jobs_pull))
        .route("/jobs/push", post(jobs_push))
        .route("/jobs/create", post(jobs_create))
        .route("/jobs/status", get(jobs_status))
        .route("/jobs/list", get(jobs_list))
        .layer(cors)
        .layer(from_fn(middleware::RequestLogger::layer))
        .layer(rate_limiter)
        .layer(from_fn(middleware::request_id_middleware))
        .with_state(state)
}

async fn jobs_health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "contract_version": pe_core::CONTRACT_VERSION,
        "time": Utc::now().to_rfc3339(),
    }))
}

async fn jobs_pull(State(state): State<AppState>, Query(q): Query<PullQuery>) -> Result<Response, ApiError> {
    let mut dispatch = state.dispatch.lock().await;
    let now = Utc::now();
    let Some(job) = dispatch.engine.queue.pull(q.role, q.mode, now) else {
        return Ok(StatusCode::NO_CONTENT.into_response());
    };

    let event = pe_eventlog::EventBuilder::new(job.pipeline_id, job.id, job.role, pe_core::EventType::Request)
        .content(job.payload.clone())
        .build();
    dispatch
        .engine
        .events
        .append(event)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    Ok(Json(PullResponse {
        job_id: job.id,
        pipeline_id: job.pipeline_id,
        payload: job.payload,
        context: job.context,
        lease_deadline: job.lease_deadline,
    })
    .into_response())
}

async fn jobs_push(
    State(state): State<AppState>,
    Json(req): Json<PushRequest>,
) -> Result<Json<PushResponse>, ApiError> {
    let mut dispatch = state.dispatch.lock().await;
    let now = Utc::now();

    let job: Job = dispatch
        .engine
        .queue
        .get(req.job_id)
        .cloned()
        .ok_or_else(|| ApiError::not_found(format!("job {} not found", req.job_id)))?;

    let succeeded = req.error.is_none();
    dispatch.engine.queue.push(req.job_id, succeeded, now)?;

    if !succeeded {
        if let Some(rt) = dispatch.pipelines.get_mut(&job.pipeline_id) {
            rt.pipeline.state = PipelineState::Escalated;
            rt.pipeline.updated_at = now;
        }
        info!(job_id = %job.id, error = ?req.error, "job pushed as failed");
        return Ok(Json(PushResponse { next_jobs: Vec::new() }));
    }

    let raw = req
        .result
        .ok_or_else(|| ApiError::invalid_request("result is required for a successful push"))?;
    let outcome = extract_agent_output(job.role, &raw)?;

    let violations = guard_agent_output(&outcome.output);
    if !violations.is_empty() {
        let details = json!(violations
            .iter()
            .map(|v| json!({"field": v.field, "message": v.message}))
            .collect::<Vec<_>>());
        return Err(
            ApiError::contract_violation(format!("{} semantic guard violation(s)", violations.len()))
                .with_details(details),
        );
    }

    let mut rt = dispatch
        .pipelines
        .remove(&job.pipeline_id)
        .ok_or_else(|| ApiError::internal(format!("pipeline {} has no tracked runtime state", job.pipeline_id)))?;

    let max_rework_rounds = dispatch.engine.config().max_rework_rounds;
    let route = match job.role {
        Role::Pm => {
            let decision = dispatch.engine.decisions.derive_decision(&outcome.output)?;
            let predecessor = rt.predecessor.and_then(|id| dispatch.engine.queue.get(id)).cloned();
            let route = apply_pm_decision(
                &mut dispatch.engine.queue,
                &mut rt.pipeline,
                &job,
                &decision,
                predecessor.as_ref(),
                rt.last_action,
                max_rework_rounds,
                now,
            )?;
            rt.last_action = Some(decision.action);
            route
        }
        Role::Coder | Role::Qa | Role::Reviewer => {
            let verdict = worker_verdict(&outcome.output);
            let route = route_worker_verdict(
                &mut dispatch.engine.queue,
                &mut rt.pipeline,
                &job,
                verdict,
                json!({}),
                max_rework_rounds,
                now,
            )?;
            rt.predecessor = Some(job.id);
            route
        }
        // Excavator/Strategist/Researcher/Analyst/Stamp/Council feed context
        // back to the PM rather than routing through the verdict table.
        _ => RouteOutcome::Scheduled(Vec::new()),
    };

    dispatch.pipelines.insert(job.pipeline_id, rt);

    let response_event =
        pe_eventlog::EventBuilder::new(job.pipeline_id, job.id, job.role, pe_core::EventType::Response)
            .content(serde_json::to_value(&outcome.output).unwrap_or(serde_json::Value::Null))
            .metadata_entry("degraded_parse", outcome.degraded_parse)
            .build();
    dispatch
        .engine
        .events
        .append(response_event)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    let next_jobs = match route {
        RouteOutcome::Scheduled(ids) => ids,
        RouteOutcome::Reworked(id) | RouteOutcome::Blocked(id) => vec![id],
        RouteOutcome::Escalated | RouteOutcome::Done => Vec::new(),
    };

    Ok(Json(PushResponse { next_jobs }))
}

async fn jobs_create(
    State(state): State<AppState>,
    Json(req): Json<CreateRequest>,
) -> Result<Json<CreateResponse>, ApiError> {
    RequestValidator::validate_payload(&req.payload).map_err(|errs| ApiError::invalid_request(errs.join("; ")))?;
    RequestValidator::validate_context(&req.context).map_err(|errs| ApiError::invalid_request(errs.join("; ")))?;

    let mut dispatch = state.dispatch.lock().await;
    let now = Utc::now();

    let pipeline_id = match req.parent_job_id {
        Some(parent_id) => dispatch
            .engine
            .queue
            .get(parent_id)
            .map(|j| j.pipeline_id)
            .ok_or_else(|| ApiError::not_found(format!("parent job {parent_id} not found")))?,
        None => {
            RequestValidator::validate_root_fields(&req.root_request, &req.session_id)
                .map_err(|errs| ApiError::invalid_request(errs.join("; ")))?;
            let id = Uuid::new_v4();
            let pipeline = Pipeline::new(
                id,
                req.root_request.clone().expect("validated above"),
                req.session_id.clone().expect("validated above"),
                now,
            );
            dispatch.pipelines.insert(id, PipelineRuntime::new(pipeline));
            id
        }
    };

    let sequence = sequence_for(&dispatch.engine.queue, pipeline_id, req.role, req.mode);
    let mut builder = JobBuilder::new(pipeline_id, req.role)
        .mode(req.mode)
        .payload(req.payload)
        .context(req.context)
        .sequence(sequence);
    if let Some(parent) = req.parent_job_id {
        builder = builder.parent(parent);
    }
    if let Some(priority) = req.priority {
        builder = builder.priority(priority);
    }
    let job_id = dispatch.engine.queue.create(builder.build(Uuid::new_v4(), now));

    Ok(Json(CreateResponse { job_id, pipeline_id }))
}

async fn jobs_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let dispatch = state.dispatch.lock().await;
    Json(dispatch.engine.queue.stats().into())
}

async fn jobs_list(State(state): State<AppState>, Query(q): Query<ListQuery>) -> Json<Vec<Job>> {
    let dispatch = state.dispatch.lock().await;
    Json(
        dispatch
            .engine
            .queue
            .list_for_pipeline(q.pipeline_id)
            .into_iter()
            .cloned()
            .collect(),
    )
}

/// Mirrors `pe_runtime::orchestrator`'s private successor-dedup counter —
/// that helper isn't exported, so `/jobs/create` derives the same sequence
/// number for a freshly created root job here.
fn sequence_for(queue: &RunQueue, pipeline_id: PipelineId, role: Role, mode: JobMode) -> u64 {
    queue
        .list_for_pipeline(pipeline_id)
        .iter()
        .filter(|j| j.role == role && j.mode == mode)
        .count() as u64
}
