// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
use anyhow::{Context, Result};
use clap::Parser;
use pe_daemon::{build_app, AppState};
use pe_runtime::{Engine, EngineConfig};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pe-daemon", version, about = "Pipeline engine dispatch service")]
struct Args {
    /// Bind address.
    #[arg(long, default_value = "127.0.0.1:8088")]
    bind: String,

    /// Root directory for the append-only event log.
    #[arg(long, default_value = ".pipeline-engine/events")]
    event_log_root: PathBuf,

    /// Maximum pull attempts before a job is treated as permanently failed.
    #[arg(long, default_value_t = 3)]
    max_attempts: u32,

    /// Lease time-to-live in seconds.
    #[arg(long, default_value_t = 300)]
    lease_ttl_secs: i64,

    /// Age at which a pending job's priority is bumped, in seconds.
    #[arg(long, default_value_t = 60)]
    age_threshold_secs: i64,

    /// Days a day-file stays live before archival.
    #[arg(long, default_value_t = 7)]
    archive_after_days: i64,

    /// Supervisor rewrite budget per worker job.
    #[arg(long, default_value_t = 3)]
    max_rewrites: u32,

    /// Orchestrator rework-round cap per role.
    #[arg(long, default_value_t = 2)]
    max_rework_rounds: u32,

    /// Enable debug-level logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("pe=debug,pe_daemon=debug,pe_runtime=debug")
    } else {
        EnvFilter::new("pe=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = EngineConfig {
        max_attempts: args.max_attempts,
        lease_ttl_secs: args.lease_ttl_secs,
        age_threshold_secs: args.age_threshold_secs,
        archive_after_days: args.archive_after_days,
        max_rewrites: args.max_rewrites,
        max_rework_rounds: args.max_rework_rounds,
        ..EngineConfig::default()
    };

    let engine = Engine::open(&args.event_log_root, config)
        .await
        .with_context(|| format!("open event log at {}", args.event_log_root.display()))?;

    let state = AppState::new(engine);
    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("bind {}", args.bind))?;
    info!(bind = %args.bind, "pe-daemon listening");

    axum::serve(listener, app).await.context("serve")
}
