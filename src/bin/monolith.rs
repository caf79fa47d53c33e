//! Monolith Binary - Local deployment
//!
//! This is the main entry point for local development and single-server deployment.
//! It wires up:
//! - Local adapters (filesystem object store, Redis queue and status store)
//! - HTTP submit/poll API
//! - A supervisor keeping `WORKER_PROCESSES` worker processes alive
//! - The recovery sweep
//! - The scratch reaper for job directories and upload spools
//!
//! `monolith worker` runs a single worker process; the supervisor launches
//! those itself.

use axum::Router;
use reelforge::adapters::ffmpeg::FfmpegEncoder;
use reelforge::adapters::local::http::SPOOL_PREFIX;
use reelforge::adapters::local::{router, FsObjectStore, HttpState, RedisPool, RedisQueue};
use reelforge::application::intake::IntakeService;
use reelforge::application::orchestrator::{TranscodeOrchestrator, SCRATCH_PREFIX};
use reelforge::application::reaper::ScratchReaper;
use reelforge::application::supervisor::{ProcessLauncher, Supervisor};
use reelforge::application::sweep::RecoverySweep;
use reelforge::application::worker::WorkerService;
use reelforge::config::{LocalConfig, PipelineConfig};
use reelforge::telemetry;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    telemetry::init();

    let pipeline = match PipelineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    let local = LocalConfig::from_env();

    let pool = match RedisPool::new(&local.redis_url) {
        Ok(pool) => pool,
        Err(e) => {
            error!(error = %e, "failed to connect to Redis");
            return ExitCode::FAILURE;
        }
    };

    let result = if std::env::args().nth(1).as_deref() == Some("worker") {
        run_worker(pipeline, local, pool).await
    } else {
        run_server(pipeline, local, pool).await
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "monolith stopped with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run_worker(
    pipeline: PipelineConfig,
    local: LocalConfig,
    pool: RedisPool,
) -> Result<(), Box<dyn std::error::Error>> {
    let slot: usize = std::env::var("WORKER_SLOT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    let queue = RedisQueue::new(pool.clone(), pipeline.queue_lease);
    let orchestrator = TranscodeOrchestrator::new(
        FsObjectStore::new(&local.storage_dir),
        FfmpegEncoder::new(&pipeline.ffmpeg_bin, pipeline.hls_segment_secs),
        pipeline.orchestrator(),
    );
    let worker = Arc::new(WorkerService::new(
        Arc::new(queue),
        Arc::new(pool),
        Arc::new(orchestrator),
        pipeline.worker(),
    ));

    let w = worker.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            w.shutdown();
        }
    });

    worker.run_worker_loop(slot).await;
    Ok(())
}

async fn run_server(
    pipeline: PipelineConfig,
    local: LocalConfig,
    pool: RedisPool,
) -> Result<(), Box<dyn std::error::Error>> {
    // 1. Adapters (Local implementations)
    let queue = Arc::new(RedisQueue::new(pool.clone(), pipeline.queue_lease));
    let store = Arc::new(pool);
    let storage = Arc::new(FsObjectStore::new(&local.storage_dir));

    // 2. Application Services
    let intake = IntakeService::new(
        queue.clone(),
        store.clone(),
        storage,
        pipeline.enqueue_options(),
    );
    let sweep = RecoverySweep::new(queue, store, pipeline.sweep());
    // Worker processes share this host's scratch dir, so the server reaps for them.
    let spool_dir = pipeline.scratch_dir.join("spool");
    let reaper = ScratchReaper::new(pipeline.reaper())
        .watch(&pipeline.scratch_dir, SCRATCH_PREFIX)
        .watch(&spool_dir, SPOOL_PREFIX);
    let supervisor = Supervisor::new(
        ProcessLauncher::current_exe(vec!["worker".to_string()])?,
        pipeline.worker_processes,
        pipeline.restart_delay,
    );

    // 3. Background tasks
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor_task = {
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { supervisor.run(rx).await })
    };
    let sweep_task = {
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { sweep.run(rx).await })
    };
    let reaper_task = {
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { reaper.run(rx).await })
    };

    // 4. HTTP Layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let state = Arc::new(HttpState {
        intake,
        spool_dir,
    });
    let app: Router = router(state).layer(cors);

    // 5. Start Server
    let listener = tokio::net::TcpListener::bind(format!("{}:{}", local.addr, local.port)).await?;
    info!(addr = %local.addr, port = %local.port, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = supervisor_task.await;
    let _ = sweep_task.await;
    let _ = reaper_task.await;
    Ok(())
}
