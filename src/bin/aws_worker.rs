//! AWS Worker Binary
//!
//! Long-running worker (ECS task or Batch job) that:
//! 1. Connects to AWS services (S3 or R2, SQS, DynamoDB).
//! 2. Runs the WorkerService loop until SIGINT, then drains in-flight jobs.
//! 3. Reaps scratch directories left behind by earlier runs on this host.
//!
//! Environment Variables:
//! - AWS_REGION: AWS region (e.g., us-east-1)
//! - S3_BUCKET: bucket for uploads and published streams
//! - S3_ENDPOINT: optional S3-compatible endpoint (R2)
//! - SQS_QUEUE_URL: SQS FIFO queue URL for jobs
//! - DYNAMODB_TABLE: DynamoDB table for video state

use reelforge::adapters::aws::{DynamoStatusStore, S3ObjectStore, SqsQueue};
use reelforge::adapters::ffmpeg::FfmpegEncoder;
use reelforge::application::orchestrator::{TranscodeOrchestrator, SCRATCH_PREFIX};
use reelforge::application::reaper::ScratchReaper;
use reelforge::application::worker::WorkerService;
use reelforge::config::{AwsConfig, PipelineConfig};
use reelforge::telemetry;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    telemetry::init();

    let (pipeline, aws) = match (PipelineConfig::from_env(), AwsConfig::from_env()) {
        (Ok(pipeline), Ok(aws)) => (pipeline, aws),
        (Err(e), _) | (_, Err(e)) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    // Load AWS config
    let sdk_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;

    // Create adapters
    let storage = S3ObjectStore::new(
        S3ObjectStore::client_for(&sdk_config, aws.s3_endpoint.as_deref()),
        aws.s3_bucket,
    );
    let queue = SqsQueue::new(
        aws_sdk_sqs::Client::new(&sdk_config),
        aws.sqs_queue_url,
        pipeline.queue_lease,
    );
    let store = DynamoStatusStore::new(
        aws_sdk_dynamodb::Client::new(&sdk_config),
        aws.dynamodb_table,
    );
    let orchestrator = TranscodeOrchestrator::new(
        storage,
        FfmpegEncoder::new(&pipeline.ffmpeg_bin, pipeline.hls_segment_secs),
        pipeline.orchestrator(),
    );

    // Create and run Worker service
    let worker = Arc::new(WorkerService::new(
        Arc::new(queue),
        Arc::new(store),
        Arc::new(orchestrator),
        pipeline.worker(),
    ));

    let reaper = ScratchReaper::new(pipeline.reaper()).watch(&pipeline.scratch_dir, SCRATCH_PREFIX);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper_task = tokio::spawn(async move { reaper.run(shutdown_rx).await });

    let w = worker.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            w.shutdown();
        }
    });

    worker.run_worker_loop(0).await;
    let _ = shutdown_tx.send(true);
    let _ = reaper_task.await;
    ExitCode::SUCCESS
}
