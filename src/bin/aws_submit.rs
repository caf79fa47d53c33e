//! AWS Submit Binary
//!
//! Registers an already-uploaded source object and enqueues its transcode.
//! Meant to be triggered once per upload (for example from an S3 event).
//!
//! Environment Variables:
//! - VIDEO_KEY: object key of the uploaded source
//! - VIDEO_ID: optional video id; generated when absent
//! - S3_BUCKET, S3_ENDPOINT, SQS_QUEUE_URL, DYNAMODB_TABLE: as for aws_worker

use reelforge::adapters::aws::{DynamoStatusStore, S3ObjectStore, SqsQueue};
use reelforge::application::intake::{IntakeService, SubmitRequest, SubmitSource};
use reelforge::config::{AwsConfig, PipelineConfig};
use reelforge::domain::jobs::SourceLocation;
use reelforge::telemetry;
use std::process::ExitCode;
use std::sync::Arc;
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
    let Some(video_key) = std::env::var("VIDEO_KEY").ok().filter(|k| !k.is_empty()) else {
        error!("VIDEO_KEY env var required");
        return ExitCode::FAILURE;
    };
    let video_id = std::env::var("VIDEO_ID").ok().filter(|id| !id.is_empty());

    let sdk_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let intake = IntakeService::new(
        Arc::new(SqsQueue::new(
            aws_sdk_sqs::Client::new(&sdk_config),
            aws.sqs_queue_url,
            pipeline.queue_lease,
        )),
        Arc::new(DynamoStatusStore::new(
            aws_sdk_dynamodb::Client::new(&sdk_config),
            aws.dynamodb_table,
        )),
        Arc::new(S3ObjectStore::new(
            S3ObjectStore::client_for(&sdk_config, aws.s3_endpoint.as_deref()),
            aws.s3_bucket,
        )),
        pipeline.enqueue_options(),
    );

    match intake
        .submit(SubmitRequest {
            video_id,
            source: SubmitSource::Existing(SourceLocation::ObjectKey(video_key.clone())),
        })
        .await
    {
        Ok(id) => {
            info!(video_id = %id, key = %video_key, "video submitted");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(key = %video_key, error = %e, "submit failed");
            ExitCode::FAILURE
        }
    }
}
