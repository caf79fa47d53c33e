//! AWS Sweep Binary
//!
//! Runs one recovery pass (stuck, then failed) and exits. Schedule it with
//! EventBridge or cron at the sweep interval.

use reelforge::adapters::aws::{DynamoStatusStore, SqsQueue};
use reelforge::application::sweep::RecoverySweep;
use reelforge::config::{AwsConfig, PipelineConfig};
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

    let sdk_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let sweep = RecoverySweep::new(
        Arc::new(SqsQueue::new(
            aws_sdk_sqs::Client::new(&sdk_config),
            aws.sqs_queue_url,
            pipeline.queue_lease,
        )),
        Arc::new(DynamoStatusStore::new(
            aws_sdk_dynamodb::Client::new(&sdk_config),
            aws.dynamodb_table,
        )),
        pipeline.sweep(),
    );

    match sweep.run_once().await {
        Ok(report) => {
            info!(
                scanned = report.scanned,
                expired = report.expired,
                requeued = report.requeued,
                exhausted = report.exhausted.len(),
                errors = report.errors,
                "sweep finished"
            );
            if report.errors > 0 {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            error!(error = %e, "sweep aborted");
            ExitCode::FAILURE
        }
    }
}
