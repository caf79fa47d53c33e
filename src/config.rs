//! Configuration for different deployment environments.

use crate::application::orchestrator::OrchestratorConfig;
use crate::application::reaper::ReaperConfig;
use crate::application::sweep::SweepConfig;
use crate::application::worker::WorkerConfig;
use crate::ports::queue::EnqueueOptions;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} env var required")]
    Missing { name: &'static str },
    #[error("{name}={value:?} is not a valid value")]
    Invalid { name: &'static str, value: String },
}

fn var(name: &'static str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[cfg_attr(not(feature = "aws"), allow(dead_code))]
fn required(name: &'static str) -> Result<String, ConfigError> {
    var(name).ok_or(ConfigError::Missing { name })
}

fn parsed<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match var(name) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}

fn flag(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match var(name) {
        None => Ok(default),
        Some(value) => {
            let normalized = value.trim().to_ascii_lowercase();
            match normalized.as_str() {
                "1" | "true" | "yes" => Ok(true),
                "0" | "false" | "no" => Ok(false),
                _ => Err(ConfigError::Invalid { name, value }),
            }
        }
    }
}

fn secs(name: &'static str, default: u64) -> Result<Duration, ConfigError> {
    parsed(name, default).map(Duration::from_secs)
}

fn millis(name: &'static str, default: u64) -> Result<Duration, ConfigError> {
    parsed(name, default).map(Duration::from_millis)
}

/// Pipeline tuning shared by every deployment.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Worker OS processes kept alive by the supervisor
    pub worker_processes: usize,
    /// Jobs in flight per worker process
    pub worker_concurrency: usize,
    pub fanout_timeout: Duration,
    pub stale_after: Duration,
    pub failed_sweep_interval: Duration,
    pub stuck_sweep_interval: Duration,
    pub max_recoveries: u32,
    pub queue_max_attempts: u32,
    pub queue_backoff_base: Duration,
    pub queue_retain_completed: bool,
    pub queue_retain_failed: bool,
    pub queue_poll_interval: Duration,
    pub queue_lease: Duration,
    pub scratch_dir: PathBuf,
    /// Scratch entries older than this are treated as abandoned
    pub scratch_max_age: Duration,
    pub scratch_reap_interval: Duration,
    pub ffmpeg_bin: PathBuf,
    pub hls_segment_secs: u32,
    pub upload_concurrency: usize,
    pub restart_delay: Duration,
}

impl PipelineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Ok(Self {
            worker_processes: parsed("WORKER_PROCESSES", cpus)?,
            worker_concurrency: parsed("WORKER_CONCURRENCY", 2)?,
            fanout_timeout: secs("FANOUT_TIMEOUT_SECS", 30 * 60)?,
            stale_after: secs("STALE_AFTER_SECS", 30 * 60)?,
            failed_sweep_interval: secs("FAILED_SWEEP_INTERVAL_SECS", 60 * 60)?,
            stuck_sweep_interval: secs("STUCK_SWEEP_INTERVAL_SECS", 30 * 60)?,
            max_recoveries: parsed("MAX_RECOVERIES", 3)?,
            queue_max_attempts: parsed("QUEUE_MAX_ATTEMPTS", 3)?,
            queue_backoff_base: millis("QUEUE_BACKOFF_BASE_MS", 1000)?,
            queue_retain_completed: flag("QUEUE_RETAIN_COMPLETED", false)?,
            queue_retain_failed: flag("QUEUE_RETAIN_FAILED", true)?,
            queue_poll_interval: millis("QUEUE_POLL_INTERVAL_MS", 1000)?,
            queue_lease: secs("QUEUE_LEASE_SECS", 60)?,
            scratch_dir: var("SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(env::temp_dir),
            scratch_max_age: secs("SCRATCH_MAX_AGE_SECS", 24 * 60 * 60)?,
            scratch_reap_interval: secs("SCRATCH_REAP_INTERVAL_SECS", 60 * 60)?,
            ffmpeg_bin: var("FFMPEG_BIN")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("ffmpeg")),
            hls_segment_secs: parsed("HLS_SEGMENT_SECS", 6)?,
            upload_concurrency: parsed("UPLOAD_CONCURRENCY", 8)?,
            restart_delay: millis("RESTART_DELAY_MS", 500)?,
        })
    }

    pub fn enqueue_options(&self) -> EnqueueOptions {
        EnqueueOptions {
            max_attempts: self.queue_max_attempts.max(1),
            backoff_base: self.queue_backoff_base,
            retain_completed: self.queue_retain_completed,
            retain_failed: self.queue_retain_failed,
        }
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            scratch_root: self.scratch_dir.clone(),
            fanout_timeout: self.fanout_timeout,
            upload_concurrency: self.upload_concurrency.max(1),
        }
    }

    pub fn reaper(&self) -> ReaperConfig {
        ReaperConfig {
            max_age: self.scratch_max_age,
            interval: self.scratch_reap_interval,
        }
    }

    pub fn worker(&self) -> WorkerConfig {
        WorkerConfig {
            concurrency: self.worker_concurrency.max(1),
            poll_interval: self.queue_poll_interval,
            lease: self.queue_lease,
            drain_timeout: self.fanout_timeout,
        }
    }

    pub fn sweep(&self) -> SweepConfig {
        SweepConfig {
            failed_interval: self.failed_sweep_interval,
            stuck_interval: self.stuck_sweep_interval,
            stale_after: self.stale_after,
            max_recoveries: self.max_recoveries,
            enqueue: self.enqueue_options(),
        }
    }
}

/// Configuration for local/monolith deployment.
#[cfg(feature = "local")]
#[derive(Clone, Debug)]
pub struct LocalConfig {
    /// HTTP server bind address
    pub addr: String,
    /// HTTP server port
    pub port: String,
    /// Redis connection URL
    pub redis_url: String,
    /// Root of the filesystem object store
    pub storage_dir: PathBuf,
}

#[cfg(feature = "local")]
impl LocalConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        Self {
            addr: var("ADDR").unwrap_or_else(|| String::from("127.0.0.1")),
            port: var("PORT").unwrap_or_else(|| String::from("3000")),
            redis_url: var("REDIS_URL").unwrap_or_else(|| String::from("redis://127.0.0.1/")),
            storage_dir: var("STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./storage")),
        }
    }
}

/// Configuration for AWS deployment.
#[cfg(feature = "aws")]
#[derive(Clone, Debug)]
pub struct AwsConfig {
    /// Bucket holding uploads and published streams
    pub s3_bucket: String,
    /// Custom endpoint for S3-compatible stores such as R2
    pub s3_endpoint: Option<String>,
    /// SQS FIFO queue URL for job messages
    pub sqs_queue_url: String,
    /// DynamoDB table name for video state
    pub dynamodb_table: String,
}

#[cfg(feature = "aws")]
impl AwsConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        Ok(Self {
            s3_bucket: required("S3_BUCKET")?,
            s3_endpoint: var("S3_ENDPOINT"),
            sqs_queue_url: required("SQS_QUEUE_URL")?,
            dynamodb_table: required("DYNAMODB_TABLE")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env vars are process-global; each test uses names no other test touches.

    #[test]
    fn test_parsed_default_and_override() {
        env::remove_var("TEST_CFG_PARSED");
        assert_eq!(parsed("TEST_CFG_PARSED", 7u32), Ok(7));
        env::set_var("TEST_CFG_PARSED", " 12 ");
        assert_eq!(parsed("TEST_CFG_PARSED", 7u32), Ok(12));
        env::set_var("TEST_CFG_PARSED", "twelve");
        assert_eq!(
            parsed("TEST_CFG_PARSED", 7u32),
            Err(ConfigError::Invalid {
                name: "TEST_CFG_PARSED",
                value: "twelve".into()
            })
        );
    }

    #[test]
    fn test_flag_values() {
        env::set_var("TEST_CFG_FLAG", "TRUE");
        assert_eq!(flag("TEST_CFG_FLAG", false), Ok(true));
        env::set_var("TEST_CFG_FLAG", "no");
        assert_eq!(flag("TEST_CFG_FLAG", true), Ok(false));
        env::set_var("TEST_CFG_FLAG", "maybe");
        assert!(flag("TEST_CFG_FLAG", true).is_err());
    }

    #[test]
    fn test_required_rejects_blank() {
        env::set_var("TEST_CFG_REQUIRED", "  ");
        assert_eq!(
            required("TEST_CFG_REQUIRED"),
            Err(ConfigError::Missing {
                name: "TEST_CFG_REQUIRED"
            })
        );
    }

    #[test]
    fn test_pipeline_defaults() {
        let config = PipelineConfig::from_env().unwrap();
        let options = config.enqueue_options();
        assert!(options.max_attempts >= 1);
        assert!(config.worker().concurrency >= 1);
        assert_eq!(config.sweep().max_recoveries, config.max_recoveries);
        assert_eq!(config.reaper().max_age, config.scratch_max_age);
    }
}
