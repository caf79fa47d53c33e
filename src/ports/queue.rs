use crate::domain::jobs::{JobPayload, VideoId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    /// Backend could not be reached or refused the write. Safe to retry.
    #[error("queue unavailable: {0}")]
    Unavailable(String),
    /// The job can never be accepted as given.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QueueError {
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Unavailable(_))
    }
}

/// Per-job delivery policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueOptions {
    pub max_attempts: u32,
    /// Delay before retry `n` is `backoff_base * 2^(n-1)`.
    pub backoff_base: Duration,
    pub retain_completed: bool,
    pub retain_failed: bool,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            retain_completed: false,
            retain_failed: true,
        }
    }
}

impl EnqueueOptions {
    /// Backoff after the `attempt`-th failed delivery (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        self.backoff_base.saturating_mul(1u32 << exp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// A job with this key is waiting, delayed, or leased. Nothing was
    /// written.
    AlreadyOutstanding,
}

/// One claimed job. The lease token ties later acks to this delivery; acks
/// carrying a superseded token are ignored by the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub video_id: VideoId,
    /// Raw payload, decoded by the worker.
    pub payload: String,
    /// 1-based delivery attempt.
    pub attempt: u32,
    pub max_attempts: u32,
    pub lease_token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    RetryScheduled { next_attempt: u32, delay: Duration },
    Exhausted { attempts: u32 },
    /// The delivery no longer holds the lease; nothing changed.
    LeaseLost,
}

/// Durable at-least-once work queue keyed by video id.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Returns once the backend acknowledged the write.
    async fn enqueue(
        &self,
        video_id: &VideoId,
        payload: &JobPayload,
        options: &EnqueueOptions,
    ) -> Result<EnqueueOutcome, QueueError>;

    /// Non-blocking. Promotes due retries before taking the next ready job.
    async fn claim(&self) -> Result<Option<Delivery>, QueueError>;

    /// Returns false when the lease was lost to another delivery.
    async fn extend_lease(&self, delivery: &Delivery) -> Result<bool, QueueError>;

    async fn complete(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// `permanent` skips any remaining attempts.
    async fn fail(
        &self,
        delivery: &Delivery,
        reason: &str,
        permanent: bool,
    ) -> Result<FailOutcome, QueueError>;
}

#[async_trait]
impl<T: JobQueue + ?Sized> JobQueue for Arc<T> {
    async fn enqueue(
        &self,
        video_id: &VideoId,
        payload: &JobPayload,
        options: &EnqueueOptions,
    ) -> Result<EnqueueOutcome, QueueError> {
        (**self).enqueue(video_id, payload, options).await
    }

    async fn claim(&self) -> Result<Option<Delivery>, QueueError> {
        (**self).claim().await
    }

    async fn extend_lease(&self, delivery: &Delivery) -> Result<bool, QueueError> {
        (**self).extend_lease(delivery).await
    }

    async fn complete(&self, delivery: &Delivery) -> Result<(), QueueError> {
        (**self).complete(delivery).await
    }

    async fn fail(
        &self,
        delivery: &Delivery,
        reason: &str,
        permanent: bool,
    ) -> Result<FailOutcome, QueueError> {
        (**self).fail(delivery, reason, permanent).await
    }
}

/// Validate a payload against the key it is enqueued under.
pub fn encode_for(video_id: &VideoId, payload: &JobPayload) -> Result<String, QueueError> {
    if payload.video_id() != video_id {
        return Err(QueueError::InvalidPayload(format!(
            "payload is for {} but enqueued as {}",
            payload.video_id(),
            video_id
        )));
    }
    payload
        .encode()
        .map_err(|e| QueueError::InvalidPayload(e.to_string()))
}
