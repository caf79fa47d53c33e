use crate::domain::jobs::{JobPayload, VideoId};
use crate::ports::queue::{
    encode_for, Delivery, EnqueueOptions, EnqueueOutcome, FailOutcome, JobQueue, QueueError,
};
use async_trait::async_trait;
use aws_sdk_sqs::types::MessageSystemAttributeName;
use aws_sdk_sqs::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// SQS caps visibility timeouts at 12 hours.
const MAX_VISIBILITY_SECS: u64 = 12 * 60 * 60;

const MAX_DEDUP_ID_LEN: usize = 128;

fn unavailable(e: impl std::fmt::Display) -> QueueError {
    QueueError::Unavailable(e.to_string())
}

/// One deduplication id per enqueue generation: a sweep recovery is a new
/// message, a repeated send of the same generation is dropped by SQS.
fn dedup_id(video_id: &VideoId, payload: &JobPayload) -> String {
    let id = format!("{}.r{}", video_id, payload.recovery());
    if id.len() <= MAX_DEDUP_ID_LEN {
        id
    } else {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, id.as_bytes()).to_string()
    }
}

fn visibility_secs(duration: Duration) -> i32 {
    let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    secs.min(MAX_VISIBILITY_SECS) as i32
}

/// Message body. Retry policy travels with the job.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    video_id: VideoId,
    payload: String,
    max_attempts: u32,
    backoff_base_ms: u64,
}

/// Lease token layout: `{backoff_base_ms}|{receipt_handle}`. The receipt
/// handle is what SQS needs; the backoff lets `fail` schedule the retry
/// without another lookup.
fn lease_token(backoff_base_ms: u64, receipt: &str) -> String {
    format!("{}|{}", backoff_base_ms, receipt)
}

fn split_token(token: &str) -> Option<(Duration, &str)> {
    let (backoff, receipt) = token.split_once('|')?;
    let backoff = backoff.parse().ok()?;
    Some((Duration::from_millis(backoff), receipt))
}

/// SqsQueue implements JobQueue for an SQS FIFO queue. The message group is
/// the video id, so one video never has two deliveries in flight.
#[derive(Clone)]
pub struct SqsQueue {
    client: Client,
    queue_url: String,
    lease: Duration,
}

impl SqsQueue {
    pub fn new(client: Client, queue_url: String, lease: Duration) -> Self {
        Self {
            client,
            queue_url,
            lease,
        }
    }

    fn receipt<'a>(&self, delivery: &'a Delivery) -> Result<(Duration, &'a str), QueueError> {
        split_token(&delivery.lease_token)
            .ok_or_else(|| QueueError::InvalidPayload("malformed lease token".into()))
    }

    async fn delete(&self, receipt: &str) -> Result<bool, QueueError> {
        match self
            .client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let service = e.into_service_error();
                if service.is_receipt_handle_is_invalid() || service.is_invalid_id_format() {
                    Ok(false)
                } else {
                    Err(unavailable(service))
                }
            }
        }
    }

    async fn set_visibility(&self, receipt: &str, timeout: Duration) -> Result<bool, QueueError> {
        match self
            .client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt)
            .visibility_timeout(visibility_secs(timeout))
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let service = e.into_service_error();
                if service.is_receipt_handle_is_invalid() || service.is_message_not_inflight() {
                    Ok(false)
                } else {
                    Err(unavailable(service))
                }
            }
        }
    }
}

#[async_trait]
impl JobQueue for SqsQueue {
    async fn enqueue(
        &self,
        video_id: &VideoId,
        payload: &JobPayload,
        options: &EnqueueOptions,
    ) -> Result<EnqueueOutcome, QueueError> {
        let envelope = Envelope {
            video_id: video_id.clone(),
            payload: encode_for(video_id, payload)?,
            max_attempts: options.max_attempts,
            backoff_base_ms: options.backoff_base.as_millis() as u64,
        };
        let message_body = serde_json::to_string(&envelope)?;

        // SQS answers success for a dropped duplicate. The dropped copy is of
        // the same generation, so that job is queued either way.
        self.client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(message_body)
            .message_group_id(video_id.as_str())
            .message_deduplication_id(dedup_id(video_id, payload))
            .send()
            .await
            .map_err(|e| unavailable(e.into_service_error()))?;
        debug!(video_id = %video_id, "job sent to SQS");
        Ok(EnqueueOutcome::Enqueued)
    }

    async fn claim(&self) -> Result<Option<Delivery>, QueueError> {
        let resp = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(1)
            .wait_time_seconds(0)
            .visibility_timeout(visibility_secs(self.lease))
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .send()
            .await
            .map_err(|e| unavailable(e.into_service_error()))?;

        let Some(msg) = resp.messages.and_then(|m| m.into_iter().next()) else {
            return Ok(None);
        };
        let Some(receipt) = msg.receipt_handle() else {
            return Ok(None);
        };

        let envelope: Envelope = match msg.body().map(serde_json::from_str).transpose() {
            Ok(Some(envelope)) => envelope,
            Ok(None) | Err(_) => {
                // Not ours to retry; drop it so it cannot block its group.
                warn!(message_id = ?msg.message_id(), "discarding unreadable SQS message");
                self.delete(receipt).await?;
                return Ok(None);
            }
        };

        let attempt = msg
            .attributes()
            .and_then(|a| a.get(&MessageSystemAttributeName::ApproximateReceiveCount))
            .and_then(|n| n.parse().ok())
            .unwrap_or(1);

        Ok(Some(Delivery {
            video_id: envelope.video_id,
            payload: envelope.payload,
            attempt,
            max_attempts: envelope.max_attempts,
            lease_token: lease_token(envelope.backoff_base_ms, receipt),
        }))
    }

    async fn extend_lease(&self, delivery: &Delivery) -> Result<bool, QueueError> {
        let (_, receipt) = self.receipt(delivery)?;
        self.set_visibility(receipt, self.lease).await
    }

    async fn complete(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let (_, receipt) = self.receipt(delivery)?;
        if !self.delete(receipt).await? {
            debug!(video_id = %delivery.video_id, "completion ignored, receipt expired");
        }
        Ok(())
    }

    async fn fail(
        &self,
        delivery: &Delivery,
        reason: &str,
        permanent: bool,
    ) -> Result<FailOutcome, QueueError> {
        let (backoff_base, receipt) = self.receipt(delivery)?;

        if permanent || delivery.attempt >= delivery.max_attempts {
            if !self.delete(receipt).await? {
                return Ok(FailOutcome::LeaseLost);
            }
            warn!(video_id = %delivery.video_id, attempts = delivery.attempt, reason, "job dropped after final attempt");
            return Ok(FailOutcome::Exhausted {
                attempts: delivery.attempt,
            });
        }

        let options = EnqueueOptions {
            backoff_base,
            ..EnqueueOptions::default()
        };
        let delay = options.backoff_for(delivery.attempt);
        if !self.set_visibility(receipt, delay).await? {
            return Ok(FailOutcome::LeaseLost);
        }
        Ok(FailOutcome::RetryScheduled {
            next_attempt: delivery.attempt + 1,
            delay,
        })
    }
}
