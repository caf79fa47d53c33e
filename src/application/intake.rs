use crate::domain::artifacts::{master_key, upload_key};
use crate::domain::jobs::{
    InvalidVideoId, JobPayload, JobStatus, SourceLocation, Transition, VideoId, VideoRecord,
};
use crate::ports::queue::{EnqueueOptions, EnqueueOutcome, JobQueue};
use crate::ports::repository::{StatusStore, StoreError};
use crate::ports::storage::{ObjectBody, ObjectStore};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error(transparent)]
    InvalidVideoId(#[from] InvalidVideoId),
    #[error("invalid source: {0}")]
    InvalidSource(String),
    #[error("video {0} not found")]
    NotFound(VideoId),
    #[error("video {0} was already submitted")]
    AlreadySubmitted(VideoId),
    /// Backing services refused the request. Retrying later may succeed.
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for IntakeError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => IntakeError::NotFound(id),
            StoreError::AlreadyExists(id) => IntakeError::AlreadySubmitted(id),
            other => IntakeError::Unavailable(other.to_string()),
        }
    }
}

pub enum SubmitSource {
    /// Bytes are stored under the upload key before the job is queued.
    Upload(ObjectBody),
    Existing(SourceLocation),
}

pub struct SubmitRequest {
    pub video_id: Option<String>,
    pub source: SubmitSource,
}

/// Body of a poll answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollResponse {
    pub processing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PollResponse {
    pub fn from_record(record: &VideoRecord) -> Self {
        match record.status {
            JobStatus::Submitted | JobStatus::Processing => Self {
                processing: true,
                success: None,
                manifest: None,
                reason: None,
            },
            JobStatus::Processed => Self {
                processing: false,
                success: Some(true),
                manifest: Some(master_key(&record.video_id)),
                reason: None,
            },
            JobStatus::Failed => Self {
                processing: false,
                success: Some(false),
                manifest: None,
                reason: Some(
                    record
                        .reason
                        .clone()
                        .unwrap_or_else(|| "processing failed".to_string()),
                ),
            },
        }
    }
}

/// Accepts videos and answers status polls.
pub struct IntakeService<Q, R, S> {
    queue: Arc<Q>,
    store: Arc<R>,
    storage: Arc<S>,
    options: EnqueueOptions,
}

impl<Q, R, S> IntakeService<Q, R, S>
where
    Q: JobQueue,
    R: StatusStore,
    S: ObjectStore,
{
    pub fn new(queue: Arc<Q>, store: Arc<R>, storage: Arc<S>, options: EnqueueOptions) -> Self {
        Self {
            queue,
            store,
            storage,
            options,
        }
    }

    /// Returns once the job is durably queued.
    pub async fn submit(&self, request: SubmitRequest) -> Result<VideoId, IntakeError> {
        let video_id = match request.video_id {
            Some(raw) => VideoId::new(raw)?,
            None => VideoId::generate(),
        };

        if self.store.get(&video_id).await?.is_some() {
            return Err(IntakeError::AlreadySubmitted(video_id));
        }

        let (source, uploaded) = match request.source {
            SubmitSource::Upload(body) => {
                let key = upload_key(&video_id, &Uuid::new_v4());
                self.storage
                    .put(&key, body)
                    .await
                    .map_err(|e| IntakeError::Unavailable(e.to_string()))?;
                (SourceLocation::ObjectKey(key.clone()), Some(key))
            }
            SubmitSource::Existing(SourceLocation::ObjectKey(key)) if key.trim().is_empty() => {
                return Err(IntakeError::InvalidSource("empty object key".into()));
            }
            SubmitSource::Existing(location) => (location, None),
        };

        // The create is the real uniqueness check; the lookup above only
        // saves an upload in the common case.
        if let Err(e) = self
            .store
            .create(&VideoRecord::submitted(video_id.clone(), source.clone()))
            .await
        {
            if let Some(key) = uploaded {
                if let Err(cleanup) = self.storage.delete_many(&[key]).await {
                    warn!(video_id = %video_id, error = %cleanup, "could not remove unused upload");
                }
            }
            return Err(e.into());
        }

        let payload = JobPayload::transcode(video_id.clone(), source);
        match self.queue.enqueue(&video_id, &payload, &self.options).await {
            Ok(EnqueueOutcome::Enqueued) => {
                info!(video_id = %video_id, "video submitted");
                Ok(video_id)
            }
            Ok(EnqueueOutcome::AlreadyOutstanding) => {
                info!(video_id = %video_id, "video already queued");
                Ok(video_id)
            }
            Err(e) => {
                let reason = format!("could not queue job: {}", e);
                if let Err(store_err) = self
                    .store
                    .apply(&video_id, Transition::Fail { reason: reason.clone() })
                    .await
                {
                    warn!(video_id = %video_id, error = %store_err, "could not record enqueue failure");
                }
                Err(IntakeError::Unavailable(reason))
            }
        }
    }

    pub async fn poll(&self, raw_id: &str) -> Result<PollResponse, IntakeError> {
        let video_id = VideoId::new(raw_id)?;
        let record = self
            .store
            .get(&video_id)
            .await?
            .ok_or(IntakeError::NotFound(video_id))?;
        Ok(PollResponse::from_record(&record))
    }
}
