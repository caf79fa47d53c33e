use crate::domain::jobs::{JobStatus, Transition, TransitionError, VideoId, VideoRecord};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no record for video {0}")]
    NotFound(VideoId),
    #[error("record for video {0} already exists")]
    AlreadyExists(VideoId),
    #[error("transition rejected: {0}")]
    Rejected(#[from] TransitionError),
    /// Concurrent writers kept winning the compare-and-set.
    #[error("concurrent update conflict on video {0}")]
    Conflict(VideoId),
    #[error("status store backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable processing state per video.
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn create(&self, record: &VideoRecord) -> Result<(), StoreError>;

    async fn get(&self, video_id: &VideoId) -> Result<Option<VideoRecord>, StoreError>;

    /// Apply a transition atomically against the stored version and return
    /// the updated record.
    async fn apply(
        &self,
        video_id: &VideoId,
        transition: Transition,
    ) -> Result<VideoRecord, StoreError>;

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<VideoRecord>, StoreError>;
}

#[async_trait]
impl<T: StatusStore + ?Sized> StatusStore for Arc<T> {
    async fn create(&self, record: &VideoRecord) -> Result<(), StoreError> {
        (**self).create(record).await
    }

    async fn get(&self, video_id: &VideoId) -> Result<Option<VideoRecord>, StoreError> {
        (**self).get(video_id).await
    }

    async fn apply(
        &self,
        video_id: &VideoId,
        transition: Transition,
    ) -> Result<VideoRecord, StoreError> {
        (**self).apply(video_id, transition).await
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<VideoRecord>, StoreError> {
        (**self).list_by_status(status).await
    }
}

/// Compare-and-set retries before giving up with [`StoreError::Conflict`].
pub const MAX_CAS_RETRIES: usize = 8;
