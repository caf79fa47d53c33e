use crate::domain::jobs::{SourceLocation, VideoId};
use crate::ports::encoder::EncodeError;
use crate::ports::storage::StorageError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("source unavailable: {0}")]
    Source(#[source] StorageError),
    #[error("rendition {rendition} failed: {source}")]
    Encode {
        rendition: &'static str,
        #[source]
        source: EncodeError,
    },
    #[error("renditions timed out after {0:?}")]
    Timeout(Duration),
    #[error("upload failed: {0}")]
    Upload(#[source] StorageError),
    #[error("artifact set incomplete, missing {missing:?}")]
    Incomplete { missing: Vec<String> },
    #[error("scratch io error: {0}")]
    Scratch(#[from] std::io::Error),
}

/// Outcome of one successful pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeReport {
    pub manifest_key: String,
    pub uploaded: usize,
}

/// Turns one source video into a published stream.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn transcode(
        &self,
        video_id: &VideoId,
        source: &SourceLocation,
    ) -> Result<TranscodeReport, PipelineError>;

    /// Remove everything published for `video_id`. Used when a finished run
    /// could not be recorded as processed.
    async fn discard(&self, video_id: &VideoId) -> Result<(), PipelineError>;
}

#[async_trait]
impl<T: Transcoder + ?Sized> Transcoder for Arc<T> {
    async fn transcode(
        &self,
        video_id: &VideoId,
        source: &SourceLocation,
    ) -> Result<TranscodeReport, PipelineError> {
        (**self).transcode(video_id, source).await
    }

    async fn discard(&self, video_id: &VideoId) -> Result<(), PipelineError> {
        (**self).discard(video_id).await
    }
}
