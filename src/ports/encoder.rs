use crate::domain::rendition::RenditionSpec;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("failed to start encoder: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("encoder exited with {status}: {stderr}")]
    Exited { status: String, stderr: String },
    #[error("encoder produced no {0}")]
    MissingOutput(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Files produced for one rendition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenditionOutput {
    pub playlist: PathBuf,
    pub segments: Vec<PathBuf>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Encoder: Send + Sync {
    /// Encode `source` into an HLS rendition inside `output_dir`.
    async fn encode_rendition(
        &self,
        source: &Path,
        rendition: &RenditionSpec,
        output_dir: &Path,
    ) -> Result<RenditionOutput, EncodeError>;
}
