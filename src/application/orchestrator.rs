use crate::domain::artifacts::{artifact_key, master_key, video_prefix, ArtifactSet, MASTER_PLAYLIST};
use crate::domain::hls::MasterPlaylist;
use crate::domain::jobs::{SourceLocation, VideoId};
use crate::domain::rendition::{RenditionSpec, RENDITIONS};
use crate::ports::encoder::{Encoder, RenditionOutput};
use crate::ports::storage::{ObjectBody, ObjectStore};
use crate::ports::transcoder::{PipelineError, TranscodeReport, Transcoder};
use async_trait::async_trait;
use futures::future::join_all;
use futures::{stream, StreamExt, TryStreamExt};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

/// Per-job scratch directories start with this, so stale ones can be
/// told apart from other entries of a shared temp dir.
pub const SCRATCH_PREFIX: &str = "reelforge-";

const SCRATCH_REMOVE_ATTEMPTS: u32 = 3;
const SCRATCH_REMOVE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Parent of the per-job scratch directories.
    pub scratch_root: PathBuf,
    /// Wall-clock limit for the whole rendition fan-out.
    pub fanout_timeout: Duration,
    pub upload_concurrency: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            scratch_root: std::env::temp_dir(),
            fanout_timeout: Duration::from_secs(30 * 60),
            upload_concurrency: 8,
        }
    }
}

/// Drives one video through encode, publish and verification.
pub struct TranscodeOrchestrator<S, E> {
    storage: S,
    encoder: E,
    renditions: &'static [RenditionSpec],
    config: OrchestratorConfig,
}

impl<S, E> TranscodeOrchestrator<S, E>
where
    S: ObjectStore,
    E: Encoder,
{
    pub fn new(storage: S, encoder: E, config: OrchestratorConfig) -> Self {
        Self {
            storage,
            encoder,
            renditions: &RENDITIONS,
            config,
        }
    }

    pub fn with_renditions(mut self, renditions: &'static [RenditionSpec]) -> Self {
        self.renditions = renditions;
        self
    }

    async fn run(
        &self,
        video_id: &VideoId,
        source: &SourceLocation,
        scratch: &Path,
    ) -> Result<TranscodeReport, PipelineError> {
        let source_path = scratch.join("source");
        self.materialize(source, &source_path).await?;

        let out_dir = scratch.join("hls");
        tokio::fs::create_dir_all(&out_dir).await?;

        let outputs = self.encode_all(video_id, &source_path, &out_dir).await?;

        let master_path = out_dir.join(MASTER_PLAYLIST);
        MasterPlaylist::for_renditions(self.renditions)
            .write_to(&master_path)
            .await?;

        let mut files = vec![master_path];
        for output in outputs {
            files.push(output.playlist);
            files.extend(output.segments);
        }

        match self.publish(video_id, &files).await {
            Ok(report) => Ok(report),
            Err(e) => {
                self.remove_published(video_id).await;
                Err(e)
            }
        }
    }

    async fn materialize(&self, source: &SourceLocation, dest: &Path) -> Result<(), PipelineError> {
        match source {
            SourceLocation::ObjectKey(key) => self
                .storage
                .download(key, dest)
                .await
                .map_err(PipelineError::Source),
            SourceLocation::LocalPath(path) => {
                tokio::fs::copy(path, dest)
                    .await
                    .map_err(|e| PipelineError::Source(e.into()))?;
                Ok(())
            }
        }
    }

    /// Encode every rendition concurrently. All must succeed.
    async fn encode_all(
        &self,
        video_id: &VideoId,
        source: &Path,
        out_dir: &Path,
    ) -> Result<Vec<RenditionOutput>, PipelineError> {
        let encodes = self.renditions.iter().map(|rendition| async move {
            let result = self.encoder.encode_rendition(source, rendition, out_dir).await;
            (rendition, result)
        });

        // On timeout the pending encodes are dropped, which kills their processes.
        let results = tokio::time::timeout(self.config.fanout_timeout, join_all(encodes))
            .await
            .map_err(|_| PipelineError::Timeout(self.config.fanout_timeout))?;

        let mut outputs = Vec::with_capacity(results.len());
        let mut failure = None;
        for (rendition, result) in results {
            match result {
                Ok(output) => outputs.push(output),
                Err(e) => {
                    error!(video_id = %video_id, rendition = rendition.name, error = %e, "rendition failed");
                    if failure.is_none() {
                        failure = Some(PipelineError::Encode {
                            rendition: rendition.name,
                            source: e,
                        });
                    }
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(outputs),
        }
    }

    async fn publish(
        &self,
        video_id: &VideoId,
        files: &[PathBuf],
    ) -> Result<TranscodeReport, PipelineError> {
        let uploaded: Vec<String> = stream::iter(files.iter().cloned())
            .map(|path| async move {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let key = artifact_key(video_id, &name);
                self.storage
                    .put(&key, ObjectBody::File(path))
                    .await
                    .map_err(PipelineError::Upload)?;
                Ok::<_, PipelineError>(key)
            })
            .buffer_unordered(self.config.upload_concurrency.max(1))
            .try_collect()
            .await?;

        let mut expected = ArtifactSet::for_video(video_id, self.renditions);
        expected.require(uploaded.iter().cloned());

        let listed = self
            .storage
            .list(&video_prefix(video_id))
            .await
            .map_err(PipelineError::Upload)?;
        let missing = expected.missing_from(&listed);
        if !missing.is_empty() {
            return Err(PipelineError::Incomplete { missing });
        }

        Ok(TranscodeReport {
            manifest_key: master_key(video_id),
            uploaded: uploaded.len(),
        })
    }

    /// Best effort. A leftover prefix is never listed as complete, so errors
    /// are only logged.
    async fn remove_published(&self, video_id: &VideoId) {
        if let Err(e) = self.delete_prefix(video_id).await {
            warn!(video_id = %video_id, error = %e, "failed to remove partial upload");
        }
    }

    async fn delete_prefix(&self, video_id: &VideoId) -> Result<(), PipelineError> {
        let keys: Vec<String> = self
            .storage
            .list(&video_prefix(video_id))
            .await
            .map_err(PipelineError::Upload)?
            .into_iter()
            .collect();
        if keys.is_empty() {
            return Ok(());
        }
        self.storage
            .delete_many(&keys)
            .await
            .map_err(PipelineError::Upload)?;
        info!(video_id = %video_id, removed = keys.len(), "removed published objects");
        Ok(())
    }
}

async fn remove_scratch(path: &Path) {
    for attempt in 1..=SCRATCH_REMOVE_ATTEMPTS {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => return,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) if attempt == SCRATCH_REMOVE_ATTEMPTS => {
                warn!(path = %path.display(), error = %e, "giving up on scratch directory");
            }
            Err(_) => tokio::time::sleep(SCRATCH_REMOVE_DELAY).await,
        }
    }
}

#[async_trait]
impl<S, E> Transcoder for TranscodeOrchestrator<S, E>
where
    S: ObjectStore,
    E: Encoder,
{
    async fn transcode(
        &self,
        video_id: &VideoId,
        source: &SourceLocation,
    ) -> Result<TranscodeReport, PipelineError> {
        tokio::fs::create_dir_all(&self.config.scratch_root).await?;
        let scratch = tempfile::Builder::new()
            .prefix(&format!("{SCRATCH_PREFIX}{video_id}-"))
            .tempdir_in(&self.config.scratch_root)?
            .into_path();

        info!(video_id = %video_id, source = %source, "transcode started");
        let result = self.run(video_id, source, &scratch).await;
        remove_scratch(&scratch).await;

        match &result {
            Ok(report) => info!(video_id = %video_id, uploaded = report.uploaded, "transcode finished"),
            Err(e) => error!(video_id = %video_id, error = %e, "transcode failed"),
        }
        result
    }

    async fn discard(&self, video_id: &VideoId) -> Result<(), PipelineError> {
        self.delete_prefix(video_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemoryObjectStore;
    use crate::domain::artifacts::upload_key;
    use crate::ports::encoder::{EncodeError, MockEncoder};
    use bytes::Bytes;
    use std::sync::Arc;
    use uuid::Uuid;

    fn source_key(id: &VideoId) -> String {
        upload_key(id, &Uuid::nil())
    }

    fn write_rendition(rendition: &RenditionSpec, dir: &Path) -> RenditionOutput {
        let playlist = dir.join(rendition.playlist_name());
        std::fs::write(&playlist, format!("#EXTM3U\n{}_000.ts\n", rendition.name)).unwrap();
        let segments: Vec<PathBuf> = (0..2)
            .map(|i| {
                let p = dir.join(format!("{}_{:03}.ts", rendition.name, i));
                std::fs::write(&p, b"ts").unwrap();
                p
            })
            .collect();
        RenditionOutput { playlist, segments }
    }

    fn encoder_failing_on(name: &'static str) -> MockEncoder {
        let mut encoder = MockEncoder::new();
        encoder
            .expect_encode_rendition()
            .returning(move |_, rendition, dir| {
                if rendition.name == name {
                    Err(EncodeError::Exited {
                        status: "exit status: 1".into(),
                        stderr: "Invalid data found when processing input".into(),
                    })
                } else {
                    Ok(write_rendition(rendition, dir))
                }
            });
        encoder
    }

    async fn store_with_source(id: &VideoId) -> Arc<MemoryObjectStore> {
        let store = Arc::new(MemoryObjectStore::new());
        store
            .put(&source_key(id), ObjectBody::Bytes(Bytes::from_static(b"video")))
            .await
            .unwrap();
        store
    }

    fn config(scratch: &Path) -> OrchestratorConfig {
        OrchestratorConfig {
            scratch_root: scratch.to_path_buf(),
            fanout_timeout: Duration::from_secs(60),
            upload_concurrency: 4,
        }
    }

    #[tokio::test]
    async fn test_publishes_complete_artifact_set() {
        let scratch = tempfile::tempdir().unwrap();
        let id = VideoId::new("vid-ok").unwrap();
        let store = store_with_source(&id).await;
        let orchestrator =
            TranscodeOrchestrator::new(store.clone(), encoder_failing_on("none"), config(scratch.path()));

        let report = orchestrator
            .transcode(&id, &SourceLocation::ObjectKey(source_key(&id)))
            .await
            .unwrap();

        assert_eq!(report.manifest_key, "videos/vid-ok/master.m3u8");
        // master + 3 playlists + 6 segments
        assert_eq!(report.uploaded, 10);

        let listed = store.list("videos/vid-ok/").await.unwrap();
        assert!(ArtifactSet::for_video(&id, &RENDITIONS).is_complete(&listed));
        let master = store.object("videos/vid-ok/master.m3u8").unwrap();
        assert_eq!(
            master,
            Bytes::from(MasterPlaylist::for_renditions(&RENDITIONS).render())
        );

        let leftovers = std::fs::read_dir(scratch.path()).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_failed_rendition_publishes_nothing() {
        let scratch = tempfile::tempdir().unwrap();
        let id = VideoId::new("vid-bad").unwrap();
        let store = store_with_source(&id).await;
        let orchestrator =
            TranscodeOrchestrator::new(store.clone(), encoder_failing_on("720p"), config(scratch.path()));

        let err = orchestrator
            .transcode(&id, &SourceLocation::ObjectKey(source_key(&id)))
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Encode { rendition: "720p", .. }));
        assert!(store.list("videos/vid-bad/").await.unwrap().is_empty());
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_upload_failure_rolls_back_prefix() {
        let scratch = tempfile::tempdir().unwrap();
        let id = VideoId::new("vid-up").unwrap();
        let store = store_with_source(&id).await;
        store.reject_keys_containing("360p_001");
        let orchestrator =
            TranscodeOrchestrator::new(store.clone(), encoder_failing_on("none"), config(scratch.path()));

        let err = orchestrator
            .transcode(&id, &SourceLocation::ObjectKey(source_key(&id)))
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Upload(_)));
        assert!(store.list("videos/vid-up/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_discard_removes_published_video_only() {
        let scratch = tempfile::tempdir().unwrap();
        let id = VideoId::new("vid-drop").unwrap();
        let store = store_with_source(&id).await;
        let orchestrator =
            TranscodeOrchestrator::new(store.clone(), encoder_failing_on("none"), config(scratch.path()));
        orchestrator
            .transcode(&id, &SourceLocation::ObjectKey(source_key(&id)))
            .await
            .unwrap();
        assert!(!store.list("videos/vid-drop/").await.unwrap().is_empty());

        orchestrator.discard(&id).await.unwrap();
        assert!(store.list("videos/vid-drop/").await.unwrap().is_empty());
        assert!(store.object(&source_key(&id)).is_some());

        // Nothing left to remove is not an error.
        orchestrator.discard(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_source() {
        let scratch = tempfile::tempdir().unwrap();
        let id = VideoId::new("vid-none").unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        let mut encoder = MockEncoder::new();
        encoder.expect_encode_rendition().never();
        let orchestrator = TranscodeOrchestrator::new(store, encoder, config(scratch.path()));

        let err = orchestrator
            .transcode(&id, &SourceLocation::ObjectKey("uploads/nope/source".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Source(_)));
    }

    struct SlowEncoder;

    #[async_trait]
    impl Encoder for SlowEncoder {
        async fn encode_rendition(
            &self,
            _source: &Path,
            _rendition: &RenditionSpec,
            _output_dir: &Path,
        ) -> Result<RenditionOutput, EncodeError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(EncodeError::MissingOutput("never".into()))
        }
    }

    #[tokio::test]
    async fn test_fanout_timeout() {
        let scratch = tempfile::tempdir().unwrap();
        let id = VideoId::new("vid-slow").unwrap();
        let store = store_with_source(&id).await;
        let mut cfg = config(scratch.path());
        cfg.fanout_timeout = Duration::from_millis(50);
        let orchestrator = TranscodeOrchestrator::new(store.clone(), SlowEncoder, cfg);

        let err = orchestrator
            .transcode(&id, &SourceLocation::ObjectKey(source_key(&id)))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Timeout(_)));
        assert!(store.list("videos/vid-slow/").await.unwrap().is_empty());
    }
}
