//! HTTP inbound adapter: submit and poll.

mod error;

pub use error::ApiError;

use crate::application::intake::{IntakeService, PollResponse, SubmitRequest, SubmitSource};
use crate::domain::jobs::SourceLocation;
use crate::ports::queue::JobQueue;
use crate::ports::repository::StatusStore;
use crate::ports::storage::{ObjectBody, ObjectStore};
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{BoxError, Json, Router};
use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::io::StreamReader;
use tower_http::trace::TraceLayer;
use tracing::info;

pub const SPOOL_PREFIX: &str = "upload-";

/// Shared state for the handlers.
pub struct HttpState<Q, R, S> {
    pub intake: IntakeService<Q, R, S>,
    /// Uploads are spooled here before they reach the object store.
    pub spool_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceRequest {
    pub source_location: String,
    #[serde(default)]
    pub video_id: Option<String>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub video_id: String,
}

pub fn router<Q, R, S>(state: Arc<HttpState<Q, R, S>>) -> Router
where
    Q: JobQueue + 'static,
    R: StatusStore + 'static,
    S: ObjectStore + 'static,
{
    Router::new()
        .route("/videos", post(submit_upload::<Q, R, S>))
        .route("/videos/reference", post(submit_reference::<Q, R, S>))
        .route("/videos/:video_id", get(poll::<Q, R, S>))
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// Accepts a multipart form with a file field and an optional `videoId` field.
async fn submit_upload<Q, R, S>(
    State(state): State<Arc<HttpState<Q, R, S>>>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError>
where
    Q: JobQueue + 'static,
    R: StatusStore + 'static,
    S: ObjectStore + 'static,
{
    let mut video_id = None;
    let mut spooled = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?
    {
        if field.file_name().is_some() {
            tokio::fs::create_dir_all(&state.spool_dir)
                .await
                .map_err(|e| ApiError::internal(e.to_string()))?;
            let spool = tempfile::Builder::new()
                .prefix(SPOOL_PREFIX)
                .tempfile_in(&state.spool_dir)
                .map_err(|e| ApiError::internal(e.to_string()))?;
            stream_to_file(spool.path(), field).await?;
            spooled = Some(spool);
        } else if field.name() == Some("videoId") {
            let text = field
                .text()
                .await
                .map_err(|e| ApiError::bad_request(e.to_string()))?;
            video_id = Some(text);
        }
    }

    // The spool file is removed when `spooled` drops, after submit returns.
    let spool = spooled.ok_or_else(|| ApiError::bad_request("missing file field"))?;
    let id = state
        .intake
        .submit(SubmitRequest {
            video_id,
            source: SubmitSource::Upload(ObjectBody::File(spool.path().to_path_buf())),
        })
        .await?;
    info!(video_id = %id, "upload accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            video_id: id.to_string(),
        }),
    ))
}

async fn submit_reference<Q, R, S>(
    State(state): State<Arc<HttpState<Q, R, S>>>,
    Json(body): Json<ReferenceRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError>
where
    Q: JobQueue + 'static,
    R: StatusStore + 'static,
    S: ObjectStore + 'static,
{
    let id = state
        .intake
        .submit(SubmitRequest {
            video_id: body.video_id,
            source: SubmitSource::Existing(SourceLocation::ObjectKey(body.source_location)),
        })
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            video_id: id.to_string(),
        }),
    ))
}

async fn poll<Q, R, S>(
    State(state): State<Arc<HttpState<Q, R, S>>>,
    Path(video_id): Path<String>,
) -> Result<Json<PollResponse>, ApiError>
where
    Q: JobQueue + 'static,
    R: StatusStore + 'static,
    S: ObjectStore + 'static,
{
    Ok(Json(state.intake.poll(&video_id).await?))
}

// Save a `Stream` to a file
async fn stream_to_file<St, E>(path: &FsPath, stream: St) -> Result<(), ApiError>
where
    St: Stream<Item = Result<Bytes, E>>,
    E: Into<BoxError>,
{
    async {
        let body_with_io_error = stream.map_err(|err| io::Error::new(io::ErrorKind::Other, err));
        let body_reader = StreamReader::new(body_with_io_error);
        futures::pin_mut!(body_reader);

        let mut file = BufWriter::new(File::create(path).await?);
        tokio::io::copy(&mut body_reader, &mut file).await?;
        file.flush().await?;

        Ok::<_, io::Error>(())
    }
    .await
    .map_err(|err| ApiError::internal(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{MemoryObjectStore, MemoryQueue, MemoryStatusStore};
    use crate::application::intake::IntakeError;
    use crate::ports::queue::EnqueueOptions;
    use futures::stream;
    use std::time::Duration;

    type TestState = HttpState<MemoryQueue, MemoryStatusStore, MemoryObjectStore>;

    fn state(dir: &FsPath) -> (Arc<TestState>, Arc<MemoryQueue>) {
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(30)));
        let intake = IntakeService::new(
            queue.clone(),
            Arc::new(MemoryStatusStore::new()),
            Arc::new(MemoryObjectStore::new()),
            EnqueueOptions::default(),
        );
        (
            Arc::new(HttpState {
                intake,
                spool_dir: dir.to_path_buf(),
            }),
            queue,
        )
    }

    #[tokio::test]
    async fn test_reference_submit_then_poll() {
        let dir = tempfile::tempdir().unwrap();
        let (state, queue) = state(dir.path());

        let (status, Json(body)) = submit_reference(
            State(state.clone()),
            Json(ReferenceRequest {
                source_location: "incoming/a.mp4".into(),
                video_id: Some("clip-9".into()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body.video_id, "clip-9");
        assert_eq!(queue.pending(), 1);

        let Json(polled) = poll(State(state.clone()), Path("clip-9".into()))
            .await
            .unwrap();
        assert!(polled.processing);
    }

    #[tokio::test]
    async fn test_poll_unknown_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = state(dir.path());
        let err = poll(State(state), Path("missing".into())).await.unwrap_err();
        assert!(matches!(err, ApiError::Intake(IntakeError::NotFound(_))));
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_duplicate_reference_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = state(dir.path());
        let request = || ReferenceRequest {
            source_location: "incoming/a.mp4".into(),
            video_id: Some("dup".into()),
        };
        submit_reference(State(state.clone()), Json(request()))
            .await
            .unwrap();
        let err = submit_reference(State(state), Json(request()))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_stream_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spooled");
        let data = vec![
            Ok::<_, io::Error>(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ];
        stream_to_file(&path, stream::iter(data)).await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_stream_to_file_error() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![
            Ok(Bytes::from_static(b"hello")),
            Err(io::Error::new(io::ErrorKind::Other, "broken pipe")),
        ];
        let err = stream_to_file(&dir.path().join("spooled"), stream::iter(data))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
