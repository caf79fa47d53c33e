use crate::domain::artifacts::content_type_for;
use crate::ports::storage::{ObjectBody, ObjectStore, StorageError};
use async_trait::async_trait;
use aws_sdk_s3::primitives::{ByteStream, Length};
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier};
use aws_sdk_s3::Client;
use std::collections::BTreeSet;
use std::path::Path;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};

/// Files at or above this size go up as multipart uploads.
const MULTIPART_THRESHOLD: u64 = 64 * 1024 * 1024;
const PART_SIZE: u64 = 8 * 1024 * 1024;
/// DeleteObjects accepts at most this many keys per call.
const DELETE_BATCH: usize = 1000;

fn backend(e: impl std::fmt::Display) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// `(offset, length)` of each part of a `len`-byte file.
fn part_ranges(len: u64, part_size: u64) -> Vec<(u64, u64)> {
    let mut ranges = Vec::new();
    let mut offset = 0;
    while offset < len {
        let length = part_size.min(len - offset);
        ranges.push((offset, length));
        offset += length;
    }
    ranges
}

/// S3ObjectStore implements ObjectStore for S3 and S3-compatible stores (R2).
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    pub fn new(client: Client, bucket: String) -> Self {
        Self { client, bucket }
    }

    /// Build a client, pointing it at `endpoint` with path-style addressing
    /// when one is given.
    pub fn client_for(sdk_config: &aws_config::SdkConfig, endpoint: Option<&str>) -> Client {
        let mut builder = aws_sdk_s3::config::Builder::from(sdk_config);
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        Client::from_conf(builder.build())
    }

    async fn put_file(&self, key: &str, path: &Path) -> Result<(), StorageError> {
        let len = tokio::fs::metadata(path).await?.len();
        if len >= MULTIPART_THRESHOLD {
            return self.put_multipart(key, path, len).await;
        }

        let body = ByteStream::from_path(path).await.map_err(backend)?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type_for(key))
            .body(body)
            .send()
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn put_multipart(&self, key: &str, path: &Path, len: u64) -> Result<(), StorageError> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type_for(key))
            .send()
            .await
            .map_err(backend)?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| backend("multipart upload started without an id"))?
            .to_string();

        match self.upload_parts(key, path, len, &upload_id).await {
            Ok(parts) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(backend)?;
                info!(key, bytes = len, "multipart upload complete");
                Ok(())
            }
            Err(e) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(key, error = %abort_err, "could not abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        path: &Path,
        len: u64,
        upload_id: &str,
    ) -> Result<Vec<CompletedPart>, StorageError> {
        let mut parts = Vec::new();
        for (index, (offset, length)) in part_ranges(len, PART_SIZE).into_iter().enumerate() {
            let part_number = index as i32 + 1;
            let body = ByteStream::read_from()
                .path(path)
                .offset(offset)
                .length(Length::Exact(length))
                .build()
                .await
                .map_err(backend)?;
            let uploaded = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(body)
                .send()
                .await
                .map_err(backend)?;
            parts.push(
                CompletedPart::builder()
                    .set_e_tag(uploaded.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
        }
        Ok(parts)
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, key: &str, body: ObjectBody) -> Result<(), StorageError> {
        debug!(key, body = ?body, "uploading object");
        match body {
            ObjectBody::Bytes(bytes) => {
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .content_type(content_type_for(key))
                    .body(ByteStream::from(bytes))
                    .send()
                    .await
                    .map_err(backend)?;
                Ok(())
            }
            ObjectBody::File(path) => self.put_file(key, &path).await,
            ObjectBody::Stream(stream) => {
                // Spool first: S3 needs a known length per request.
                let spool = tempfile::NamedTempFile::new()?;
                let mut reader = StreamReader::new(stream);
                let mut writer = BufWriter::new(tokio::fs::File::create(spool.path()).await?);
                tokio::io::copy(&mut reader, &mut writer).await?;
                writer.flush().await?;
                self.put_file(key, spool.path()).await
            }
        }
    }

    async fn list(&self, prefix: &str) -> Result<BTreeSet<String>, StorageError> {
        let mut keys = BTreeSet::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);

            if let Some(token) = continuation_token {
                request = request.continuation_token(token);
            }

            let response = request.send().await.map_err(backend)?;
            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(str::to_string)),
            );

            if response.is_truncated() == Some(true) {
                continuation_token = response.next_continuation_token;
            } else {
                break;
            }
        }
        Ok(keys)
    }

    async fn delete_many(&self, keys: &[String]) -> Result<(), StorageError> {
        for batch in keys.chunks(DELETE_BATCH) {
            let objects = batch
                .iter()
                .map(|k| ObjectIdentifier::builder().key(k).build().map_err(backend))
                .collect::<Result<Vec<_>, _>>()?;
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()
                .map_err(backend)?;

            let response = self
                .client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(backend)?;
            if let Some(err) = response.errors().first() {
                return Err(backend(format!(
                    "delete of {} failed: {}",
                    err.key().unwrap_or("?"),
                    err.message().unwrap_or("unknown error")
                )));
            }
        }
        Ok(())
    }

    async fn download(&self, key: &str, local_path: &Path) -> Result<(), StorageError> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let service = e.into_service_error();
                if service.is_no_such_key() {
                    StorageError::NotFound(key.to_string())
                } else {
                    backend(service)
                }
            })?;

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut reader = resp.body.into_async_read();
        let mut file = BufWriter::new(tokio::fs::File::create(local_path).await?);
        tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
        Ok(())
    }
}
