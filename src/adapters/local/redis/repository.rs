//! Redis StatusStore implementation.
//!
//! Records are JSON strings under `reelforge:video:{id}` with one index set
//! per status. Transitions use WATCH/MULTI so concurrent writers retry
//! instead of overwriting each other.

use super::pool::RedisPool;
use super::{STATUS_PREFIX, VIDEO_PREFIX};
use crate::domain::jobs::{JobStatus, Transition, VideoId, VideoRecord};
use crate::ports::repository::{StatusStore, StoreError, MAX_CAS_RETRIES};
use async_trait::async_trait;
use chrono::Utc;
use deadpool_redis::redis::{self, AsyncCommands, Script};
use tracing::debug;

const CREATE: &str = r#"
if redis.call('SET', KEYS[1], ARGV[1], 'NX') then
    redis.call('SADD', KEYS[2], ARGV[2])
    return 1
end
return 0
"#;

fn record_key(video_id: &VideoId) -> String {
    format!("{}{}", VIDEO_PREFIX, video_id)
}

fn status_key(status: JobStatus) -> String {
    format!("{}{}", STATUS_PREFIX, status.as_str())
}

#[async_trait]
impl StatusStore for RedisPool {
    async fn create(&self, record: &VideoRecord) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let json = serde_json::to_string(record)?;
        let created: i64 = Script::new(CREATE)
            .key(record_key(&record.video_id))
            .key(status_key(record.status))
            .arg(json)
            .arg(record.video_id.as_str())
            .invoke_async(&mut conn)
            .await?;
        if created == 1 {
            Ok(())
        } else {
            Err(StoreError::AlreadyExists(record.video_id.clone()))
        }
    }

    async fn get(&self, video_id: &VideoId) -> Result<Option<VideoRecord>, StoreError> {
        let mut conn = self.conn().await?;
        let json: Option<String> = conn.get(record_key(video_id)).await?;
        match json {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn apply(
        &self,
        video_id: &VideoId,
        transition: Transition,
    ) -> Result<VideoRecord, StoreError> {
        let mut conn = self.conn().await?;
        let key = record_key(video_id);

        for attempt in 1..=MAX_CAS_RETRIES {
            let _: () = redis::cmd("WATCH").arg(&key).query_async(&mut conn).await?;

            let json: Option<String> = conn.get(&key).await?;
            let mut record: VideoRecord = match json {
                Some(data) => serde_json::from_str(&data)?,
                None => {
                    let _: () = redis::cmd("UNWATCH").query_async(&mut conn).await?;
                    return Err(StoreError::NotFound(video_id.clone()));
                }
            };

            let previous = record.status;
            if let Err(e) = record.apply(&transition, Utc::now()) {
                let _: () = redis::cmd("UNWATCH").query_async(&mut conn).await?;
                return Err(e.into());
            }
            let json = serde_json::to_string(&record)?;

            // EXEC replies nil when the watched key changed underneath us.
            let committed: Option<(i64,)> = redis::pipe()
                .atomic()
                .set(&key, json)
                .ignore()
                .srem(status_key(previous), video_id.as_str())
                .ignore()
                .sadd(status_key(record.status), video_id.as_str())
                .query_async(&mut conn)
                .await?;
            if committed.is_some() {
                return Ok(record);
            }
            debug!(video_id = %video_id, attempt, "status write raced, retrying");
        }
        Err(StoreError::Conflict(video_id.clone()))
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<VideoRecord>, StoreError> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn.smembers(status_key(status)).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids.iter().map(|id| format!("{}{}", VIDEO_PREFIX, id)).collect();
        let values: Vec<Option<String>> = redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;

        let mut records = Vec::with_capacity(values.len());
        for data in values.into_iter().flatten() {
            let record: VideoRecord = serde_json::from_str(&data)?;
            // The index can trail the record briefly; the record wins.
            if record.status == status {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        Ok(records)
    }
}
