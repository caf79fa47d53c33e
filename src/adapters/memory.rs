//! In-process adapters. State lives in this process only, so these back tests
//! and single-process runs, never a multi-process pool.

use crate::domain::jobs::{JobPayload, JobStatus, Transition, VideoId, VideoRecord};
use crate::ports::queue::{
    encode_for, Delivery, EnqueueOptions, EnqueueOutcome, FailOutcome, JobQueue, QueueError,
};
use crate::ports::repository::{StatusStore, StoreError};
use crate::ports::storage::{ObjectBody, ObjectStore, StorageError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::TryStreamExt;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Waiting,
    Delayed { ready_at: Instant },
    Active { lease_until: Instant },
    Completed,
    Dead,
}

#[derive(Debug)]
struct QueueEntry {
    payload: String,
    options: EnqueueOptions,
    state: EntryState,
    attempts: u32,
    token: Option<String>,
    last_error: Option<String>,
}

impl QueueEntry {
    fn is_outstanding(&self, now: Instant) -> bool {
        match self.state {
            EntryState::Waiting | EntryState::Delayed { .. } => true,
            EntryState::Active { lease_until } => lease_until > now,
            EntryState::Completed | EntryState::Dead => false,
        }
    }

    fn holds(&self, delivery: &Delivery) -> bool {
        matches!(self.state, EntryState::Active { .. })
            && self.token.as_deref() == Some(delivery.lease_token.as_str())
    }
}

#[derive(Default)]
struct QueueInner {
    entries: HashMap<VideoId, QueueEntry>,
    ready: VecDeque<VideoId>,
}

pub struct MemoryQueue {
    lease: Duration,
    inner: Mutex<QueueInner>,
}

impl MemoryQueue {
    pub fn new(lease: Duration) -> Self {
        Self {
            lease,
            inner: Mutex::new(QueueInner::default()),
        }
    }

    /// Number of jobs waiting or delayed.
    pub fn pending(&self) -> usize {
        lock(&self.inner)
            .entries
            .values()
            .filter(|e| matches!(e.state, EntryState::Waiting | EntryState::Delayed { .. }))
            .count()
    }

    pub fn is_dead(&self, video_id: &VideoId) -> bool {
        lock(&self.inner)
            .entries
            .get(video_id)
            .is_some_and(|e| e.state == EntryState::Dead)
    }

    pub fn last_error(&self, video_id: &VideoId) -> Option<String> {
        lock(&self.inner)
            .entries
            .get(video_id)
            .and_then(|e| e.last_error.clone())
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(
        &self,
        video_id: &VideoId,
        payload: &JobPayload,
        options: &EnqueueOptions,
    ) -> Result<EnqueueOutcome, QueueError> {
        let raw = encode_for(video_id, payload)?;
        let now = Instant::now();
        let mut inner = lock(&self.inner);

        if inner
            .entries
            .get(video_id)
            .is_some_and(|e| e.is_outstanding(now))
        {
            return Ok(EnqueueOutcome::AlreadyOutstanding);
        }

        inner.entries.insert(
            video_id.clone(),
            QueueEntry {
                payload: raw,
                options: options.clone(),
                state: EntryState::Waiting,
                attempts: 0,
                token: None,
                last_error: None,
            },
        );
        inner.ready.push_back(video_id.clone());
        Ok(EnqueueOutcome::Enqueued)
    }

    async fn claim(&self) -> Result<Option<Delivery>, QueueError> {
        let now = Instant::now();
        let mut guard = lock(&self.inner);
        let inner = &mut *guard;

        let mut due: Vec<(Instant, VideoId)> = inner
            .entries
            .iter()
            .filter_map(|(id, e)| match e.state {
                EntryState::Delayed { ready_at } if ready_at <= now => Some((ready_at, id.clone())),
                _ => None,
            })
            .collect();
        due.sort();
        for (_, id) in due {
            if let Some(entry) = inner.entries.get_mut(&id) {
                entry.state = EntryState::Waiting;
                inner.ready.push_back(id);
            }
        }

        while let Some(id) = inner.ready.pop_front() {
            let Some(entry) = inner.entries.get_mut(&id) else {
                continue;
            };
            if entry.state != EntryState::Waiting {
                continue;
            }
            let token = Uuid::new_v4().to_string();
            entry.state = EntryState::Active {
                lease_until: now + self.lease,
            };
            entry.attempts += 1;
            entry.token = Some(token.clone());
            return Ok(Some(Delivery {
                video_id: id,
                payload: entry.payload.clone(),
                attempt: entry.attempts,
                max_attempts: entry.options.max_attempts,
                lease_token: token,
            }));
        }
        Ok(None)
    }

    async fn extend_lease(&self, delivery: &Delivery) -> Result<bool, QueueError> {
        let now = Instant::now();
        let mut inner = lock(&self.inner);
        match inner.entries.get_mut(&delivery.video_id) {
            Some(entry) if entry.holds(delivery) => {
                entry.state = EntryState::Active {
                    lease_until: now + self.lease,
                };
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut inner = lock(&self.inner);
        let retain = match inner.entries.get_mut(&delivery.video_id) {
            Some(entry) if entry.holds(delivery) => {
                entry.state = EntryState::Completed;
                entry.token = None;
                entry.options.retain_completed
            }
            _ => return Ok(()),
        };
        if !retain {
            inner.entries.remove(&delivery.video_id);
        }
        Ok(())
    }

    async fn fail(
        &self,
        delivery: &Delivery,
        reason: &str,
        permanent: bool,
    ) -> Result<FailOutcome, QueueError> {
        let now = Instant::now();
        let mut inner = lock(&self.inner);
        let Some(entry) = inner.entries.get_mut(&delivery.video_id) else {
            return Ok(FailOutcome::LeaseLost);
        };
        if !entry.holds(delivery) {
            return Ok(FailOutcome::LeaseLost);
        }

        entry.token = None;
        entry.last_error = Some(reason.to_string());

        if permanent || entry.attempts >= entry.options.max_attempts {
            let attempts = entry.attempts;
            entry.state = EntryState::Dead;
            if !entry.options.retain_failed {
                inner.entries.remove(&delivery.video_id);
            }
            return Ok(FailOutcome::Exhausted { attempts });
        }

        let delay = entry.options.backoff_for(entry.attempts);
        entry.state = EntryState::Delayed {
            ready_at: now + delay,
        };
        Ok(FailOutcome::RetryScheduled {
            next_attempt: entry.attempts + 1,
            delay,
        })
    }
}

#[derive(Default)]
pub struct MemoryStatusStore {
    records: Mutex<HashMap<VideoId, VideoRecord>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record as-is, bypassing transition checks.
    pub fn insert(&self, record: VideoRecord) {
        lock(&self.records).insert(record.video_id.clone(), record);
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn create(&self, record: &VideoRecord) -> Result<(), StoreError> {
        let mut records = lock(&self.records);
        if records.contains_key(&record.video_id) {
            return Err(StoreError::AlreadyExists(record.video_id.clone()));
        }
        records.insert(record.video_id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, video_id: &VideoId) -> Result<Option<VideoRecord>, StoreError> {
        Ok(lock(&self.records).get(video_id).cloned())
    }

    async fn apply(
        &self,
        video_id: &VideoId,
        transition: Transition,
    ) -> Result<VideoRecord, StoreError> {
        let mut records = lock(&self.records);
        let record = records
            .get_mut(video_id)
            .ok_or_else(|| StoreError::NotFound(video_id.clone()))?;
        let mut next = record.clone();
        next.apply(&transition, Utc::now())?;
        *record = next.clone();
        Ok(next)
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<VideoRecord>, StoreError> {
        let mut out: Vec<VideoRecord> = lock(&self.records)
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        Ok(out)
    }
}

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Bytes>>,
    reject: Mutex<Option<String>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later `put` whose key contains `pattern` fail.
    pub fn reject_keys_containing(&self, pattern: impl Into<String>) {
        *lock(&self.reject) = Some(pattern.into());
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        lock(&self.objects).get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        lock(&self.objects).keys().cloned().collect()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, body: ObjectBody) -> Result<(), StorageError> {
        if let Some(pattern) = lock(&self.reject).as_deref() {
            if key.contains(pattern) {
                return Err(StorageError::Backend(format!("put rejected for {}", key)));
            }
        }

        let bytes = match body {
            ObjectBody::Bytes(b) => b,
            ObjectBody::File(path) => Bytes::from(tokio::fs::read(&path).await?),
            ObjectBody::Stream(stream) => stream
                .try_fold(BytesMut::new(), |mut acc, chunk| async move {
                    acc.extend_from_slice(&chunk);
                    Ok(acc)
                })
                .await?
                .freeze(),
        };
        lock(&self.objects).insert(key.to_string(), bytes);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<BTreeSet<String>, StorageError> {
        Ok(lock(&self.objects)
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<(), StorageError> {
        let mut objects = lock(&self.objects);
        for key in keys {
            objects.remove(key);
        }
        Ok(())
    }

    async fn download(&self, key: &str, local_path: &Path) -> Result<(), StorageError> {
        let bytes = self
            .object(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local_path, &bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::jobs::SourceLocation;

    fn job(id: &str) -> (VideoId, JobPayload) {
        let id = VideoId::new(id).unwrap();
        let payload = JobPayload::transcode(id.clone(), SourceLocation::ObjectKey("k".into()));
        (id, payload)
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_is_rejected() {
        let queue = MemoryQueue::new(Duration::from_secs(30));
        let (id, payload) = job("v1");
        let options = EnqueueOptions::default();

        assert_eq!(
            queue.enqueue(&id, &payload, &options).await.unwrap(),
            EnqueueOutcome::Enqueued
        );
        assert_eq!(
            queue.enqueue(&id, &payload, &options).await.unwrap(),
            EnqueueOutcome::AlreadyOutstanding
        );

        let delivery = queue.claim().await.unwrap().unwrap();
        assert_eq!(
            queue.enqueue(&id, &payload, &options).await.unwrap(),
            EnqueueOutcome::AlreadyOutstanding
        );
        assert!(queue.claim().await.unwrap().is_none());

        queue.complete(&delivery).await.unwrap();
        assert_eq!(
            queue.enqueue(&id, &payload, &options).await.unwrap(),
            EnqueueOutcome::Enqueued
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_backs_off_then_dies() {
        let queue = MemoryQueue::new(Duration::from_secs(30));
        let (id, payload) = job("v1");
        queue
            .enqueue(&id, &payload, &EnqueueOptions::default())
            .await
            .unwrap();

        let first = queue.claim().await.unwrap().unwrap();
        assert_eq!(first.attempt, 1);
        assert_eq!(
            queue.fail(&first, "boom", false).await.unwrap(),
            FailOutcome::RetryScheduled {
                next_attempt: 2,
                delay: Duration::from_secs(1)
            }
        );
        assert!(queue.claim().await.unwrap().is_none());

        tokio::time::advance(Duration::from_millis(1001)).await;
        let second = queue.claim().await.unwrap().unwrap();
        assert_eq!(second.attempt, 2);
        assert_eq!(
            queue.fail(&second, "boom", false).await.unwrap(),
            FailOutcome::RetryScheduled {
                next_attempt: 3,
                delay: Duration::from_secs(2)
            }
        );

        tokio::time::advance(Duration::from_secs(2)).await;
        let third = queue.claim().await.unwrap().unwrap();
        assert_eq!(
            queue.fail(&third, "boom", false).await.unwrap(),
            FailOutcome::Exhausted { attempts: 3 }
        );
        assert!(queue.is_dead(&id));
        assert_eq!(queue.last_error(&id).as_deref(), Some("boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_token_is_ignored() {
        let queue = MemoryQueue::new(Duration::from_secs(10));
        let (id, payload) = job("v1");
        let options = EnqueueOptions::default();
        queue.enqueue(&id, &payload, &options).await.unwrap();
        let stale = queue.claim().await.unwrap().unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(
            queue.enqueue(&id, &payload, &options).await.unwrap(),
            EnqueueOutcome::Enqueued
        );
        let fresh = queue.claim().await.unwrap().unwrap();

        assert!(!queue.extend_lease(&stale).await.unwrap());
        assert_eq!(
            queue.fail(&stale, "late", false).await.unwrap(),
            FailOutcome::LeaseLost
        );
        queue.complete(&stale).await.unwrap();
        assert!(queue.extend_lease(&fresh).await.unwrap());
    }

    #[tokio::test]
    async fn test_permanent_failure_skips_retries() {
        let queue = MemoryQueue::new(Duration::from_secs(30));
        let (id, payload) = job("v1");
        queue
            .enqueue(&id, &payload, &EnqueueOptions::default())
            .await
            .unwrap();
        let delivery = queue.claim().await.unwrap().unwrap();
        assert_eq!(
            queue.fail(&delivery, "bad payload", true).await.unwrap(),
            FailOutcome::Exhausted { attempts: 1 }
        );
    }

    #[tokio::test]
    async fn test_status_store_rejects_invalid_transition() {
        let store = MemoryStatusStore::new();
        let (id, _) = job("v1");
        store
            .create(&VideoRecord::submitted(
                id.clone(),
                SourceLocation::ObjectKey("k".into()),
            ))
            .await
            .unwrap();

        assert!(matches!(
            store.apply(&id, Transition::Complete).await,
            Err(StoreError::Rejected(_))
        ));
        let record = store.apply(&id, Transition::Claim).await.unwrap();
        assert_eq!(record.status, JobStatus::Processing);
        assert_eq!(
            store.list_by_status(JobStatus::Processing).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_object_store_prefix_listing() {
        let store = MemoryObjectStore::new();
        for key in ["videos/a/master.m3u8", "videos/a/1080p.m3u8", "videos/ab/x.ts"] {
            store
                .put(key, ObjectBody::Bytes(Bytes::from_static(b"x")))
                .await
                .unwrap();
        }
        let listed = store.list("videos/a/").await.unwrap();
        assert_eq!(listed.len(), 2);

        store
            .delete_many(&listed.into_iter().collect::<Vec<_>>())
            .await
            .unwrap();
        assert_eq!(store.keys(), vec!["videos/ab/x.ts".to_string()]);
    }
}
