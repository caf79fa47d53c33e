use crate::domain::jobs::{JobPayload, JobStatus, Transition, TransitionError};
use crate::ports::queue::{Delivery, FailOutcome, JobQueue};
use crate::ports::repository::{StatusStore, StoreError};
use crate::ports::transcoder::Transcoder;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, info_span, warn, Instrument};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Jobs in flight per worker process.
    pub concurrency: usize,
    /// Sleep between claims when the queue is empty.
    pub poll_interval: Duration,
    /// Queue lease length; renewed every third of it.
    pub lease: Duration,
    /// How long shutdown waits for in-flight jobs.
    pub drain_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            poll_interval: Duration::from_secs(1),
            lease: Duration::from_secs(60),
            drain_timeout: Duration::from_secs(60),
        }
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Processed,
    Failed(FailOutcome),
    /// The video was already processed; the delivery was acknowledged.
    Skipped,
    /// The job can never run (bad payload, unknown video).
    Dropped,
}

struct JobContext<Q, R, T> {
    queue: Arc<Q>,
    store: Arc<R>,
    transcoder: Arc<T>,
    lease: Duration,
}

/// Claims jobs and runs them through the transcoder with bounded concurrency.
pub struct WorkerService<Q, R, T> {
    ctx: Arc<JobContext<Q, R, T>>,
    config: WorkerConfig,
    semaphore: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
}

impl<Q, R, T> WorkerService<Q, R, T>
where
    Q: JobQueue + 'static,
    R: StatusStore + 'static,
    T: Transcoder + 'static,
{
    pub fn new(queue: Arc<Q>, store: Arc<R>, transcoder: Arc<T>, config: WorkerConfig) -> Self {
        let concurrency = config.concurrency.max(1);
        let (shutdown, _) = watch::channel(false);
        Self {
            ctx: Arc::new(JobContext {
                queue,
                store,
                transcoder,
                lease: config.lease,
            }),
            semaphore: Arc::new(Semaphore::new(concurrency)),
            config: WorkerConfig {
                concurrency,
                ..config
            },
            shutdown,
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub async fn run_worker_loop(&self, worker_id: usize) {
        info!(
            worker = worker_id,
            concurrency = self.config.concurrency,
            "worker started"
        );
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown_rx.changed() => continue,
            };

            match self.ctx.queue.claim().await {
                Ok(Some(delivery)) => {
                    let ctx = Arc::clone(&self.ctx);
                    let span = info_span!(
                        "job",
                        worker = worker_id,
                        video_id = %delivery.video_id,
                        attempt = delivery.attempt
                    );
                    tokio::spawn(
                        async move {
                            let _permit = permit;
                            let outcome = process_delivery(&ctx, delivery).await;
                            debug!(?outcome, "delivery finished");
                        }
                        .instrument(span),
                    );
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = shutdown_rx.changed() => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    warn!(worker = worker_id, error = %e, "claim failed");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }

        info!(worker = worker_id, "draining in-flight jobs");
        let all = self.config.concurrency as u32;
        if tokio::time::timeout(self.config.drain_timeout, self.semaphore.acquire_many(all))
            .await
            .is_err()
        {
            warn!(worker = worker_id, "drain timed out, abandoning in-flight jobs");
        }
        info!(worker = worker_id, "worker stopped");
    }

    /// Run one delivery to completion on the current task.
    pub async fn handle(&self, delivery: Delivery) -> DeliveryOutcome {
        process_delivery(&self.ctx, delivery).await
    }
}

async fn process_delivery<Q, R, T>(ctx: &JobContext<Q, R, T>, delivery: Delivery) -> DeliveryOutcome
where
    Q: JobQueue + 'static,
    R: StatusStore + 'static,
    T: Transcoder + 'static,
{
    let video_id = delivery.video_id.clone();

    let payload = match JobPayload::decode(&video_id, &delivery.payload) {
        Ok(payload) => payload,
        Err(e) => {
            error!(error = %e, "dropping undecodable job");
            let reason = e.to_string();
            if let Err(e) = ctx.store.apply(&video_id, Transition::Fail { reason: reason.clone() }).await {
                debug!(error = %e, "no status record to fail");
            }
            return fail_delivery(ctx, &delivery, &reason, true).await;
        }
    };
    let JobPayload::TranscodeV1 { source, .. } = payload;

    match ctx.store.apply(&video_id, Transition::Claim).await {
        Ok(_) => {}
        Err(StoreError::Rejected(TransitionError::InvalidFrom {
            from: JobStatus::Processed,
            ..
        })) => {
            info!("already processed, acknowledging");
            if let Err(e) = ctx.queue.complete(&delivery).await {
                warn!(error = %e, "failed to acknowledge delivery");
            }
            return DeliveryOutcome::Skipped;
        }
        Err(StoreError::NotFound(_)) => {
            error!("no status record, dropping job");
            return fail_delivery(ctx, &delivery, "no status record", true).await;
        }
        Err(e) => {
            warn!(error = %e, "could not claim status record");
            return fail_delivery(ctx, &delivery, &e.to_string(), false).await;
        }
    }

    let heartbeat = tokio::spawn(heartbeat(
        Arc::clone(&ctx.queue),
        Arc::clone(&ctx.store),
        delivery.clone(),
        ctx.lease,
    ));
    let result = ctx.transcoder.transcode(&video_id, &source).await;
    heartbeat.abort();

    match result {
        Ok(report) => match ctx.store.apply(&video_id, Transition::Complete).await {
            Ok(_) => {
                if let Err(e) = ctx.queue.complete(&delivery).await {
                    warn!(error = %e, "failed to acknowledge delivery");
                }
                info!(manifest = %report.manifest_key, "video processed");
                DeliveryOutcome::Processed
            }
            Err(e) => {
                warn!(error = %e, "could not mark processed");
                settle_unrecorded(ctx, &delivery, e).await
            }
        },
        Err(e) => {
            let reason = e.to_string();
            if let Err(store_err) = ctx
                .store
                .apply(&video_id, Transition::Fail { reason: reason.clone() })
                .await
            {
                warn!(error = %store_err, "could not record failure");
            }
            fail_delivery(ctx, &delivery, &reason, false).await
        }
    }
}

/// The artifact set is published and verified but the Complete write was
/// refused. Published artifacts must never outlive a non-PROCESSED record,
/// so either the record ends up PROCESSED or the artifacts are removed.
async fn settle_unrecorded<Q, R, T>(
    ctx: &JobContext<Q, R, T>,
    delivery: &Delivery,
    err: StoreError,
) -> DeliveryOutcome
where
    Q: JobQueue + 'static,
    R: StatusStore + 'static,
    T: Transcoder + 'static,
{
    let video_id = &delivery.video_id;
    let recorded = match err {
        StoreError::Rejected(TransitionError::InvalidFrom {
            from: JobStatus::Processed,
            ..
        }) => true,
        // The sweep expired the record while we were publishing.
        StoreError::Rejected(TransitionError::InvalidFrom {
            from: JobStatus::Failed,
            ..
        }) => match ctx.store.apply(video_id, Transition::Claim).await {
            Ok(_) => ctx.store.apply(video_id, Transition::Complete).await.is_ok(),
            Err(_) => false,
        },
        _ => false,
    };

    if recorded {
        if let Err(e) = ctx.queue.complete(delivery).await {
            warn!(error = %e, "failed to acknowledge delivery");
        }
        info!("video processed, record settled late");
        return DeliveryOutcome::Processed;
    }

    if let Err(e) = ctx.transcoder.discard(video_id).await {
        error!(error = %e, "could not remove unrecorded artifacts");
    }
    let reason = "published artifacts could not be recorded as processed".to_string();
    if let Err(e) = ctx
        .store
        .apply(video_id, Transition::Fail { reason: reason.clone() })
        .await
    {
        debug!(error = %e, "could not record failure");
    }
    fail_delivery(ctx, delivery, &reason, false).await
}

async fn fail_delivery<Q, R, T>(
    ctx: &JobContext<Q, R, T>,
    delivery: &Delivery,
    reason: &str,
    permanent: bool,
) -> DeliveryOutcome
where
    Q: JobQueue,
{
    match ctx.queue.fail(delivery, reason, permanent).await {
        Ok(outcome) => {
            match outcome {
                FailOutcome::RetryScheduled { next_attempt, delay } => {
                    info!(next_attempt, delay_ms = delay.as_millis() as u64, "retry scheduled")
                }
                FailOutcome::Exhausted { attempts } => {
                    warn!(attempts, reason, "job moved to dead state")
                }
                FailOutcome::LeaseLost => warn!("lease lost before failure was recorded"),
            }
            if permanent {
                DeliveryOutcome::Dropped
            } else {
                DeliveryOutcome::Failed(outcome)
            }
        }
        Err(e) => {
            error!(error = %e, "failed to report job failure to queue");
            DeliveryOutcome::Failed(FailOutcome::LeaseLost)
        }
    }
}

async fn heartbeat<Q, R>(queue: Arc<Q>, store: Arc<R>, delivery: Delivery, lease: Duration)
where
    Q: JobQueue,
    R: StatusStore,
{
    let period = (lease / 3).max(Duration::from_millis(100));
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        interval.tick().await;
        match queue.extend_lease(&delivery).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(video_id = %delivery.video_id, "lease lost");
                return;
            }
            Err(e) => warn!(video_id = %delivery.video_id, error = %e, "lease renewal failed"),
        }
        if let Err(e) = store.apply(&delivery.video_id, Transition::Heartbeat).await {
            warn!(video_id = %delivery.video_id, error = %e, "status heartbeat failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{MemoryQueue, MemoryStatusStore};
    use crate::domain::jobs::{SourceLocation, VideoId, VideoRecord};
    use crate::ports::queue::EnqueueOptions;
    use crate::ports::transcoder::{MockTranscoder, PipelineError, TranscodeReport};

    struct Fixture {
        queue: Arc<MemoryQueue>,
        store: Arc<MemoryStatusStore>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                queue: Arc::new(MemoryQueue::new(Duration::from_secs(30))),
                store: Arc::new(MemoryStatusStore::new()),
            }
        }

        async fn submit(&self, id: &str) -> VideoId {
            let id = VideoId::new(id).unwrap();
            let source = SourceLocation::ObjectKey(format!("uploads/{}/source", id));
            self.store
                .create(&VideoRecord::submitted(id.clone(), source.clone()))
                .await
                .unwrap();
            self.queue
                .enqueue(
                    &id,
                    &JobPayload::transcode(id.clone(), source),
                    &EnqueueOptions::default(),
                )
                .await
                .unwrap();
            id
        }

        fn worker(&self, transcoder: MockTranscoder) -> WorkerService<MemoryQueue, MemoryStatusStore, MockTranscoder> {
            WorkerService::new(
                self.queue.clone(),
                self.store.clone(),
                Arc::new(transcoder),
                WorkerConfig {
                    poll_interval: Duration::from_millis(10),
                    ..WorkerConfig::default()
                },
            )
        }

        async fn status(&self, id: &VideoId) -> VideoRecord {
            self.store.get(id).await.unwrap().unwrap()
        }
    }

    fn succeeding() -> MockTranscoder {
        let mut transcoder = MockTranscoder::new();
        transcoder.expect_transcode().returning(|id, _| {
            Ok(TranscodeReport {
                manifest_key: format!("videos/{}/master.m3u8", id),
                uploaded: 10,
            })
        });
        transcoder
    }

    #[tokio::test]
    async fn test_success_marks_processed_and_acks() {
        let fx = Fixture::new();
        let id = fx.submit("v1").await;
        let worker = fx.worker(succeeding());

        let delivery = fx.queue.claim().await.unwrap().unwrap();
        assert_eq!(worker.handle(delivery).await, DeliveryOutcome::Processed);

        assert_eq!(fx.status(&id).await.status, JobStatus::Processed);
        assert_eq!(fx.queue.pending(), 0);
        assert!(!fx.queue.is_dead(&id));
    }

    #[tokio::test]
    async fn test_failure_records_reason_and_schedules_retry() {
        let fx = Fixture::new();
        let id = fx.submit("v1").await;
        let mut transcoder = MockTranscoder::new();
        transcoder.expect_transcode().returning(|_, _| {
            Err(PipelineError::Incomplete {
                missing: vec!["videos/v1/360p.m3u8".into()],
            })
        });
        let worker = fx.worker(transcoder);

        let delivery = fx.queue.claim().await.unwrap().unwrap();
        let outcome = worker.handle(delivery).await;
        assert!(matches!(
            outcome,
            DeliveryOutcome::Failed(FailOutcome::RetryScheduled { next_attempt: 2, .. })
        ));

        let record = fx.status(&id).await;
        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.reason.unwrap().contains("360p.m3u8"));
    }

    #[tokio::test]
    async fn test_already_processed_is_skipped() {
        let fx = Fixture::new();
        let id = fx.submit("v1").await;
        fx.store.apply(&id, Transition::Claim).await.unwrap();
        fx.store.apply(&id, Transition::Complete).await.unwrap();

        let mut transcoder = MockTranscoder::new();
        transcoder.expect_transcode().never();
        let worker = fx.worker(transcoder);

        let delivery = fx.queue.claim().await.unwrap().unwrap();
        assert_eq!(worker.handle(delivery).await, DeliveryOutcome::Skipped);
        assert_eq!(fx.status(&id).await.status, JobStatus::Processed);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dropped() {
        let fx = Fixture::new();
        let mut transcoder = MockTranscoder::new();
        transcoder.expect_transcode().never();
        let worker = fx.worker(transcoder);

        let delivery = Delivery {
            video_id: VideoId::new("v1").unwrap(),
            payload: r#"{"kind":"thumbnail.v2"}"#.into(),
            attempt: 1,
            max_attempts: 3,
            lease_token: "t".into(),
        };
        assert_eq!(worker.handle(delivery).await, DeliveryOutcome::Dropped);
    }

    #[tokio::test]
    async fn test_unknown_record_is_dropped() {
        let fx = Fixture::new();
        let id = VideoId::new("orphan").unwrap();
        fx.queue
            .enqueue(
                &id,
                &JobPayload::transcode(id.clone(), SourceLocation::ObjectKey("k".into())),
                &EnqueueOptions::default(),
            )
            .await
            .unwrap();
        let mut transcoder = MockTranscoder::new();
        transcoder.expect_transcode().never();
        let worker = fx.worker(transcoder);

        let delivery = fx.queue.claim().await.unwrap().unwrap();
        assert_eq!(worker.handle(delivery).await, DeliveryOutcome::Dropped);
        assert!(fx.queue.is_dead(&id));
    }

    #[tokio::test]
    async fn test_loop_drains_queue_then_stops() {
        let fx = Fixture::new();
        let ids = vec![fx.submit("a").await, fx.submit("b").await, fx.submit("c").await];
        let worker = Arc::new(fx.worker(succeeding()));

        let runner = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.run_worker_loop(0).await })
        };

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let mut done = 0;
            for id in &ids {
                if fx.status(id).await.status == JobStatus::Processed {
                    done += 1;
                }
            }
            if done == ids.len() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "jobs did not finish");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        worker.shutdown();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap();
    }

    /// Refuses every Complete, like a store that times out on the final write.
    struct NoCompleteStore(MemoryStatusStore);

    #[async_trait::async_trait]
    impl StatusStore for NoCompleteStore {
        async fn create(&self, record: &VideoRecord) -> Result<(), StoreError> {
            self.0.create(record).await
        }
        async fn get(&self, video_id: &VideoId) -> Result<Option<VideoRecord>, StoreError> {
            self.0.get(video_id).await
        }
        async fn apply(&self, video_id: &VideoId, transition: Transition) -> Result<VideoRecord, StoreError> {
            if transition == Transition::Complete {
                return Err(StoreError::Backend("write timed out".into()));
            }
            self.0.apply(video_id, transition).await
        }
        async fn list_by_status(&self, status: JobStatus) -> Result<Vec<VideoRecord>, StoreError> {
            self.0.list_by_status(status).await
        }
    }

    #[tokio::test]
    async fn test_unrecordable_success_discards_artifacts() {
        let fx = Fixture::new();
        let id = fx.submit("v1").await;
        let store = Arc::new(NoCompleteStore(MemoryStatusStore::new()));
        store.0.insert(fx.status(&id).await);

        let mut transcoder = succeeding();
        transcoder
            .expect_discard()
            .withf(|video_id| video_id.as_str() == "v1")
            .times(1)
            .returning(|_| Ok(()));
        let worker = WorkerService::new(
            fx.queue.clone(),
            store.clone(),
            Arc::new(transcoder),
            WorkerConfig::default(),
        );

        let delivery = fx.queue.claim().await.unwrap().unwrap();
        let outcome = worker.handle(delivery).await;
        assert!(matches!(
            outcome,
            DeliveryOutcome::Failed(FailOutcome::RetryScheduled { .. })
        ));

        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.reason.unwrap().contains("could not be recorded"));
    }

    #[tokio::test]
    async fn test_record_expired_mid_run_is_reclaimed() {
        let fx = Fixture::new();
        let id = fx.submit("v1").await;

        // While the run publishes, the sweep expires the record.
        let mut expired = fx.status(&id).await;
        expired.status = JobStatus::Failed;
        expired.attempts = 1;
        expired.reason = Some("no progress, presumed abandoned".into());
        let store = fx.store.clone();

        let mut transcoder = MockTranscoder::new();
        transcoder.expect_transcode().returning(move |id, _| {
            store.insert(expired.clone());
            Ok(TranscodeReport {
                manifest_key: format!("videos/{}/master.m3u8", id),
                uploaded: 10,
            })
        });
        transcoder.expect_discard().never();
        let worker = fx.worker(transcoder);

        let delivery = fx.queue.claim().await.unwrap().unwrap();
        assert_eq!(worker.handle(delivery).await, DeliveryOutcome::Processed);

        let record = fx.status(&id).await;
        assert_eq!(record.status, JobStatus::Processed);
        assert_eq!(record.attempts, 1);
        assert_eq!(fx.queue.pending(), 0);
    }
}
