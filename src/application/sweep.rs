//! Periodic recovery of failed and abandoned jobs.

use crate::domain::jobs::{JobPayload, JobStatus, Transition, TransitionError, VideoId, VideoRecord};
use crate::ports::queue::{EnqueueOptions, EnqueueOutcome, JobQueue};
use crate::ports::repository::{StatusStore, StoreError};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub failed_interval: Duration,
    pub stuck_interval: Duration,
    /// PROCESSING records not updated for this long are presumed abandoned.
    pub stale_after: Duration,
    pub max_recoveries: u32,
    pub enqueue: EnqueueOptions,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            failed_interval: Duration::from_secs(60 * 60),
            stuck_interval: Duration::from_secs(30 * 60),
            stale_after: Duration::from_secs(30 * 60),
            max_recoveries: 3,
            enqueue: EnqueueOptions::default(),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    /// Stuck records forced to FAILED.
    pub expired: usize,
    pub requeued: usize,
    pub already_outstanding: usize,
    /// Records that hit the recovery cap and stay FAILED.
    pub exhausted: Vec<VideoId>,
    pub errors: usize,
}

impl SweepReport {
    fn merge(&mut self, other: SweepReport) {
        self.scanned += other.scanned;
        self.expired += other.expired;
        self.requeued += other.requeued;
        self.already_outstanding += other.already_outstanding;
        self.exhausted.extend(other.exhausted);
        self.errors += other.errors;
    }
}

pub struct RecoverySweep<Q, R> {
    queue: Arc<Q>,
    store: Arc<R>,
    config: SweepConfig,
}

impl<Q, R> RecoverySweep<Q, R>
where
    Q: JobQueue,
    R: StatusStore,
{
    pub fn new(queue: Arc<Q>, store: Arc<R>, config: SweepConfig) -> Self {
        Self {
            queue,
            store,
            config,
        }
    }

    /// Re-enqueue FAILED records that are still under the recovery cap.
    pub async fn sweep_failed(&self) -> Result<SweepReport, StoreError> {
        let mut report = SweepReport::default();
        for record in self.store.list_by_status(JobStatus::Failed).await? {
            report.scanned += 1;
            self.requeue(record, &mut report).await;
        }
        if !report.exhausted.is_empty() {
            warn!(
                count = report.exhausted.len(),
                videos = ?report.exhausted,
                "videos exhausted their recoveries"
            );
        }
        Ok(report)
    }

    /// Fail PROCESSING records whose heartbeat stopped, then re-enqueue them.
    pub async fn sweep_stuck(&self) -> Result<SweepReport, StoreError> {
        let mut report = SweepReport::default();
        let stale_after = chrono::Duration::from_std(self.config.stale_after)
            .unwrap_or_else(|_| chrono::Duration::MAX);
        let now = Utc::now();

        for record in self.store.list_by_status(JobStatus::Processing).await? {
            report.scanned += 1;
            if now.signed_duration_since(record.updated_at) <= stale_after {
                continue;
            }

            let transition = Transition::ExpireStale {
                observed_updated_at: record.updated_at,
                reason: format!(
                    "no progress since {}, presumed abandoned",
                    record.updated_at.to_rfc3339()
                ),
            };
            match self.store.apply(&record.video_id, transition).await {
                Ok(failed) => {
                    warn!(video_id = %failed.video_id, "expired stuck job");
                    report.expired += 1;
                    self.requeue(failed, &mut report).await;
                }
                Err(StoreError::Rejected(e)) => {
                    debug!(video_id = %record.video_id, reason = %e, "stuck job moved on");
                }
                Err(e) => {
                    error!(video_id = %record.video_id, error = %e, "failed to expire stuck job");
                    report.errors += 1;
                }
            }
        }
        Ok(report)
    }

    /// One stuck pass followed by one failed pass.
    pub async fn run_once(&self) -> Result<SweepReport, StoreError> {
        let mut report = self.sweep_stuck().await?;
        report.merge(self.sweep_failed().await?);
        Ok(report)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            failed_every = ?self.config.failed_interval,
            stuck_every = ?self.config.stuck_interval,
            "recovery sweep started"
        );
        let mut failed = interval_at(
            Instant::now() + self.config.failed_interval,
            self.config.failed_interval,
        );
        let mut stuck = interval_at(
            Instant::now() + self.config.stuck_interval,
            self.config.stuck_interval,
        );
        failed.set_missed_tick_behavior(MissedTickBehavior::Delay);
        stuck.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = failed.tick() => match self.sweep_failed().await {
                    Ok(report) => info!(requeued = report.requeued, exhausted = report.exhausted.len(), "failed sweep done"),
                    Err(e) => error!(error = %e, "failed sweep aborted"),
                },
                _ = stuck.tick() => match self.sweep_stuck().await {
                    Ok(report) => info!(expired = report.expired, requeued = report.requeued, "stuck sweep done"),
                    Err(e) => error!(error = %e, "stuck sweep aborted"),
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("recovery sweep stopped");
    }

    async fn requeue(&self, record: VideoRecord, report: &mut SweepReport) {
        let max = self.config.max_recoveries;
        if record.is_exhausted(max) {
            report.exhausted.push(record.video_id);
            return;
        }

        // Count first: once enqueued, a worker may claim the job before we
        // get another write in.
        let counted = match self
            .store
            .apply(&record.video_id, Transition::Requeue { max_recoveries: max })
            .await
        {
            Ok(updated) => updated,
            Err(StoreError::Rejected(TransitionError::RecoveriesExhausted { .. })) => {
                report.exhausted.push(record.video_id);
                return;
            }
            Err(StoreError::Rejected(e)) => {
                debug!(video_id = %record.video_id, reason = %e, "record moved on before requeue");
                return;
            }
            Err(e) => {
                error!(video_id = %record.video_id, error = %e, "could not count recovery");
                report.errors += 1;
                return;
            }
        };

        let payload = JobPayload::transcode(record.video_id.clone(), record.source.clone())
            .with_recovery(counted.attempts);
        match self
            .queue
            .enqueue(&record.video_id, &payload, &self.config.enqueue)
            .await
        {
            Ok(EnqueueOutcome::Enqueued) => {
                info!(
                    video_id = %counted.video_id,
                    attempts = counted.attempts,
                    max,
                    "re-enqueued job"
                );
                report.requeued += 1;
            }
            Ok(EnqueueOutcome::AlreadyOutstanding) => {
                debug!(video_id = %record.video_id, "job already outstanding");
                report.already_outstanding += 1;
                self.revert(&counted).await;
            }
            Err(e) => {
                error!(video_id = %record.video_id, error = %e, "failed to re-enqueue");
                report.errors += 1;
                self.revert(&counted).await;
            }
        }
    }

    /// Give back a recovery that never reached the queue.
    async fn revert(&self, counted: &VideoRecord) {
        let transition = Transition::RevertRequeue {
            counted: counted.attempts,
        };
        if let Err(e) = self.store.apply(&counted.video_id, transition).await {
            warn!(
                video_id = %counted.video_id,
                attempts = counted.attempts,
                error = %e,
                "recovery stays counted"
            );
        }
    }
}
