use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::OnceLock;
use thiserror::Error;
use uuid::Uuid;

fn video_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,128}$").expect("static regex"))
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid video id {0:?}: expected 1-128 characters of [A-Za-z0-9_-]")]
pub struct InvalidVideoId(pub String);

/// Opaque identity of a video. Doubles as the queue's deduplication key and
/// as a path component in object keys, hence the restricted alphabet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VideoId(String);

impl VideoId {
    pub fn new(raw: impl Into<String>) -> Result<Self, InvalidVideoId> {
        let raw = raw.into();
        if video_id_pattern().is_match(&raw) {
            Ok(Self(raw))
        } else {
            Err(InvalidVideoId(raw))
        }
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for VideoId {
    type Error = InvalidVideoId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<VideoId> for String {
    fn from(id: VideoId) -> Self {
        id.0
    }
}

impl fmt::Display for VideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where the original upload lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SourceLocation {
    /// Key in the object store.
    ObjectKey(String),
    /// Path readable by the worker processes.
    LocalPath(PathBuf),
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceLocation::ObjectKey(key) => write!(f, "object:{}", key),
            SourceLocation::LocalPath(path) => write!(f, "file:{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Submitted,
    Processing,
    Processed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Submitted,
        JobStatus::Processing,
        JobStatus::Processed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Submitted => "SUBMITTED",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Processed => "PROCESSED",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == raw)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A requested change to a [`VideoRecord`]. Every status store applies
/// transitions through [`VideoRecord::apply`] so the rules live in one place.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// A worker took the job off the queue.
    Claim,
    /// The lease holder is still alive.
    Heartbeat,
    /// Artifacts were verified complete.
    Complete,
    Fail { reason: String },
    /// Force a PROCESSING record whose `updated_at` has not moved since it
    /// was observed by the sweep.
    ExpireStale {
        observed_updated_at: DateTime<Utc>,
        reason: String,
    },
    /// The sweep is about to re-enqueue a FAILED record. Counted before the
    /// enqueue so a worker claiming the job right away cannot skip the count.
    Requeue { max_recoveries: u32 },
    /// Undo a [`Transition::Requeue`] whose enqueue did not go through.
    /// `counted` is the attempt count the requeue produced.
    RevertRequeue { counted: u32 },
}

impl Transition {
    fn name(&self) -> &'static str {
        match self {
            Transition::Claim => "claim",
            Transition::Heartbeat => "heartbeat",
            Transition::Complete => "complete",
            Transition::Fail { .. } => "fail",
            Transition::ExpireStale { .. } => "expire_stale",
            Transition::Requeue { .. } => "requeue",
            Transition::RevertRequeue { .. } => "revert_requeue",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("cannot {transition} a job in status {from}")]
    InvalidFrom {
        transition: &'static str,
        from: JobStatus,
    },
    #[error("record changed since it was observed as stale")]
    NoLongerStale,
    #[error("recovery attempts exhausted ({attempts}/{max})")]
    RecoveriesExhausted { attempts: u32, max: u32 },
    #[error("attempt count moved from {expected} to {actual}")]
    AttemptsChanged { expected: u32, actual: u32 },
}

/// Durable processing state of one video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoRecord {
    pub video_id: VideoId,
    pub source: SourceLocation,
    pub status: JobStatus,
    /// Number of recovery re-queues performed by the sweep.
    pub attempts: u32,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped on every write, used for compare-and-set by the stores.
    pub version: u64,
}

impl VideoRecord {
    pub fn submitted(video_id: VideoId, source: SourceLocation) -> Self {
        let now = Utc::now();
        Self {
            video_id,
            source,
            status: JobStatus::Submitted,
            attempts: 0,
            reason: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn is_exhausted(&self, max_recoveries: u32) -> bool {
        self.status == JobStatus::Failed && self.attempts >= max_recoveries
    }

    pub fn apply(&mut self, transition: &Transition, now: DateTime<Utc>) -> Result<(), TransitionError> {
        use JobStatus::*;

        let invalid = |from| TransitionError::InvalidFrom {
            transition: transition.name(),
            from,
        };

        match transition {
            Transition::Claim => match self.status {
                Submitted | Failed | Processing => {
                    self.status = Processing;
                    self.reason = None;
                }
                from => return Err(invalid(from)),
            },
            Transition::Heartbeat => {
                if self.status != Processing {
                    return Err(invalid(self.status));
                }
            }
            Transition::Complete => match self.status {
                Processing => {
                    self.status = Processed;
                    self.reason = None;
                }
                from => return Err(invalid(from)),
            },
            Transition::Fail { reason } => match self.status {
                Submitted | Processing => {
                    self.status = Failed;
                    self.reason = Some(reason.clone());
                }
                from => return Err(invalid(from)),
            },
            Transition::ExpireStale {
                observed_updated_at,
                reason,
            } => {
                if self.status != Processing {
                    return Err(invalid(self.status));
                }
                if self.updated_at != *observed_updated_at {
                    return Err(TransitionError::NoLongerStale);
                }
                self.status = Failed;
                self.reason = Some(reason.clone());
            }
            Transition::Requeue { max_recoveries } => {
                if self.status != Failed {
                    return Err(invalid(self.status));
                }
                if self.attempts >= *max_recoveries {
                    return Err(TransitionError::RecoveriesExhausted {
                        attempts: self.attempts,
                        max: *max_recoveries,
                    });
                }
                self.attempts += 1;
            }
            Transition::RevertRequeue { counted } => {
                if self.status != Failed {
                    return Err(invalid(self.status));
                }
                if self.attempts != *counted || *counted == 0 {
                    return Err(TransitionError::AttemptsChanged {
                        expected: *counted,
                        actual: self.attempts,
                    });
                }
                self.attempts -= 1;
            }
        }

        self.updated_at = now;
        self.version += 1;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("malformed job payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("payload is for video {payload} but was queued as {key}")]
    KeyMismatch { key: String, payload: String },
}

/// Versioned job payload carried by the queue. New kinds get a new variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum JobPayload {
    #[serde(rename = "transcode.v1")]
    TranscodeV1 {
        video_id: VideoId,
        source: SourceLocation,
        /// 0 for the submission, n for the sweep's n-th recovery.
        #[serde(default)]
        recovery: u32,
    },
}

impl JobPayload {
    pub fn transcode(video_id: VideoId, source: SourceLocation) -> Self {
        JobPayload::TranscodeV1 {
            video_id,
            source,
            recovery: 0,
        }
    }

    pub fn with_recovery(self, n: u32) -> Self {
        match self {
            JobPayload::TranscodeV1 {
                video_id, source, ..
            } => JobPayload::TranscodeV1 {
                video_id,
                source,
                recovery: n,
            },
        }
    }

    pub fn video_id(&self) -> &VideoId {
        match self {
            JobPayload::TranscodeV1 { video_id, .. } => video_id,
        }
    }

    pub fn recovery(&self) -> u32 {
        match self {
            JobPayload::TranscodeV1 { recovery, .. } => *recovery,
        }
    }

    pub fn encode(&self) -> Result<String, PayloadError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a payload taken off the queue and check it belongs to the key
    /// it was delivered under.
    pub fn decode(key: &VideoId, raw: &str) -> Result<Self, PayloadError> {
        let payload: JobPayload = serde_json::from_str(raw)?;
        if payload.video_id() != key {
            return Err(PayloadError::KeyMismatch {
                key: key.to_string(),
                payload: payload.video_id().to_string(),
            });
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(status: JobStatus) -> VideoRecord {
        let mut record = VideoRecord::submitted(
            VideoId::new("vid-1").unwrap(),
            SourceLocation::ObjectKey("uploads/vid-1/source".into()),
        );
        record.status = status;
        record
    }

    #[test]
    fn test_video_id_validation() {
        assert!(VideoId::new("3f6c1a2e-aaaa-bbbb-cccc-0123456789ab").is_ok());
        assert!(VideoId::new("").is_err());
        assert!(VideoId::new("../etc").is_err());
        assert!(VideoId::new("a/b").is_err());
        assert!(VideoId::new("x".repeat(129)).is_err());
    }

    #[test]
    fn test_claim_then_complete() {
        let mut r = record(JobStatus::Submitted);
        let now = Utc::now();
        r.apply(&Transition::Claim, now).unwrap();
        assert_eq!(r.status, JobStatus::Processing);
        r.apply(&Transition::Complete, now).unwrap();
        assert_eq!(r.status, JobStatus::Processed);
        assert_eq!(r.version, 2);
    }

    #[test]
    fn test_processed_is_terminal() {
        let mut r = record(JobStatus::Processed);
        let now = Utc::now();
        for t in [
            Transition::Claim,
            Transition::Heartbeat,
            Transition::Complete,
            Transition::Fail { reason: "x".into() },
        ] {
            assert!(r.apply(&t, now).is_err(), "{:?} must be rejected", t);
        }
        assert_eq!(r.status, JobStatus::Processed);
        assert_eq!(r.version, 0);
    }

    #[test]
    fn test_complete_requires_processing() {
        let mut r = record(JobStatus::Failed);
        assert_eq!(
            r.apply(&Transition::Complete, Utc::now()),
            Err(TransitionError::InvalidFrom {
                transition: "complete",
                from: JobStatus::Failed
            })
        );
    }

    #[test]
    fn test_expire_stale_compares_updated_at() {
        let mut r = record(JobStatus::Processing);
        let observed = r.updated_at - Duration::seconds(5);
        let err = r
            .apply(
                &Transition::ExpireStale {
                    observed_updated_at: observed,
                    reason: "stuck".into(),
                },
                Utc::now(),
            )
            .unwrap_err();
        assert_eq!(err, TransitionError::NoLongerStale);

        let observed = r.updated_at;
        r.apply(
            &Transition::ExpireStale {
                observed_updated_at: observed,
                reason: "stuck".into(),
            },
            Utc::now(),
        )
        .unwrap();
        assert_eq!(r.status, JobStatus::Failed);
        assert_eq!(r.reason.as_deref(), Some("stuck"));
    }

    #[test]
    fn test_requeue_is_capped() {
        let mut r = record(JobStatus::Failed);
        let now = Utc::now();
        r.apply(&Transition::Requeue { max_recoveries: 2 }, now).unwrap();
        r.apply(&Transition::Requeue { max_recoveries: 2 }, now).unwrap();
        assert_eq!(r.attempts, 2);
        assert!(r.is_exhausted(2));
        assert_eq!(
            r.apply(&Transition::Requeue { max_recoveries: 2 }, now),
            Err(TransitionError::RecoveriesExhausted { attempts: 2, max: 2 })
        );
    }

    #[test]
    fn test_revert_requeue_only_undoes_its_own_count() {
        let mut r = record(JobStatus::Failed);
        let now = Utc::now();
        r.apply(&Transition::Requeue { max_recoveries: 3 }, now).unwrap();
        r.apply(&Transition::RevertRequeue { counted: 1 }, now).unwrap();
        assert_eq!(r.attempts, 0);

        r.apply(&Transition::Requeue { max_recoveries: 3 }, now).unwrap();
        r.apply(&Transition::Requeue { max_recoveries: 3 }, now).unwrap();
        assert_eq!(
            r.apply(&Transition::RevertRequeue { counted: 1 }, now),
            Err(TransitionError::AttemptsChanged { expected: 1, actual: 2 })
        );

        r.apply(&Transition::Claim, now).unwrap();
        assert!(r.apply(&Transition::RevertRequeue { counted: 2 }, now).is_err());
        assert_eq!(r.attempts, 2);
    }

    #[test]
    fn test_payload_is_tagged() {
        let payload = JobPayload::transcode(
            VideoId::new("vid-1").unwrap(),
            SourceLocation::ObjectKey("uploads/vid-1/source".into()),
        );
        let json = payload.encode().unwrap();
        assert!(json.contains(r#""kind":"transcode.v1""#));

        let key = VideoId::new("vid-1").unwrap();
        assert_eq!(JobPayload::decode(&key, &json).unwrap(), payload);

        let recovered = payload.clone().with_recovery(2);
        assert_eq!(recovered.recovery(), 2);
        assert_eq!(recovered.video_id(), payload.video_id());

        // Payloads queued before the recovery field existed decode as 0.
        let legacy = r#"{"kind":"transcode.v1","video_id":"vid-1","source":{"type":"object_key","value":"k"}}"#;
        assert_eq!(JobPayload::decode(&key, legacy).unwrap().recovery(), 0);
    }

    #[test]
    fn test_payload_decode_rejects_unknown_and_mismatched() {
        let key = VideoId::new("vid-1").unwrap();
        assert!(matches!(
            JobPayload::decode(&key, r#"{"kind":"thumbnail.v9","video_id":"vid-1"}"#),
            Err(PayloadError::Malformed(_))
        ));
        assert!(matches!(
            JobPayload::decode(&key, r#"{"videoId":"vid-1","s3Key":"x"}"#),
            Err(PayloadError::Malformed(_))
        ));

        let other = JobPayload::transcode(
            VideoId::new("vid-2").unwrap(),
            SourceLocation::ObjectKey("k".into()),
        );
        assert!(matches!(
            JobPayload::decode(&key, &other.encode().unwrap()),
            Err(PayloadError::KeyMismatch { .. })
        ));
    }

    #[test]
    fn test_payload_rejects_invalid_video_id() {
        let key = VideoId::new("vid-1").unwrap();
        let raw = r#"{"kind":"transcode.v1","video_id":"../x","source":{"type":"object_key","value":"k"}}"#;
        assert!(JobPayload::decode(&key, raw).is_err());
    }
}
