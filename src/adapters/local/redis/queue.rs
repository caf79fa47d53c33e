//! Redis JobQueue implementation.
//!
//! Each job is a hash under `reelforge:job:{id}`. Ready ids sit in a list,
//! retries in a sorted set scored by due time. A leased job keeps its
//! expiry in the hash's `lease_until`; nothing scans for expired leases,
//! the recovery sweep re-enqueues those and ENQUEUE takes over the hash.
//! Every state change is one Lua script so a crash between commands
//! cannot leave a job half-moved.

use super::pool::RedisPool;
use super::{DELAYED_SET, JOB_PREFIX, WAITING_LIST};
use crate::domain::jobs::{JobPayload, VideoId};
use crate::ports::queue::{
    encode_for, Delivery, EnqueueOptions, EnqueueOutcome, FailOutcome, JobQueue, QueueError,
};
use async_trait::async_trait;
use chrono::Utc;
use deadpool_redis::redis::Script;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

const ENQUEUE: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state')
if state == 'waiting' or state == 'delayed' then
    return 0
end
if state == 'active' then
    local lease_until = tonumber(redis.call('HGET', KEYS[1], 'lease_until') or '0')
    if lease_until > tonumber(ARGV[7]) then
        return 0
    end
end
redis.call('DEL', KEYS[1])
redis.call('ZREM', KEYS[3], ARGV[1])
redis.call('HSET', KEYS[1],
    'payload', ARGV[2], 'state', 'waiting', 'attempts', 0,
    'max_attempts', ARGV[3], 'backoff_ms', ARGV[4],
    'retain_completed', ARGV[5], 'retain_failed', ARGV[6])
redis.call('LPUSH', KEYS[2], ARGV[1])
return 1
"#;

const CLAIM: &str = r#"
local now = tonumber(ARGV[1])
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)
for _, id in ipairs(due) do
    redis.call('ZREM', KEYS[2], id)
    redis.call('HSET', ARGV[4] .. id, 'state', 'waiting')
    redis.call('LPUSH', KEYS[1], id)
end
while true do
    local id = redis.call('RPOP', KEYS[1])
    if not id then
        return false
    end
    local key = ARGV[4] .. id
    if redis.call('HGET', key, 'state') == 'waiting' then
        local attempts = redis.call('HINCRBY', key, 'attempts', 1)
        local lease_until = now + tonumber(ARGV[2])
        redis.call('HSET', key, 'state', 'active', 'token', ARGV[3], 'lease_until', lease_until)
        return {id, redis.call('HGET', key, 'payload'), attempts, redis.call('HGET', key, 'max_attempts')}
    end
end
"#;

const EXTEND: &str = r#"
if redis.call('HGET', KEYS[1], 'state') ~= 'active' or redis.call('HGET', KEYS[1], 'token') ~= ARGV[2] then
    return 0
end
local lease_until = tonumber(ARGV[3]) + tonumber(ARGV[4])
redis.call('HSET', KEYS[1], 'lease_until', lease_until)
return 1
"#;

const COMPLETE: &str = r#"
if redis.call('HGET', KEYS[1], 'state') ~= 'active' or redis.call('HGET', KEYS[1], 'token') ~= ARGV[2] then
    return 0
end
if redis.call('HGET', KEYS[1], 'retain_completed') == '1' then
    redis.call('HSET', KEYS[1], 'state', 'completed')
    redis.call('HDEL', KEYS[1], 'token', 'lease_until')
else
    redis.call('DEL', KEYS[1])
end
return 1
"#;

const FAIL: &str = r#"
if redis.call('HGET', KEYS[1], 'state') ~= 'active' or redis.call('HGET', KEYS[1], 'token') ~= ARGV[2] then
    return {-1, 0, 0}
end
redis.call('HDEL', KEYS[1], 'token', 'lease_until')
redis.call('HSET', KEYS[1], 'last_error', ARGV[3])
local attempts = tonumber(redis.call('HGET', KEYS[1], 'attempts'))
local max_attempts = tonumber(redis.call('HGET', KEYS[1], 'max_attempts'))
if ARGV[4] == '1' or attempts >= max_attempts then
    if redis.call('HGET', KEYS[1], 'retain_failed') == '1' then
        redis.call('HSET', KEYS[1], 'state', 'dead')
    else
        redis.call('DEL', KEYS[1])
    end
    return {0, attempts, 0}
end
local exp = math.min(attempts - 1, 20)
local delay = math.floor(tonumber(redis.call('HGET', KEYS[1], 'backoff_ms')) * (2 ^ exp))
redis.call('HSET', KEYS[1], 'state', 'delayed')
redis.call('ZADD', KEYS[2], tonumber(ARGV[5]) + delay, ARGV[1])
return {1, attempts, delay}
"#;

fn job_key(video_id: &VideoId) -> String {
    format!("{}{}", JOB_PREFIX, video_id)
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn flag(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

fn fail_outcome(code: i64, attempts: u32, delay_ms: u64) -> FailOutcome {
    match code {
        1 => FailOutcome::RetryScheduled {
            next_attempt: attempts + 1,
            delay: Duration::from_millis(delay_ms),
        },
        0 => FailOutcome::Exhausted { attempts },
        _ => FailOutcome::LeaseLost,
    }
}

/// Leased job queue in Redis. Safe to share across processes.
#[derive(Clone)]
pub struct RedisQueue {
    pool: RedisPool,
    lease: Duration,
}

impl RedisQueue {
    pub fn new(pool: RedisPool, lease: Duration) -> Self {
        Self { pool, lease }
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn enqueue(
        &self,
        video_id: &VideoId,
        payload: &JobPayload,
        options: &EnqueueOptions,
    ) -> Result<EnqueueOutcome, QueueError> {
        let raw = encode_for(video_id, payload)?;
        let mut conn = self.pool.conn().await?;

        let written: i64 = Script::new(ENQUEUE)
            .key(job_key(video_id))
            .key(WAITING_LIST)
            .key(DELAYED_SET)
            .arg(video_id.as_str())
            .arg(raw)
            .arg(options.max_attempts)
            .arg(options.backoff_base.as_millis() as u64)
            .arg(flag(options.retain_completed))
            .arg(flag(options.retain_failed))
            .arg(now_ms())
            .invoke_async(&mut conn)
            .await?;

        if written == 1 {
            debug!(video_id = %video_id, "job enqueued");
            Ok(EnqueueOutcome::Enqueued)
        } else {
            Ok(EnqueueOutcome::AlreadyOutstanding)
        }
    }

    async fn claim(&self) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.pool.conn().await?;
        let token = Uuid::new_v4().to_string();

        let claimed: Option<(String, String, u32, u32)> = Script::new(CLAIM)
            .key(WAITING_LIST)
            .key(DELAYED_SET)
            .arg(now_ms())
            .arg(self.lease.as_millis() as u64)
            .arg(&token)
            .arg(JOB_PREFIX)
            .invoke_async(&mut conn)
            .await?;

        let Some((raw_id, payload, attempt, max_attempts)) = claimed else {
            return Ok(None);
        };
        let video_id = match VideoId::new(raw_id.as_str()) {
            Ok(id) => id,
            Err(e) => {
                // Only ids that passed validation are ever enqueued.
                warn!(raw_id = %raw_id, error = %e, "claimed job with invalid id");
                return Err(QueueError::InvalidPayload(e.to_string()));
            }
        };
        Ok(Some(Delivery {
            video_id,
            payload,
            attempt,
            max_attempts,
            lease_token: token,
        }))
    }

    async fn extend_lease(&self, delivery: &Delivery) -> Result<bool, QueueError> {
        let mut conn = self.pool.conn().await?;
        let extended: i64 = Script::new(EXTEND)
            .key(job_key(&delivery.video_id))
            .arg(delivery.video_id.as_str())
            .arg(&delivery.lease_token)
            .arg(now_ms())
            .arg(self.lease.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn complete(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.pool.conn().await?;
        let acked: i64 = Script::new(COMPLETE)
            .key(job_key(&delivery.video_id))
            .arg(delivery.video_id.as_str())
            .arg(&delivery.lease_token)
            .invoke_async(&mut conn)
            .await?;
        if acked == 0 {
            debug!(video_id = %delivery.video_id, "completion ignored, lease no longer held");
        }
        Ok(())
    }

    async fn fail(
        &self,
        delivery: &Delivery,
        reason: &str,
        permanent: bool,
    ) -> Result<FailOutcome, QueueError> {
        let mut conn = self.pool.conn().await?;
        let (code, attempts, delay_ms): (i64, u32, u64) = Script::new(FAIL)
            .key(job_key(&delivery.video_id))
            .key(DELAYED_SET)
            .arg(delivery.video_id.as_str())
            .arg(&delivery.lease_token)
            .arg(reason)
            .arg(flag(permanent))
            .arg(now_ms())
            .invoke_async(&mut conn)
            .await?;
        Ok(fail_outcome(code, attempts, delay_ms))
    }
}
