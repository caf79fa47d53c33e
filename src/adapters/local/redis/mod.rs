//! Redis adapter for local deployment.
//!
//! This module provides Redis-backed implementations of:
//! - `JobQueue` for durable, leased job delivery
//! - `StatusStore` for per-video processing state

mod error;
mod pool;
mod queue;
mod repository;

pub use error::RedisAdapterError;
pub use pool::RedisPool;
pub use queue::RedisQueue;

/// Redis key constants
const JOB_PREFIX: &str = "reelforge:job:";
const WAITING_LIST: &str = "reelforge:waiting";
const DELAYED_SET: &str = "reelforge:delayed";
const VIDEO_PREFIX: &str = "reelforge:video:";
const STATUS_PREFIX: &str = "reelforge:status:";
