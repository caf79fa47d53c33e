//! Local adapters for monolith deployment.

pub mod fs;
pub mod http;
pub mod redis;

pub use fs::FsObjectStore;
pub use http::{router, HttpState};
pub use redis::{RedisPool, RedisQueue};
