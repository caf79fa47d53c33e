//! Redis error types for the local adapter.

use crate::ports::queue::QueueError;
use crate::ports::repository::StoreError;
use deadpool_redis::CreatePoolError;
use thiserror::Error;

pub type RedisError = deadpool_redis::redis::RedisError;
pub type PoolError = deadpool_redis::PoolError;

#[derive(Debug, Error)]
pub enum RedisAdapterError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),
    #[error("Create pool error: {0}")]
    CreatePool(String),
    #[error("Unexpected reply: {0}")]
    Reply(String),
}

impl From<CreatePoolError> for RedisAdapterError {
    fn from(err: CreatePoolError) -> Self {
        RedisAdapterError::CreatePool(format!("{}", err))
    }
}

impl From<RedisAdapterError> for QueueError {
    fn from(err: RedisAdapterError) -> Self {
        QueueError::Unavailable(err.to_string())
    }
}

impl From<RedisAdapterError> for StoreError {
    fn from(err: RedisAdapterError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl From<RedisError> for QueueError {
    fn from(err: RedisError) -> Self {
        RedisAdapterError::from(err).into()
    }
}

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        RedisAdapterError::from(err).into()
    }
}
