//! Ports - Traits the application layer depends on.

pub mod encoder;
pub mod queue;
pub mod repository;
pub mod storage;
pub mod transcoder;
