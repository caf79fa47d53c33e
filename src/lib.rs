//! Reelforge - Adaptive-bitrate transcoding pipeline
//!
//! Hexagonal Architecture:
//! - domain/: Pure business logic (jobs, renditions, hls, artifacts)
//! - ports/: Trait definitions
//! - adapters/: Concrete implementations
//! - application/: Generic services
//! - config: Environment configuration
//!
//! # Features
//! - `local`: Local/monolith deployment (Redis, filesystem store, HTTP submit/poll)
//! - `aws`: AWS deployment (S3 or R2, SQS FIFO, DynamoDB)
//! - `full`: All features

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod ports;
pub mod telemetry;

// Re-exports for convenience
pub use config::PipelineConfig;

#[cfg(feature = "aws")]
pub use config::AwsConfig;

#[cfg(feature = "local")]
pub use config::LocalConfig;

pub use domain::hls;
