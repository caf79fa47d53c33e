//! Domain layer - Pure business logic.

pub mod artifacts;
pub mod hls;
pub mod jobs;
pub mod rendition;
