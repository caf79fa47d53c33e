//! Application layer - Generic services that use ports.

pub mod intake;
pub mod orchestrator;
pub mod reaper;
pub mod supervisor;
pub mod sweep;
pub mod worker;
