//! The per-frame control loop.
//!
//! - [`orchestrator`]: usage → residency → commit → index rebuild
//! - [`report`]: FrameReport statistics

pub mod orchestrator;
pub mod report;
