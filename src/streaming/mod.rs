//! Tile streaming: sources and the bounded fetch queue.
//!
//! - [`source`]: TileSource trait, TileImage payloads, synthetic source
//! - [`disk_source`]: directory-backed source (raw or zstd tiles)
//! - [`queue`]: priority queue with a concurrency limit, retries and cancellation

pub mod disk_source;
pub mod queue;
pub mod source;
