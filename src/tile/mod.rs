//! Tile identity and per-frame usage.
//!
//! - [`address`]: TileAddress encoding and quad-tree arithmetic
//! - [`usage`]: UsageTable hit counting and feedback decoding

pub mod address;
pub mod usage;
