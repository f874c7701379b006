//! Per-frame usage accounting.
//!
//! The feedback pass reports which tiles were visible and at what level.
//! The usage table folds those samples into hit counts for one frame and is
//! cleared by the frame loop once the frame has been reconciled.

use std::collections::BTreeMap;

use crate::tile::address::TileAddress;

/// Hit counts for the current frame, ordered by tile address.
#[derive(Debug, Default)]
pub struct UsageTable {
    hits: BTreeMap<TileAddress, u32>,
    samples: u64,
}

impl UsageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one visibility sample.
    pub fn add(&mut self, address: TileAddress) {
        *self.hits.entry(address).or_insert(0) += 1;
        self.samples += 1;
    }

    pub fn is_used(&self, address: TileAddress) -> bool {
        self.hits.contains_key(&address)
    }

    pub fn hits(&self, address: TileAddress) -> Option<u32> {
        self.hits.get(&address).copied()
    }

    /// Used tiles in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = (TileAddress, u32)> + '_ {
        self.hits.iter().map(|(&a, &h)| (a, h))
    }

    /// Number of distinct tiles used this frame.
    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    /// Number of samples folded in since the last clear.
    pub fn total_samples(&self) -> u64 {
        self.samples
    }

    pub fn clear(&mut self) {
        self.hits.clear();
        self.samples = 0;
    }
}

/// Decode an RGBA8 feedback buffer into `(x, y, level)` samples.
///
/// Each covered pixel stores the tile x in red, y in green and the level in
/// blue; pixels with zero alpha were not covered by textured geometry.
pub fn decode_feedback(rgba: &[u8]) -> impl Iterator<Item = (u32, u32, u8)> + '_ {
    rgba.chunks_exact(4)
        .filter(|px| px[3] != 0)
        .map(|px| (px[0] as u32, px[1] as u32, px[2]))
}
