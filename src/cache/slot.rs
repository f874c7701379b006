//! Slot types for the page cache.
//!
//! A slot is one fixed cell of the atlas. Slots are created once when the
//! cache is built and reassigned between tiles for the rest of the run.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tile::address::TileAddress;

/// Index of a slot in the cache's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotId(pub u32);

impl SlotId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Residency of a tile as seen by the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TileStatus {
    /// No slot holds this tile.
    Absent,
    /// A slot holds the tile and is not marked for release.
    Resident,
    /// A slot still holds the tile but is marked free; restorable until reused.
    PendingDelete,
}

impl fmt::Display for TileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TileStatus::Absent => write!(f, "absent"),
            TileStatus::Resident => write!(f, "resident"),
            TileStatus::PendingDelete => write!(f, "pending-delete"),
        }
    }
}

/// One cell of the cache.
#[derive(Debug, Clone, Default)]
pub struct Slot {
    /// Tile occupying the slot, if any.
    pub address: Option<TileAddress>,

    /// Never chosen as an eviction victim.
    pub forced: bool,

    /// Hit count of the tile when last touched.
    pub hit_count: u32,

    /// Frame in which the tile was last used.
    pub last_touched_frame: u64,

    /// Tile data has been committed.
    pub valid: bool,
}

impl Slot {
    /// Eviction rank: lower is evicted first.
    pub fn rank(&self) -> (u64, u32) {
        (self.last_touched_frame, self.hit_count)
    }

    /// Record use of the slot's tile in `frame`.
    pub fn touch(&mut self, frame: u64, hits: u32) {
        self.last_touched_frame = self.last_touched_frame.max(frame);
        self.hit_count = hits;
    }

    /// Whether the slot holds committed data for `address`.
    pub fn holds(&self, address: TileAddress) -> bool {
        self.valid && self.address == Some(address)
    }

    /// Assign the slot to a new tile; content is pending until committed.
    pub(crate) fn assign(&mut self, address: TileAddress, forced: bool) {
        self.address = Some(address);
        self.forced = forced;
        self.hit_count = 0;
        self.valid = false;
    }

    pub(crate) fn reset(&mut self) {
        *self = Slot::default();
    }
}
