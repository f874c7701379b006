//! Quad-tree indirection index.
//!
//! One entry per (x, y, level) across the whole pyramid, stored as a flat
//! array with a per-level offset. An entry names the slot that currently
//! serves the coordinate: its own tile when resident, otherwise the nearest
//! coarser ancestor that is. Parent and child cells are derived from the
//! coordinates, so there are no node pointers to maintain.

use bytemuck::{Pod, Zeroable};
use tracing::{trace, warn};

use crate::cache::page_cache::{EvictionListener, PageCache};
use crate::cache::slot::SlotId;
use crate::tile::address::TileAddress;

/// Read-side record for one coordinate, laid out for direct texture upload.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct IndirectionEntry {
    /// Atlas column of the serving slot.
    pub atlas_x: u16,
    /// Atlas row of the serving slot.
    pub atlas_y: u16,
    /// Pyramid level of the tile in that slot.
    pub source_level: u8,
    /// Frames since the serving tile was last used, saturating at 255.
    pub recency: u8,
}

impl IndirectionEntry {
    /// Marker for coordinates nothing serves yet.
    pub const UNRESOLVED: IndirectionEntry = IndirectionEntry {
        atlas_x: 0,
        atlas_y: 0,
        source_level: u8::MAX,
        recency: u8::MAX,
    };

    pub fn is_resolved(&self) -> bool {
        self.source_level != u8::MAX
    }
}

/// The indirection index.
#[derive(Debug)]
pub struct IndirectionIndex {
    max_level: u8,

    /// Start of each level in `entries` and `snapshot`.
    offsets: Vec<usize>,

    entries: Vec<Option<SlotId>>,
    snapshot: Vec<IndirectionEntry>,
}

impl IndirectionIndex {
    pub fn new(max_level: u8) -> Self {
        let mut offsets = Vec::with_capacity(max_level as usize + 1);
        let mut total = 0usize;
        for level in 0..=max_level as u32 {
            offsets.push(total);
            total += 1usize << (2 * level);
        }
        Self {
            max_level,
            offsets,
            entries: vec![None; total],
            snapshot: vec![IndirectionEntry::UNRESOLVED; total],
        }
    }

    pub fn max_level(&self) -> u8 {
        self.max_level
    }

    /// Total entries across all levels.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry_index(&self, address: TileAddress) -> Option<usize> {
        (address.level() <= self.max_level).then(|| self.offsets[address.level() as usize] + address.index_in_level())
    }

    /// Entry for `address` as of the last assignment or rebuild.
    pub fn resolve(&self, address: TileAddress) -> Option<SlotId> {
        self.entry_index(address).and_then(|i| self.entries[i])
    }

    /// Nearest set entry walking from `address` toward the root.
    pub fn lookup(&self, address: TileAddress) -> Option<SlotId> {
        let mut current = Some(address);
        while let Some(addr) = current {
            if let Some(slot) = self.resolve(addr) {
                return Some(slot);
            }
            current = addr.parent();
        }
        None
    }

    /// Point `address` at `slot`.
    pub fn set(&mut self, address: TileAddress, slot: SlotId) {
        match self.entry_index(address) {
            Some(i) => self.entries[i] = Some(slot),
            None => warn!(tile = %address, max_level = self.max_level, "Indirection set beyond pyramid"),
        }
    }

    /// Clear `address` and every finer entry that was falling back to its slot.
    pub fn invalidate(&mut self, address: TileAddress) {
        let Some(i) = self.entry_index(address) else {
            return;
        };
        let Some(removed) = self.entries[i].take() else {
            return;
        };

        let (mut x0, mut y0) = (address.x() as usize, address.y() as usize);
        let mut span = 1usize;
        for level in address.level() + 1..=self.max_level {
            x0 <<= 1;
            y0 <<= 1;
            span <<= 1;
            let offset = self.offsets[level as usize];
            let width = 1usize << level;
            for y in y0..y0 + span {
                let row = offset + y * width;
                for entry in &mut self.entries[row + x0..row + x0 + span] {
                    if *entry == Some(removed) {
                        *entry = None;
                    }
                }
            }
        }
        trace!(tile = %address, slot = %removed, "Invalidated indirection subtree");
    }

    /// Propagate slots from coarse to fine and refresh the read-side snapshot.
    ///
    /// A child takes its parent's slot when it has none or when its current
    /// slot holds coarser data than the parent's. Each level reads the level
    /// above it, so levels are visited in order starting at the root.
    pub fn rebuild(&mut self, cache: &PageCache, frame: u64) {
        let slot_level = |slot: Option<SlotId>| {
            slot.and_then(|s| cache.slot(s))
                .filter(|s| s.valid)
                .and_then(|s| s.address)
                .map(|a| a.level())
        };

        for level in 0..self.max_level {
            let width = 1usize << level;
            let offset = self.offsets[level as usize];
            let child_offset = self.offsets[level as usize + 1];
            let child_width = width << 1;

            for y in 0..width {
                for x in 0..width {
                    let parent = self.entries[offset + y * width + x];
                    let Some(parent_level) = slot_level(parent) else {
                        continue;
                    };
                    for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                        let child = child_offset + (2 * y + dy) * child_width + 2 * x + dx;
                        let replace = match slot_level(self.entries[child]) {
                            None => true,
                            Some(child_level) => child_level < parent_level,
                        };
                        if replace {
                            self.entries[child] = parent;
                        }
                    }
                }
            }
        }

        let layout = cache.layout();
        for (entry, out) in self.entries.iter().zip(self.snapshot.iter_mut()) {
            *out = entry
                .and_then(|s| cache.slot(s).map(|slot| (s, slot)))
                .filter(|(_, slot)| slot.valid)
                .and_then(|(s, slot)| {
                    let address = slot.address?;
                    let (col, row) = layout.cell(s);
                    Some(IndirectionEntry {
                        atlas_x: col as u16,
                        atlas_y: row as u16,
                        source_level: address.level(),
                        recency: frame.saturating_sub(slot.last_touched_frame).min(255) as u8,
                    })
                })
                .unwrap_or(IndirectionEntry::UNRESOLVED);
        }
    }

    /// Snapshot of one level, row-major, as produced by the last rebuild.
    pub fn level_snapshot(&self, level: u8) -> Option<&[IndirectionEntry]> {
        if level > self.max_level {
            return None;
        }
        let start = self.offsets[level as usize];
        let len = 1usize << (2 * level as u32);
        Some(&self.snapshot[start..start + len])
    }

    /// Snapshot of one level as raw bytes, 6 bytes per entry in field order:
    /// `atlas_x: u16`, `atlas_y: u16` (native endian), `source_level: u8`,
    /// `recency: u8`.
    pub fn snapshot_bytes(&self, level: u8) -> Option<&[u8]> {
        self.level_snapshot(level).map(bytemuck::cast_slice)
    }

    /// Unset every entry.
    pub fn clear(&mut self) {
        self.entries.iter_mut().for_each(|e| *e = None);
        self.snapshot.iter_mut().for_each(|e| *e = IndirectionEntry::UNRESOLVED);
    }
}

impl EvictionListener for IndirectionIndex {
    fn on_evicted(&mut self, previous: TileAddress, slot: SlotId) {
        trace!(tile = %previous, slot = %slot, "Eviction notice");
        self.invalidate(previous);
    }
}
