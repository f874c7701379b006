//! The page cache: a fixed pool of atlas slots.
//!
//! The cache is the only owner of slot assignment. It:
//! - Answers whether a tile is resident, pending delete or absent
//! - Releases slots in two phases so a tile can be restored for free
//! - Picks victims when a new tile needs a slot, notifying the listener first
//! - Writes committed tile pixels (and their mip chain) into the atlas

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::atlas::{downsample, AtlasLayout, AtlasStore};
use crate::cache::evictor::{Evictor, VictimScope};
use crate::cache::slot::{Slot, SlotId, TileStatus};
use crate::config::AtlasConfig;
use crate::streaming::source::TileImage;
use crate::tile::address::TileAddress;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache of {capacity} slots exhausted: every slot is forced")]
    CapacityExhausted { capacity: usize },

    #[error("slot {slot} is not reserved for tile {address}")]
    SlotMismatch { slot: SlotId, address: TileAddress },

    #[error("tile {address} payload is {got} bytes, expected {expected}")]
    PayloadSize {
        address: TileAddress,
        got: usize,
        expected: usize,
    },
}

/// Receives eviction notices before a slot is handed to another tile.
pub trait EvictionListener {
    fn on_evicted(&mut self, previous: TileAddress, slot: SlotId);
}

/// Slot occupancy summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Slots holding a tile and not marked for release.
    pub used: usize,
    /// Slots marked free whose tile is still readable.
    pub pending_delete: usize,
    /// Slots with no tile.
    pub empty: usize,
    /// Slots that can never be evicted.
    pub forced: usize,
}

/// The page cache.
pub struct PageCache {
    /// Fixed slot pool; length never changes.
    slots: Vec<Slot>,

    /// Per-slot free flag. A free slot may still hold a restorable tile.
    free: Vec<bool>,

    /// Resident and pending-delete tiles.
    mapping: HashMap<TileAddress, SlotId>,

    layout: AtlasLayout,
    store: Box<dyn AtlasStore>,
    evictor: Evictor,
    evictions: u64,
}

impl PageCache {
    /// Create a cache with `config.slots` empty slots writing into `store`.
    pub fn new(config: &AtlasConfig, store: Box<dyn AtlasStore>) -> Self {
        let layout = AtlasLayout::new(config);
        let capacity = layout.capacity;
        Self {
            slots: vec![Slot::default(); capacity],
            free: vec![true; capacity],
            mapping: HashMap::with_capacity(capacity),
            layout,
            store,
            evictor: Evictor::new(),
            evictions: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn layout(&self) -> &AtlasLayout {
        &self.layout
    }

    pub fn slot(&self, id: SlotId) -> Option<&Slot> {
        self.slots.get(id.index())
    }

    /// Slot currently associated with `address` (resident or pending delete).
    pub fn slot_for(&self, address: TileAddress) -> Option<SlotId> {
        self.mapping.get(&address).copied()
    }

    pub fn status(&self, address: TileAddress) -> TileStatus {
        let Some(&slot) = self.mapping.get(&address) else {
            return TileStatus::Absent;
        };
        if !self.slots[slot.index()].holds(address) {
            return TileStatus::Absent;
        }
        if self.free[slot.index()] {
            TileStatus::PendingDelete
        } else {
            TileStatus::Resident
        }
    }

    /// Mark a resident tile's slot free without touching its content.
    pub fn release(&mut self, address: TileAddress) -> bool {
        if self.status(address) != TileStatus::Resident {
            return false;
        }
        let slot = self.mapping[&address];
        self.free[slot.index()] = true;
        debug!(tile = %address, slot = %slot, "Released slot");
        true
    }

    /// Take back a pending-delete tile's slot.
    pub fn restore(&mut self, address: TileAddress) -> Option<SlotId> {
        if self.status(address) != TileStatus::PendingDelete {
            return None;
        }
        let slot = self.mapping[&address];
        self.free[slot.index()] = false;
        debug!(tile = %address, slot = %slot, "Restored slot");
        Some(slot)
    }

    /// Refresh the eviction rank of a cached tile.
    pub fn touch(&mut self, address: TileAddress, frame: u64, hits: u32) {
        if let Some(&slot) = self.mapping.get(&address) {
            self.slots[slot.index()].touch(frame, hits);
        }
    }

    /// Find a slot for `address`.
    ///
    /// Order of preference: restore the tile's own pending-delete slot, an
    /// empty slot, the lowest-ranked released slot, then the lowest-ranked
    /// non-forced slot. A slot that still holds a tile is reported to
    /// `listener` before it is reassigned.
    pub fn reserve(
        &mut self,
        address: TileAddress,
        forced: bool,
        listener: &mut dyn EvictionListener,
    ) -> Result<SlotId, CacheError> {
        if let Some(slot) = self.restore(address) {
            self.slots[slot.index()].forced |= forced;
            return Ok(slot);
        }

        let slot = self
            .empty_slot()
            .or_else(|| self.evictor.select_victim(&self.slots, &self.free, VictimScope::Released))
            .or_else(|| self.evictor.select_victim(&self.slots, &self.free, VictimScope::Any))
            .ok_or(CacheError::CapacityExhausted {
                capacity: self.capacity(),
            })?;

        if let Some(previous) = self.slots[slot.index()].address {
            if self.slots[slot.index()].valid {
                listener.on_evicted(previous, slot);
            }
            self.mapping.remove(&previous);
            self.evictions += 1;
            debug!(tile = %previous, slot = %slot, replacement = %address, "Evicted tile");
        }

        self.slots[slot.index()].assign(address, forced);
        self.free[slot.index()] = false;
        Ok(slot)
    }

    /// Write a loaded tile into its reserved slot and make it resident.
    ///
    /// A payload of the wrong size is rejected and the slot goes back to the
    /// empty pool.
    pub fn commit(&mut self, address: TileAddress, slot: SlotId, image: &TileImage) -> Result<(), CacheError> {
        let reserved = self
            .slots
            .get(slot.index())
            .is_some_and(|s| s.address == Some(address));
        if !reserved {
            return Err(CacheError::SlotMismatch { slot, address });
        }

        let expected = self.layout.tile_bytes();
        let edge = self.layout.padded_tile;
        if image.pixels.len() != expected || image.width != edge || image.height != edge {
            warn!(tile = %address, got = image.pixels.len(), expected, "Rejected tile payload");
            self.discard(slot);
            return Err(CacheError::PayloadSize {
                address,
                got: image.pixels.len(),
                expected,
            });
        }

        self.write_mip_chain(slot, image);

        self.slots[slot.index()].valid = true;
        self.free[slot.index()] = false;
        self.mapping.insert(address, slot);
        debug!(tile = %address, slot = %slot, "Committed tile");
        Ok(())
    }

    /// Level 0 is the payload itself; each following level halves the previous one.
    fn write_mip_chain(&mut self, slot: SlotId, image: &TileImage) {
        let mut pixels = image.pixels.to_vec();
        let (mut width, mut height) = (image.width, image.height);

        for mip in 0..self.layout.mip_count {
            let Some(region) = self.layout.region(slot, mip) else {
                break;
            };
            if mip > 0 {
                let (next, w, h) = downsample(&pixels, width, height);
                pixels = next;
                width = w;
                height = h;
            }
            debug_assert_eq!((region.width, region.height), (width, height));
            self.store.write(region, &pixels);
        }
    }

    fn discard(&mut self, slot: SlotId) {
        if let Some(address) = self.slots[slot.index()].address {
            if self.mapping.get(&address) == Some(&slot) {
                self.mapping.remove(&address);
            }
        }
        self.slots[slot.index()].reset();
        self.free[slot.index()] = true;
    }

    fn empty_slot(&self) -> Option<SlotId> {
        self.slots
            .iter()
            .position(|s| s.address.is_none())
            .map(|i| SlotId(i as u32))
    }

    /// Tiles currently mapped, with their slot and status.
    pub fn cached_tiles(&self) -> impl Iterator<Item = (TileAddress, SlotId)> + '_ {
        self.mapping.iter().map(|(&a, &s)| (a, s))
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for (slot, &free) in self.slots.iter().zip(&self.free) {
            match (slot.address.is_some() && slot.valid, free) {
                (true, false) => stats.used += 1,
                (true, true) => stats.pending_delete += 1,
                (false, _) => stats.empty += 1,
            }
            if slot.forced {
                stats.forced += 1;
            }
        }
        stats
    }

    /// Total evictions since creation.
    pub fn eviction_count(&self) -> u64 {
        self.evictions
    }

    /// Drop every tile; slots become empty and unforced.
    ///
    /// Every committed tile is reported to `listener` first, as on eviction.
    pub fn clear(&mut self, listener: &mut dyn EvictionListener) {
        for (i, slot) in self.slots.iter().enumerate() {
            if let (Some(address), true) = (slot.address, slot.valid) {
                listener.on_evicted(address, SlotId(i as u32));
            }
        }
        self.mapping.clear();
        for slot in &mut self.slots {
            slot.reset();
        }
        self.free.iter_mut().for_each(|f| *f = true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::atlas::{AtlasRegion, HostAtlas, BYTES_PER_PIXEL};
    use bytes::Bytes;
    use std::sync::{Arc, Mutex};

    struct Recorder(Vec<(TileAddress, SlotId)>);

    impl EvictionListener for Recorder {
        fn on_evicted(&mut self, previous: TileAddress, slot: SlotId) {
            self.0.push((previous, slot));
        }
    }

    fn config(slots: usize) -> AtlasConfig {
        AtlasConfig {
            tile_size: 4,
            padding: 0,
            slots,
            generate_mips: true,
        }
    }

    fn cache(slots: usize) -> PageCache {
        let cfg = config(slots);
        let store = HostAtlas::new(&AtlasLayout::new(&cfg));
        PageCache::new(&cfg, Box::new(store))
    }

    fn image(value: u8) -> TileImage {
        TileImage {
            width: 4,
            height: 4,
            pixels: Bytes::from(vec![value; 4 * 4 * 4]),
        }
    }

    fn tile(x: u32) -> TileAddress {
        TileAddress::new(x, 0, 3).unwrap()
    }

    fn load(cache: &mut PageCache, address: TileAddress, forced: bool, rec: &mut Recorder) -> SlotId {
        let slot = cache.reserve(address, forced, rec).unwrap();
        cache.commit(address, slot, &image(1)).unwrap();
        slot
    }

    #[test]
    fn test_status_lifecycle() {
        let mut cache = cache(2);
        let mut rec = Recorder(Vec::new());
        let a = tile(0);
        assert_eq!(cache.status(a), TileStatus::Absent);

        let slot = cache.reserve(a, false, &mut rec).unwrap();
        // Reserved but not committed yet.
        assert_eq!(cache.status(a), TileStatus::Absent);

        cache.commit(a, slot, &image(9)).unwrap();
        assert_eq!(cache.status(a), TileStatus::Resident);

        assert!(cache.release(a));
        assert_eq!(cache.status(a), TileStatus::PendingDelete);
        assert!(!cache.release(a));
    }

    #[test]
    fn test_release_then_restore_keeps_slot() {
        let mut cache = cache(2);
        let mut rec = Recorder(Vec::new());
        let slot = load(&mut cache, tile(0), false, &mut rec);

        cache.release(tile(0));
        assert_eq!(cache.restore(tile(0)), Some(slot));
        assert_eq!(cache.status(tile(0)), TileStatus::Resident);
        assert_eq!(cache.restore(tile(0)), None);
    }

    #[test]
    fn test_reserve_restores_pending_delete() {
        let mut cache = cache(2);
        let mut rec = Recorder(Vec::new());
        let slot = load(&mut cache, tile(0), false, &mut rec);
        cache.release(tile(0));

        assert_eq!(cache.reserve(tile(0), false, &mut rec).unwrap(), slot);
        assert!(rec.0.is_empty());
    }

    #[test]
    fn test_released_slot_reused_before_resident_victim() {
        let mut cache = cache(2);
        let mut rec = Recorder(Vec::new());
        load(&mut cache, tile(0), false, &mut rec);
        let released = load(&mut cache, tile(1), false, &mut rec);
        cache.touch(tile(1), 10, 10);
        cache.release(tile(1));

        let slot = cache.reserve(tile(2), false, &mut rec).unwrap();
        assert_eq!(slot, released);
        assert_eq!(rec.0, vec![(tile(1), released)]);
        assert_eq!(cache.status(tile(1)), TileStatus::Absent);
        assert_eq!(cache.status(tile(0)), TileStatus::Resident);
    }

    #[test]
    fn test_forced_never_victim() {
        let mut cache = cache(2);
        let mut rec = Recorder(Vec::new());
        let forced = load(&mut cache, TileAddress::ROOT, true, &mut rec);
        load(&mut cache, tile(0), false, &mut rec);

        for x in 1..6 {
            let slot = cache.reserve(tile(x), false, &mut rec).unwrap();
            assert_ne!(slot, forced);
            cache.commit(tile(x), slot, &image(1)).unwrap();
        }
        assert_eq!(cache.status(TileAddress::ROOT), TileStatus::Resident);
    }

    #[test]
    fn test_all_forced_exhausts_capacity() {
        let mut cache = cache(3);
        let mut rec = Recorder(Vec::new());
        for x in 0..3 {
            load(&mut cache, tile(x), true, &mut rec);
        }
        assert_eq!(
            cache.reserve(tile(3), false, &mut rec),
            Err(CacheError::CapacityExhausted { capacity: 3 })
        );
    }

    #[test]
    fn test_commit_rejects_wrong_size() {
        let mut cache = cache(1);
        let mut rec = Recorder(Vec::new());
        let slot = cache.reserve(tile(0), false, &mut rec).unwrap();
        let bad = TileImage {
            width: 2,
            height: 2,
            pixels: Bytes::from(vec![0u8; 16]),
        };

        assert!(matches!(
            cache.commit(tile(0), slot, &bad),
            Err(CacheError::PayloadSize { .. })
        ));
        assert_eq!(cache.stats().empty, 1);
    }

    #[test]
    fn test_commit_requires_reservation() {
        let mut cache = cache(1);
        assert_eq!(
            cache.commit(tile(0), SlotId(0), &image(1)),
            Err(CacheError::SlotMismatch {
                slot: SlotId(0),
                address: tile(0)
            })
        );
    }

    #[test]
    fn test_stats_and_clear() {
        let mut cache = cache(3);
        let mut rec = Recorder(Vec::new());
        load(&mut cache, TileAddress::ROOT, true, &mut rec);
        load(&mut cache, tile(0), false, &mut rec);
        cache.release(tile(0));

        assert_eq!(
            cache.stats(),
            CacheStats {
                used: 1,
                pending_delete: 1,
                empty: 1,
                forced: 1
            }
        );

        let mut cleared = Recorder(Vec::new());
        cache.clear(&mut cleared);
        assert_eq!(cache.stats().empty, 3);
        assert_eq!(cache.status(TileAddress::ROOT), TileStatus::Absent);
        // Pending-delete tiles are still readable, so they are reported too.
        assert_eq!(cleared.0, vec![(TileAddress::ROOT, SlotId(0)), (tile(0), SlotId(1))]);
    }

    type Writes = Arc<Mutex<Vec<(AtlasRegion, Vec<u8>)>>>;

    struct RecordingStore(Writes);

    impl AtlasStore for RecordingStore {
        fn write(&mut self, region: AtlasRegion, pixels: &[u8]) {
            self.0.lock().unwrap().push((region, pixels.to_vec()));
        }
    }

    #[test]
    fn test_commit_writes_mip_chain_at_slot_region() {
        let cfg = AtlasConfig {
            tile_size: 4,
            padding: 1,
            slots: 4,
            generate_mips: true,
        };
        let writes: Writes = Arc::new(Mutex::new(Vec::new()));
        let mut cache = PageCache::new(&cfg, Box::new(RecordingStore(writes.clone())));
        let mut rec = Recorder(Vec::new());

        // Padded edge 6: a gradient so every mip differs from the last.
        let pixels: Vec<u8> = (0..6 * 6 * 4).map(|i| (i * 3 % 251) as u8).collect();
        let image = TileImage {
            width: 6,
            height: 6,
            pixels: Bytes::from(pixels.clone()),
        };

        let first = cache.reserve(tile(0), false, &mut rec).unwrap();
        cache.commit(tile(0), first, &image).unwrap();
        writes.lock().unwrap().clear();

        let slot = cache.reserve(tile(1), false, &mut rec).unwrap();
        assert_eq!(slot, SlotId(1));
        cache.commit(tile(1), slot, &image).unwrap();

        let writes = writes.lock().unwrap();
        let layout = cache.layout();
        // 6 → 3 → 1
        assert_eq!(layout.mip_count, 3);
        assert_eq!(writes.len(), 3);
        for (mip, (region, _)) in writes.iter().enumerate() {
            assert_eq!(Some(*region), layout.region(slot, mip as u32));
        }
        // Slot 1 sits in the second column of a 2×2 grid.
        assert_eq!((writes[0].0.x, writes[0].0.y), (6, 0));
        assert_eq!((writes[1].0.x, writes[1].0.width), (3, 3));

        assert_eq!(writes[0].1, pixels);
        let (mip1, w1, h1) = downsample(&pixels, 6, 6);
        assert_eq!(writes[1].1, mip1);
        let (mip2, _, _) = downsample(&mip1, w1, h1);
        assert_eq!(writes[2].1, mip2);
        assert_eq!(writes[2].1.len(), BYTES_PER_PIXEL);
    }
}
