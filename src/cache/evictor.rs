//! Eviction policy: decides which slot gives up its tile.
//!
//! Candidates are ranked by `(last_touched_frame, hit_count)`, lowest
//! first, which approximates least-recently then least-frequently used.
//! Ties fall back to the slot index so the choice is deterministic.
//! Forced slots are never candidates.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::cache::slot::{Slot, SlotId};

/// An eviction candidate with its rank.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub slot: SlotId,
    pub rank: (u64, u32),
}

// Lower rank = higher eviction priority, so the ordering is reversed for the max-heap.
impl PartialEq for EvictionCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.rank == other.rank && self.slot == other.slot
    }
}

impl Eq for EvictionCandidate {}

impl PartialOrd for EvictionCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EvictionCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .rank
            .cmp(&self.rank)
            .then_with(|| other.slot.cmp(&self.slot))
    }
}

/// Which slots may be considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VictimScope {
    /// Only slots already released (pending-delete).
    Released,
    /// Any non-forced slot holding a tile.
    Any,
}

/// The eviction policy engine.
#[derive(Debug, Default)]
pub struct Evictor;

impl Evictor {
    pub fn new() -> Self {
        Self
    }

    /// Select up to `count` victims among `slots`, best victim first.
    ///
    /// `free` carries the pending-delete flag per slot, indexed like `slots`.
    pub fn select_victims(
        &self,
        slots: &[Slot],
        free: &[bool],
        scope: VictimScope,
        count: usize,
    ) -> Vec<EvictionCandidate> {
        let mut heap = BinaryHeap::new();

        for (i, slot) in slots.iter().enumerate() {
            if slot.forced || slot.address.is_none() {
                continue;
            }
            if scope == VictimScope::Released && !free[i] {
                continue;
            }
            heap.push(EvictionCandidate {
                slot: SlotId(i as u32),
                rank: slot.rank(),
            });
        }

        let mut victims = Vec::with_capacity(count.min(heap.len()));
        while victims.len() < count {
            match heap.pop() {
                Some(candidate) => victims.push(candidate),
                None => break,
            }
        }
        victims
    }

    /// The single best victim, if any.
    pub fn select_victim(&self, slots: &[Slot], free: &[bool], scope: VictimScope) -> Option<SlotId> {
        self.select_victims(slots, free, scope, 1)
            .first()
            .map(|c| c.slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::address::TileAddress;

    fn make_slot(x: u32, frame: u64, hits: u32, forced: bool) -> Slot {
        let mut slot = Slot::default();
        slot.assign(TileAddress::new(x, 0, 3).unwrap(), forced);
        slot.valid = true;
        slot.touch(frame, hits);
        slot
    }

    #[test]
    fn test_eviction_prefers_oldest_then_coldest() {
        let slots = vec![
            make_slot(0, 5, 1, false),
            make_slot(1, 2, 9, false), // oldest → evicted first
            make_slot(2, 5, 0, false), // same frame as 0, fewer hits
        ];
        let free = vec![false; 3];

        let victims = Evictor::new().select_victims(&slots, &free, VictimScope::Any, 3);
        let order: Vec<_> = victims.iter().map(|c| c.slot.0).collect();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn test_forced_slots_excluded() {
        let slots = vec![make_slot(0, 0, 0, true), make_slot(1, 9, 9, false)];
        let free = vec![false; 2];

        let victim = Evictor::new().select_victim(&slots, &free, VictimScope::Any);
        assert_eq!(victim, Some(SlotId(1)));
    }

    #[test]
    fn test_released_scope_only_sees_free_slots() {
        let slots = vec![make_slot(0, 0, 0, false), make_slot(1, 9, 9, false)];
        let free = vec![false, true];

        let victim = Evictor::new().select_victim(&slots, &free, VictimScope::Released);
        assert_eq!(victim, Some(SlotId(1)));
    }

    #[test]
    fn test_ties_break_on_slot_index() {
        let slots = vec![make_slot(0, 1, 1, false), make_slot(1, 1, 1, false)];
        let free = vec![false; 2];

        let victim = Evictor::new().select_victim(&slots, &free, VictimScope::Any);
        assert_eq!(victim, Some(SlotId(0)));
    }

    #[test]
    fn test_empty_returns_nothing() {
        let victims = Evictor::new().select_victims(&[], &[], VictimScope::Any, 5);
        assert!(victims.is_empty());
    }
}
