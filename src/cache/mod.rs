//! Page cache management.
//!
//! This module contains the slot pool and the policies around it:
//! - [`slot`]: Slot, SlotId, TileStatus definitions
//! - [`page_cache`]: the cache itself (status, release/restore, reserve, commit)
//! - [`evictor`]: victim selection (recency + frequency rank)
//! - [`atlas`]: slot → atlas geometry, backing store trait, mip downsampling

pub mod atlas;
pub mod evictor;
pub mod page_cache;
pub mod slot;
