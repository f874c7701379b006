//! Tile addressing: (x, y, level) packed into a single ordered key.
//!
//! Layout of the encoded `u32`:
//!
//! ```text
//! | unused (4) | x (12) | y (12) | level (4) |
//! 31        28 27    16 15     4 3         0
//! ```
//!
//! Level 0 is the single root tile; level `l` has `2^l × 2^l` tiles. The
//! 12-bit coordinate fields cap the pyramid at [`MAX_LEVEL`].

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const LEVEL_BITS: u32 = 4;
const COORD_BITS: u32 = 12;

const LEVEL_MASK: u32 = (1 << LEVEL_BITS) - 1;
const COORD_MASK: u32 = (1 << COORD_BITS) - 1;

const Y_SHIFT: u32 = LEVEL_BITS;
const X_SHIFT: u32 = LEVEL_BITS + COORD_BITS;

/// Finest level whose coordinates fit the 12-bit fields.
pub const MAX_LEVEL: u8 = COORD_BITS as u8;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressError {
    #[error("level {level} exceeds maximum level {max}")]
    LevelOutOfRange { level: u8, max: u8 },

    #[error("coordinate ({x}, {y}) outside level {level} extent {extent}")]
    CoordinateOutOfRange { x: u32, y: u32, level: u8, extent: u32 },

    #[error("invalid encoded tile id {0:#x}")]
    InvalidBits(u32),
}

/// A validated tile coordinate.
///
/// Ordering follows the encoded integer, so iteration over ordered
/// collections is deterministic (x-major, then y, then level).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileAddress(u32);

impl TileAddress {
    /// Sentinel that never decodes to a valid address.
    pub const INVALID: u32 = u32::MAX;

    /// The root tile.
    pub const ROOT: TileAddress = TileAddress(0);

    /// Encode `(x, y, level)`, rejecting anything outside the bit budget.
    pub fn new(x: u32, y: u32, level: u8) -> Result<Self, AddressError> {
        Self::bounded(x, y, level, MAX_LEVEL)
    }

    /// Encode `(x, y, level)` for a pyramid whose finest level is `max_level`.
    pub fn bounded(x: u32, y: u32, level: u8, max_level: u8) -> Result<Self, AddressError> {
        let max = max_level.min(MAX_LEVEL);
        if level > max {
            return Err(AddressError::LevelOutOfRange { level, max });
        }
        let extent = 1u32 << level;
        if x >= extent || y >= extent {
            return Err(AddressError::CoordinateOutOfRange { x, y, level, extent });
        }
        Ok(Self((x << X_SHIFT) | (y << Y_SHIFT) | level as u32))
    }

    /// Decode a packed id.
    pub fn from_bits(bits: u32) -> Result<Self, AddressError> {
        if bits >> (X_SHIFT + COORD_BITS) != 0 {
            return Err(AddressError::InvalidBits(bits));
        }
        let x = (bits >> X_SHIFT) & COORD_MASK;
        let y = (bits >> Y_SHIFT) & COORD_MASK;
        let level = (bits & LEVEL_MASK) as u8;
        Self::new(x, y, level).map_err(|_| AddressError::InvalidBits(bits))
    }

    /// Whether `bits` decodes to a valid address.
    pub fn is_valid_bits(bits: u32) -> bool {
        Self::from_bits(bits).is_ok()
    }

    pub fn to_bits(self) -> u32 {
        self.0
    }

    pub fn x(self) -> u32 {
        (self.0 >> X_SHIFT) & COORD_MASK
    }

    pub fn y(self) -> u32 {
        (self.0 >> Y_SHIFT) & COORD_MASK
    }

    pub fn level(self) -> u8 {
        (self.0 & LEVEL_MASK) as u8
    }

    pub fn is_root(self) -> bool {
        self.level() == 0
    }

    /// Tiles per side at this address's level.
    pub fn level_extent(self) -> u32 {
        1 << self.level()
    }

    /// Row-major index of this tile within its level.
    pub fn index_in_level(self) -> usize {
        (self.y() as usize) * (self.level_extent() as usize) + self.x() as usize
    }

    /// The covering tile one level coarser, or `None` for the root.
    pub fn parent(self) -> Option<TileAddress> {
        (!self.is_root()).then(|| self.ancestor(self.level() - 1))
    }

    /// The covering tile at `level`. Levels finer than this tile clamp to self.
    pub fn ancestor(self, level: u8) -> TileAddress {
        let level = level.min(self.level());
        let shift = self.level() - level;
        TileAddress(((self.x() >> shift) << X_SHIFT) | ((self.y() >> shift) << Y_SHIFT) | level as u32)
    }

    /// The four tiles one level finer, or `None` at the bit-budget limit.
    pub fn children(self) -> Option<[TileAddress; 4]> {
        if self.level() >= MAX_LEVEL {
            return None;
        }
        let (x, y, level) = (self.x() << 1, self.y() << 1, self.level() + 1);
        let make = |cx: u32, cy: u32| TileAddress((cx << X_SHIFT) | (cy << Y_SHIFT) | level as u32);
        Some([make(x, y), make(x + 1, y), make(x, y + 1), make(x + 1, y + 1)])
    }

    /// Whether `self` lies strictly under `ancestor` in the quad-tree.
    pub fn is_descendant_of(self, ancestor: TileAddress) -> bool {
        self.level() > ancestor.level() && self.ancestor(ancestor.level()) == ancestor
    }
}

impl fmt::Display for TileAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}@{}", self.x(), self.y(), self.level())
    }
}
