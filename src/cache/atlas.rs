//! Atlas layout and backing store.
//!
//! The atlas is a grid of padded tiles. The cache only computes where a
//! slot lives and hands pixels to an [`AtlasStore`]; the store owns the
//! actual image memory (a device texture in a renderer, a host buffer here).

use bytemuck::{Pod, Zeroable};
use tracing::trace;

use crate::cache::slot::SlotId;
use crate::config::AtlasConfig;

/// Bytes per RGBA8 pixel.
pub const BYTES_PER_PIXEL: usize = 4;

/// One RGBA8 texel.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Rgba8 {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

/// A rectangle of one atlas mip level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtlasRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub mip: u32,
}

/// Slot grid geometry.
#[derive(Debug, Clone)]
pub struct AtlasLayout {
    /// Slots per row.
    pub columns: u32,
    /// Slot rows.
    pub rows: u32,
    /// Edge of a padded tile in pixels.
    pub padded_tile: u32,
    /// Border pixels on each side of a tile.
    pub padding: u32,
    /// Mip levels written per tile.
    pub mip_count: u32,
    /// Total slots.
    pub capacity: usize,
}

impl AtlasLayout {
    pub fn new(config: &AtlasConfig) -> Self {
        let capacity = config.slots.max(1);
        let columns = (capacity as f64).sqrt().ceil() as u32;
        let rows = (capacity as u32).div_ceil(columns);
        Self {
            columns,
            rows,
            padded_tile: config.padded_tile_size(),
            padding: config.padding,
            mip_count: config.mip_count(),
            capacity,
        }
    }

    /// Atlas width in pixels at mip 0.
    pub fn width(&self) -> u32 {
        self.columns * self.padded_tile
    }

    /// Atlas height in pixels at mip 0.
    pub fn height(&self) -> u32 {
        self.rows * self.padded_tile
    }

    /// Grid cell of a slot as (column, row).
    pub fn cell(&self, slot: SlotId) -> (u32, u32) {
        (slot.0 % self.columns, slot.0 / self.columns)
    }

    /// Top-left pixel of a slot's padded tile at mip 0.
    pub fn pixel_origin(&self, slot: SlotId) -> (u32, u32) {
        let (col, row) = self.cell(slot);
        (col * self.padded_tile, row * self.padded_tile)
    }

    /// Top-left of the usable (unpadded) area in normalised atlas coordinates.
    pub fn uv_origin(&self, slot: SlotId) -> (f32, f32) {
        let (x, y) = self.pixel_origin(slot);
        (
            (x + self.padding) as f32 / self.width() as f32,
            (y + self.padding) as f32 / self.height() as f32,
        )
    }

    /// Region occupied by a slot at `mip`, or `None` once the tile shrinks to nothing.
    pub fn region(&self, slot: SlotId, mip: u32) -> Option<AtlasRegion> {
        let edge = self.padded_tile >> mip;
        if edge == 0 || mip >= self.mip_count {
            return None;
        }
        let (x, y) = self.pixel_origin(slot);
        Some(AtlasRegion {
            x: x >> mip,
            y: y >> mip,
            width: edge,
            height: edge,
            mip,
        })
    }

    /// Expected byte length of a padded tile payload.
    pub fn tile_bytes(&self) -> usize {
        (self.padded_tile as usize).pow(2) * BYTES_PER_PIXEL
    }
}

/// Destination of committed tile pixels.
pub trait AtlasStore: Send {
    /// Copy tightly packed RGBA8 `pixels` into `region`.
    fn write(&mut self, region: AtlasRegion, pixels: &[u8]);
}

/// Host-memory RGBA8 atlas with one buffer per mip level.
#[derive(Debug)]
pub struct HostAtlas {
    levels: Vec<Vec<u8>>,
    widths: Vec<u32>,
    heights: Vec<u32>,
    writes: u64,
}

impl HostAtlas {
    pub fn new(layout: &AtlasLayout) -> Self {
        let mut levels = Vec::new();
        let mut widths = Vec::new();
        let mut heights = Vec::new();
        for mip in 0..layout.mip_count {
            let w = (layout.width() >> mip).max(1);
            let h = (layout.height() >> mip).max(1);
            levels.push(vec![0u8; w as usize * h as usize * BYTES_PER_PIXEL]);
            widths.push(w);
            heights.push(h);
        }
        Self {
            levels,
            widths,
            heights,
            writes: 0,
        }
    }

    /// Read one texel.
    pub fn pixel(&self, x: u32, y: u32, mip: u32) -> Option<Rgba8> {
        let level = self.levels.get(mip as usize)?;
        let width = self.widths[mip as usize];
        if x >= width || y >= self.heights[mip as usize] {
            return None;
        }
        let texels: &[Rgba8] = bytemuck::cast_slice(level);
        texels.get((y * width + x) as usize).copied()
    }

    /// Raw bytes of one mip level, row-major.
    pub fn level_bytes(&self, mip: u32) -> Option<&[u8]> {
        self.levels.get(mip as usize).map(Vec::as_slice)
    }

    /// Number of region writes received.
    pub fn write_count(&self) -> u64 {
        self.writes
    }
}

impl AtlasStore for HostAtlas {
    fn write(&mut self, region: AtlasRegion, pixels: &[u8]) {
        let Some(level) = self.levels.get_mut(region.mip as usize) else {
            return;
        };
        let atlas_width = self.widths[region.mip as usize] as usize;
        let row_bytes = region.width as usize * BYTES_PER_PIXEL;

        for row in 0..region.height as usize {
            let src = &pixels[row * row_bytes..(row + 1) * row_bytes];
            let dst_start = ((region.y as usize + row) * atlas_width + region.x as usize) * BYTES_PER_PIXEL;
            level[dst_start..dst_start + row_bytes].copy_from_slice(src);
        }
        self.writes += 1;
        trace!(x = region.x, y = region.y, mip = region.mip, "Atlas region written");
    }
}

/// Halve an RGBA8 image with a 2×2 box filter. Odd edges clamp.
pub fn downsample(pixels: &[u8], width: u32, height: u32) -> (Vec<u8>, u32, u32) {
    let src: &[Rgba8] = bytemuck::cast_slice(pixels);
    let out_w = (width / 2).max(1);
    let out_h = (height / 2).max(1);
    let mut out = vec![Rgba8::default(); (out_w * out_h) as usize];

    let at = |x: u32, y: u32| src[(y.min(height - 1) * width + x.min(width - 1)) as usize];
    for y in 0..out_h {
        for x in 0..out_w {
            let quad = [
                at(2 * x, 2 * y),
                at(2 * x + 1, 2 * y),
                at(2 * x, 2 * y + 1),
                at(2 * x + 1, 2 * y + 1),
            ];
            let avg = |f: fn(&Rgba8) -> u8| {
                let sum: u32 = quad.iter().map(|p| f(p) as u32).sum();
                ((sum + 2) / 4) as u8
            };
            out[(y * out_w + x) as usize] = Rgba8 {
                r: avg(|p| p.r),
                g: avg(|p| p.g),
                b: avg(|p| p.b),
                a: avg(|p| p.a),
            };
        }
    }
    (bytemuck::cast_slice(&out).to_vec(), out_w, out_h)
}
