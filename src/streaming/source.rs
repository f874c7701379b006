//! Tile sources: where tile imagery comes from.
//!
//! The paging core treats a payload as an opaque RGBA8 block of the padded
//! tile size. Decoding and transport belong to the source.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::cache::atlas::BYTES_PER_PIXEL;
use crate::tile::address::TileAddress;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("tile {0} not found")]
    NotFound(TileAddress),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("fetch of tile {0} timed out")]
    Timeout(TileAddress),

    #[error("tile {address} could not be decoded: {reason}")]
    Decode { address: TileAddress, reason: String },

    #[error("tile source unavailable: {0}")]
    Unavailable(String),
}

/// A loaded tile, tightly packed RGBA8.
#[derive(Debug, Clone)]
pub struct TileImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Bytes,
}

impl TileImage {
    /// Expected byte length for the given edge.
    pub fn byte_len(edge: u32) -> usize {
        (edge as usize).pow(2) * BYTES_PER_PIXEL
    }
}

/// Asynchronous provider of tile imagery.
#[async_trait]
pub trait TileSource: Send + Sync + 'static {
    async fn fetch(&self, address: TileAddress) -> Result<TileImage, FetchError>;
}

/// Deterministic generated tiles, for simulation and tests.
///
/// Each tile is a flat colour derived from its address with a one-pixel
/// darker border, so a misplaced tile is easy to spot in the atlas.
#[derive(Debug)]
pub struct SyntheticTileSource {
    edge: u32,
    latency: Duration,
    failing: Mutex<HashSet<TileAddress>>,
    fetches: AtomicU64,
}

impl SyntheticTileSource {
    /// `edge` is the padded tile size in pixels.
    pub fn new(edge: u32) -> Self {
        Self {
            edge,
            latency: Duration::ZERO,
            failing: Mutex::new(HashSet::new()),
            fetches: AtomicU64::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make fetches of `address` fail until [`heal`](Self::heal) is called.
    pub fn fail(&self, address: TileAddress) {
        self.failing_set().insert(address);
    }

    pub fn heal(&self, address: TileAddress) {
        self.failing_set().remove(&address);
    }

    /// Total fetch calls, failed ones included.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    fn failing_set(&self) -> std::sync::MutexGuard<'_, HashSet<TileAddress>> {
        self.failing.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Colour used for a tile's interior.
    pub fn colour(address: TileAddress) -> [u8; 4] {
        let bits = address.to_bits();
        [
            (bits >> 16) as u8 ^ 0x5a,
            (bits >> 4) as u8 ^ 0xa5,
            address.level().wrapping_mul(37),
            255,
        ]
    }

    fn render(&self, address: TileAddress) -> TileImage {
        let edge = self.edge;
        let fill = Self::colour(address);
        let border = [fill[0] / 2, fill[1] / 2, fill[2] / 2, 255];
        let mut pixels = Vec::with_capacity(TileImage::byte_len(edge));
        for y in 0..edge {
            for x in 0..edge {
                let on_border = x == 0 || y == 0 || x + 1 == edge || y + 1 == edge;
                pixels.extend_from_slice(if on_border && edge > 2 { &border } else { &fill });
            }
        }
        TileImage {
            width: edge,
            height: edge,
            pixels: Bytes::from(pixels),
        }
    }
}

#[async_trait]
impl TileSource for SyntheticTileSource {
    async fn fetch(&self, address: TileAddress) -> Result<TileImage, FetchError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.failing_set().contains(&address) {
            return Err(FetchError::Unavailable(format!("injected failure for {address}")));
        }
        Ok(self.render(address))
    }
}
