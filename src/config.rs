//! Runtime configuration for vt-pager.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! All paging knobs (tile geometry, atlas capacity, pyramid depth, streaming
//! limits) live here and are validated once, before any state is built.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tile::address::MAX_LEVEL;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "vt-pager", about = "Sparse texture paging simulator")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Number of frames to simulate.
    #[arg(short, long, default_value_t = 240)]
    pub frames: u64,

    /// Frame interval in milliseconds.
    #[arg(long, default_value_t = 16)]
    pub frame_ms: u64,

    /// Serve tiles from this directory instead of the synthetic source.
    #[arg(long)]
    pub tiles: Option<PathBuf>,

    /// Dump Prometheus metrics after the run.
    #[arg(long)]
    pub metrics: bool,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("tile size {0} must be a non-zero power of two")]
    TileSize(u32),

    #[error("padding {padding} too large for tile size {tile_size}")]
    Padding { padding: u32, tile_size: u32 },

    #[error("atlas needs at least one slot")]
    ZeroCapacity,

    #[error("atlas grid of {0} columns exceeds the addressable range")]
    AtlasTooWide(u32),

    #[error("max level {0} exceeds the address bit budget ({MAX_LEVEL})")]
    MaxLevel(u8),

    #[error("min resident level {min} is above max level {max}")]
    MinResidentLevel { min: u8, max: u8 },

    #[error("{pinned} pinned tiles leave no evictable slot in a cache of {slots}")]
    PinnedSetTooLarge { pinned: usize, slots: usize },

    #[error("concurrency limit must be at least 1")]
    ZeroConcurrency,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Atlas geometry and capacity.
    pub atlas: AtlasConfig,

    /// Mip pyramid of the logical image.
    pub pyramid: PyramidConfig,

    /// Tile streaming.
    pub streaming: StreamingConfig,
}

/// Atlas (page cache backing store) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AtlasConfig {
    /// Usable tile edge in pixels.
    pub tile_size: u32,

    /// Border pixels on each side of a tile.
    pub padding: u32,

    /// Number of slots in the cache.
    pub slots: usize,

    /// Derive a mip chain for each committed tile.
    pub generate_mips: bool,
}

impl Default for AtlasConfig {
    fn default() -> Self {
        Self {
            tile_size: 128,
            padding: 4,
            slots: 64,
            generate_mips: true,
        }
    }
}

impl AtlasConfig {
    /// Edge of a tile including padding on both sides.
    pub fn padded_tile_size(&self) -> u32 {
        self.tile_size + 2 * self.padding
    }

    /// Number of atlas mip levels written per tile (1 when mips are off).
    pub fn mip_count(&self) -> u32 {
        if self.generate_mips {
            self.padded_tile_size().ilog2() + 1
        } else {
            1
        }
    }
}

/// Logical image pyramid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PyramidConfig {
    /// Finest level; level 0 is the single root tile.
    pub max_level: u8,

    /// Levels `0..=min_resident_level` are pinned in the cache.
    pub min_resident_level: u8,
}

impl Default for PyramidConfig {
    fn default() -> Self {
        Self {
            max_level: 6,
            min_resident_level: 0,
        }
    }
}

impl PyramidConfig {
    /// Number of tiles at levels `0..=min_resident_level`.
    pub fn pinned_tile_count(&self) -> usize {
        (0..=self.min_resident_level as u32).map(|l| 1usize << (2 * l)).sum()
    }
}

/// Streaming queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Maximum fetches in flight.
    pub max_concurrent: usize,

    /// Per-fetch timeout in milliseconds (0 = none).
    pub fetch_timeout_ms: u64,

    /// Retries after a failed fetch before the request is dropped.
    pub max_retries: u32,

    /// Base backoff between retries, doubled per attempt.
    pub retry_backoff_ms: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            fetch_timeout_ms: 5_000,
            max_retries: 2,
            retry_backoff_ms: 50,
        }
    }
}

impl StreamingConfig {
    pub fn fetch_timeout(&self) -> Option<Duration> {
        (self.fetch_timeout_ms > 0).then(|| Duration::from_millis(self.fetch_timeout_ms))
    }

    /// Backoff before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str(&data)?
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the paging core cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let atlas = &self.atlas;
        if atlas.tile_size == 0 || !atlas.tile_size.is_power_of_two() {
            return Err(ConfigError::TileSize(atlas.tile_size));
        }
        if atlas.padding >= atlas.tile_size / 2 && atlas.padding > 0 {
            return Err(ConfigError::Padding {
                padding: atlas.padding,
                tile_size: atlas.tile_size,
            });
        }
        if atlas.slots == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        let columns = (atlas.slots as f64).sqrt().ceil() as u32;
        if columns > u16::MAX as u32 {
            return Err(ConfigError::AtlasTooWide(columns));
        }

        let pyramid = &self.pyramid;
        if pyramid.max_level > MAX_LEVEL {
            return Err(ConfigError::MaxLevel(pyramid.max_level));
        }
        if pyramid.min_resident_level > pyramid.max_level {
            return Err(ConfigError::MinResidentLevel {
                min: pyramid.min_resident_level,
                max: pyramid.max_level,
            });
        }
        let pinned = pyramid.pinned_tile_count();
        if pinned >= atlas.slots {
            return Err(ConfigError::PinnedSetTooLarge {
                pinned,
                slots: atlas.slots,
            });
        }

        if self.streaming.max_concurrent == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        Ok(())
    }
}
