//! vt-pager: sparse texture paging simulator.
//!
//! Bootstraps a pager against a synthetic or on-disk tile pyramid, then
//! drives it with a viewer that pans and zooms across the image, one
//! feedback pass per frame.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use vt_pager::cache::atlas::{AtlasLayout, HostAtlas};
use vt_pager::config::{Cli, Config};
use vt_pager::frame::orchestrator::Orchestrator;
use vt_pager::streaming::disk_source::DirectoryTileSource;
use vt_pager::streaming::source::{SyntheticTileSource, TileSource};

/// Feedback samples per side of the simulated screen.
const FEEDBACK_GRID: u32 = 16;

/// A camera drifting over the image while zooming in and out.
struct Viewer {
    max_level: u8,
}

impl Viewer {
    /// Visible `(x, y, level)` samples for `frame`.
    fn samples(&self, frame: u64) -> Vec<(u32, u32, u8)> {
        let t = frame as f64 * 0.01;
        let zoom = (t * 0.5).sin() * 0.5 + 0.5;
        let level = (zoom * self.max_level as f64).round() as u8;
        let extent = 1u32 << level;

        // The viewport spans about two tiles of the chosen level.
        let span = (2.0 / extent as f64).min(1.0);
        let cx = 0.5 + 0.35 * t.cos();
        let cy = 0.5 + 0.35 * (t * 0.7).sin();

        let step = 1.0 / (FEEDBACK_GRID - 1) as f64;
        let mut out = Vec::with_capacity((FEEDBACK_GRID * FEEDBACK_GRID) as usize);
        for sy in 0..FEEDBACK_GRID {
            for sx in 0..FEEDBACK_GRID {
                let u = (cx + (sx as f64 * step - 0.5) * span).clamp(0.0, 1.0);
                let v = (cy + (sy as f64 * step - 0.5) * span).clamp(0.0, 1.0);
                let x = ((u * extent as f64) as u32).min(extent - 1);
                let y = ((v * extent as f64) as u32).min(extent - 1);
                out.push((x, y, level));
            }
        }
        out
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose { "vt_pager=debug" } else { "vt_pager=info" };
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());
    if cli.log_json {
        tracing_subscriber::fmt().json().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }

    info!("vt-pager v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Config::load(&cli.config)?;
    info!(
        tile_size = config.atlas.tile_size,
        padding = config.atlas.padding,
        slots = config.atlas.slots,
        max_level = config.pyramid.max_level,
        max_concurrent = config.streaming.max_concurrent,
        "Configuration loaded"
    );

    // Pick the tile source.
    let edge = config.atlas.padded_tile_size();
    let source: Arc<dyn TileSource> = match &cli.tiles {
        Some(dir) => {
            info!(root = %dir.display(), "Serving tiles from directory");
            Arc::new(DirectoryTileSource::new(dir, edge))
        }
        None => {
            let latency = Duration::from_millis(cli.frame_ms * 3);
            info!(latency_ms = latency.as_millis() as u64, "Serving synthetic tiles");
            Arc::new(SyntheticTileSource::new(edge).with_latency(latency))
        }
    };

    let atlas = Box::new(HostAtlas::new(&AtlasLayout::new(&config.atlas)));
    let viewer = Viewer {
        max_level: config.pyramid.max_level,
    };
    let mut pager = Orchestrator::new(config, source, atlas)?;
    pager.bootstrap().await?;

    // Frame loop.
    let mut ticker = tokio::time::interval(Duration::from_millis(cli.frame_ms.max(1)));
    let (mut committed, mut evicted, mut requested) = (0usize, 0u64, 0usize);
    for _ in 0..cli.frames {
        ticker.tick().await;
        let report = pager.run_frame(viewer.samples(pager.frame() + 1))?;
        committed += report.committed;
        evicted += report.evicted;
        requested += report.requested;
        if report.frame % 60 == 0 {
            info!("{report}");
        }
    }

    pager.settle().await;
    let stats = pager.cache().stats();
    let queue = pager.queue().stats();
    info!(
        frames = pager.frame(),
        requested,
        committed,
        evicted,
        resident = stats.used,
        pending_delete = stats.pending_delete,
        fetch_failures = queue.total_failed,
        peak_in_flight = queue.peak_in_flight,
        "Simulation finished"
    );

    if cli.metrics {
        println!("{}", pager.metrics().encode());
    }

    Ok(())
}
