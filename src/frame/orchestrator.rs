//! Orchestrator: the per-frame reconciliation loop.
//!
//! The orchestrator is the central coordinator of the pager. Each frame it:
//! - Folds the visibility samples into the usage table
//! - Releases tiles nobody looked at and restores or requests the ones in use
//! - Commits fetched tiles into the cache and points the index at them
//! - Rebuilds the indirection snapshot for the read side

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::atlas::AtlasStore;
use crate::cache::page_cache::{CacheError, PageCache};
use crate::cache::slot::TileStatus;
use crate::config::{Config, ConfigError};
use crate::frame::report::FrameReport;
use crate::indirection::table::IndirectionIndex;
use crate::metrics::PagerMetrics;
use crate::streaming::queue::{LoadedTile, StreamingQueue, TileRequest};
use crate::streaming::source::TileSource;
use crate::tile::address::TileAddress;
use crate::tile::usage::UsageTable;

#[derive(Error, Debug)]
pub enum PagerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("pinned tile {0} could not be loaded")]
    Bootstrap(TileAddress),
}

/// Owns the cache, index, queue and usage table and drives them per frame.
pub struct Orchestrator {
    config: Config,
    cache: PageCache,
    index: IndirectionIndex,
    queue: StreamingQueue,
    usage: UsageTable,
    metrics: PagerMetrics,
    frame: u64,
    failures_seen: u64,
}

impl Orchestrator {
    /// Validate `config` and build an empty pager.
    ///
    /// Fetches are spawned on the ambient tokio runtime, so [`bootstrap`] and
    /// [`run_frame`] must be called from within one.
    ///
    /// [`bootstrap`]: Self::bootstrap
    /// [`run_frame`]: Self::run_frame
    pub fn new(config: Config, source: Arc<dyn TileSource>, store: Box<dyn AtlasStore>) -> Result<Self, PagerError> {
        config.validate()?;
        let cache = PageCache::new(&config.atlas, store);
        let index = IndirectionIndex::new(config.pyramid.max_level);
        let queue = StreamingQueue::new(config.streaming.clone(), source);
        let metrics = PagerMetrics::new()?;

        info!(
            slots = cache.capacity(),
            atlas_width = cache.layout().width(),
            atlas_height = cache.layout().height(),
            max_level = config.pyramid.max_level,
            pinned_levels = config.pyramid.min_resident_level + 1,
            "Pager created"
        );

        Ok(Self {
            config,
            cache,
            index,
            queue,
            usage: UsageTable::new(),
            metrics,
            frame: 0,
            failures_seen: 0,
        })
    }

    /// Load every tile of the pinned levels as forced and wait for them.
    pub async fn bootstrap(&mut self) -> Result<(), PagerError> {
        let pinned = self.pinned_tiles();
        for &address in &pinned {
            if self.cache.status(address) != TileStatus::Resident
                && self.queue.enqueue(TileRequest::new(address, u32::MAX).forced())
            {
                self.metrics.tiles_requested.inc();
            }
        }
        self.queue.settle().await;

        let mut report = FrameReport::new(self.frame);
        self.commit_loads(&mut report)?;
        self.sync_failures();

        if let Some(&missing) = pinned
            .iter()
            .find(|&&a| self.cache.status(a) != TileStatus::Resident)
        {
            return Err(PagerError::Bootstrap(missing));
        }

        self.index.rebuild(&self.cache, self.frame);
        self.update_gauges();
        info!(pinned = pinned.len(), committed = report.committed, "Bootstrap complete");
        Ok(())
    }

    /// Run one frame over the given `(x, y, level)` visibility samples.
    pub fn run_frame<I>(&mut self, samples: I) -> Result<FrameReport, PagerError>
    where
        I: IntoIterator<Item = (u32, u32, u8)>,
    {
        self.frame += 1;
        let mut report = FrameReport::new(self.frame);

        self.acquire_usage(samples, &mut report);
        self.reconcile(&mut report);
        self.commit_loads(&mut report)?;
        self.index.rebuild(&self.cache, self.frame);
        self.usage.clear();

        self.sync_failures();
        self.update_gauges();
        report.pending = self.queue.pending_count();
        report.in_flight = self.queue.in_flight_count();

        if report.changed_residency() {
            debug!(
                frame = report.frame,
                used = report.used,
                requested = report.requested,
                committed = report.committed,
                evicted = report.evicted,
                "Frame reconciled"
            );
        }
        Ok(report)
    }

    /// Wait for every outstanding fetch to finish.
    pub async fn settle(&self) {
        self.queue.settle().await;
    }

    fn acquire_usage<I>(&mut self, samples: I, report: &mut FrameReport)
    where
        I: IntoIterator<Item = (u32, u32, u8)>,
    {
        let max_level = self.config.pyramid.max_level;
        for (x, y, level) in samples {
            match TileAddress::bounded(x, y, level, max_level) {
                Ok(address) => self.usage.add(address),
                Err(err) => {
                    debug!(x, y, level, error = %err, "Skipped feedback sample");
                    report.skipped_samples += 1;
                }
            }
        }
        if report.skipped_samples > 0 {
            warn!(
                frame = self.frame,
                skipped = report.skipped_samples,
                "Feedback samples outside the pyramid"
            );
            self.metrics.samples_skipped.inc_by(report.skipped_samples as u64);
        }
        report.used = self.usage.len();
    }

    fn reconcile(&mut self, report: &mut FrameReport) {
        let pinned_level = self.config.pyramid.min_resident_level;
        let unused: Vec<TileAddress> = self
            .cache
            .cached_tiles()
            .map(|(address, _)| address)
            .filter(|&a| a.level() > pinned_level && !self.usage.is_used(a))
            .collect();
        for address in unused {
            if self.cache.release(address) {
                report.released += 1;
                self.metrics.tiles_released.inc();
            }
        }

        let used: Vec<(TileAddress, u32)> = self.usage.iter().collect();
        for (address, hits) in used {
            match self.cache.status(address) {
                TileStatus::Resident => {
                    self.cache.touch(address, self.frame, hits);
                    report.already_resident += 1;
                }
                TileStatus::PendingDelete => {
                    self.restore(address, hits, report);
                }
                TileStatus::Absent => self.request_with_ancestors(address, hits, report),
            }
        }
    }

    /// Take back a pending-delete tile and drop any load queued for it.
    fn restore(&mut self, address: TileAddress, hits: u32, report: &mut FrameReport) -> bool {
        let Some(slot) = self.cache.restore(address) else {
            return false;
        };
        self.index.set(address, slot);
        self.cache.touch(address, self.frame, hits);
        self.queue.cancel(address);
        report.restored += 1;
        self.metrics.tiles_restored.inc();
        true
    }

    /// Request `address` and every missing ancestor, coarsest first, so
    /// something renders while the fine tile streams in.
    fn request_with_ancestors(&mut self, address: TileAddress, hits: u32, report: &mut FrameReport) {
        for level in 0..=address.level() {
            let tile = address.ancestor(level);
            match self.cache.status(tile) {
                TileStatus::Resident => {}
                TileStatus::PendingDelete => {
                    self.restore(tile, 0, report);
                }
                TileStatus::Absent => {
                    let request = TileRequest::new(tile, hits).triggered_by(address);
                    if self.queue.enqueue(request) {
                        report.requested += 1;
                        self.metrics.tiles_requested.inc();
                    }
                }
            }
        }
    }

    fn commit_loads(&mut self, report: &mut FrameReport) -> Result<(), PagerError> {
        let evictions_before = self.cache.eviction_count();

        for LoadedTile { request, image } in self.queue.take_completed() {
            let address = request.address;
            // Ancestors are shared by every tile under them: only the tile's
            // own residency makes a load redundant.
            if self.cache.status(address) == TileStatus::Resident {
                debug!(tile = %address, trigger = ?request.trigger, "Dropped superseded load");
                report.superseded += 1;
                continue;
            }

            let slot = self.cache.reserve(address, request.forced, &mut self.index)?;
            match self.cache.commit(address, slot, &image) {
                Ok(()) => {
                    self.index.set(address, slot);
                    let hits = self.usage.hits(address).unwrap_or(0);
                    self.cache.touch(address, self.frame, hits);
                    report.committed += 1;
                    self.metrics.tiles_committed.inc();
                }
                Err(CacheError::PayloadSize { .. }) => report.rejected += 1,
                Err(err) => return Err(err.into()),
            }
        }

        let evicted = self.cache.eviction_count() - evictions_before;
        report.evicted += evicted;
        self.metrics.tiles_evicted.inc_by(evicted);
        Ok(())
    }

    fn sync_failures(&mut self) {
        let failed = self.queue.stats().total_failed;
        self.metrics.fetch_failures.inc_by(failed - self.failures_seen);
        self.failures_seen = failed;
    }

    fn update_gauges(&self) {
        self.metrics.resident_slots.set(self.cache.stats().used as i64);
        self.metrics.in_flight.set(self.queue.in_flight_count() as i64);
    }

    /// Every tile at levels `0..=min_resident_level`, coarse to fine.
    fn pinned_tiles(&self) -> Vec<TileAddress> {
        (0..=self.config.pyramid.min_resident_level)
            .flat_map(|level| {
                let extent = 1u32 << level;
                (0..extent).flat_map(move |y| (0..extent).filter_map(move |x| TileAddress::new(x, y, level).ok()))
            })
            .collect()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &PageCache {
        &self.cache
    }

    pub fn index(&self) -> &IndirectionIndex {
        &self.index
    }

    pub fn queue(&self) -> &StreamingQueue {
        &self.queue
    }

    pub fn usage(&self) -> &UsageTable {
        &self.usage
    }

    pub fn metrics(&self) -> &PagerMetrics {
        &self.metrics
    }

    /// Frames run so far.
    pub fn frame(&self) -> u64 {
        self.frame
    }
}
