//! End-to-end tests for the frame loop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use vt_pager::cache::atlas::{AtlasLayout, HostAtlas};
use vt_pager::cache::slot::TileStatus;
use vt_pager::config::{AtlasConfig, Config, PyramidConfig, StreamingConfig};
use vt_pager::frame::orchestrator::Orchestrator;
use vt_pager::streaming::disk_source::DirectoryTileSource;
use vt_pager::streaming::source::{FetchError, SyntheticTileSource, TileImage, TileSource};
use vt_pager::tile::address::TileAddress;

fn test_config(slots: usize, max_level: u8, max_concurrent: usize) -> Config {
    Config {
        atlas: AtlasConfig {
            tile_size: 4,
            padding: 1,
            slots,
            generate_mips: true,
        },
        pyramid: PyramidConfig {
            max_level,
            min_resident_level: 0,
        },
        streaming: StreamingConfig {
            max_concurrent,
            fetch_timeout_ms: 1_000,
            max_retries: 0,
            retry_backoff_ms: 1,
        },
    }
}

fn new_pager(config: Config, source: Arc<dyn TileSource>) -> Orchestrator {
    let atlas = Box::new(HostAtlas::new(&AtlasLayout::new(&config.atlas)));
    Orchestrator::new(config, source, atlas).unwrap()
}

fn addr(x: u32, y: u32, level: u8) -> TileAddress {
    TileAddress::new(x, y, level).unwrap()
}

/// Synthetic tiles where one address takes much longer than the rest.
struct SlowTile {
    inner: SyntheticTileSource,
    slow: TileAddress,
    delay: Duration,
}

#[async_trait]
impl TileSource for SlowTile {
    async fn fetch(&self, address: TileAddress) -> Result<TileImage, FetchError> {
        if address == self.slow {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.fetch(address).await
    }
}

#[tokio::test]
async fn test_fine_tile_served_by_root_until_loaded() {
    let source = Arc::new(SyntheticTileSource::new(6));
    let mut pager = new_pager(test_config(16, 3, 2), source);
    pager.bootstrap().await.unwrap();
    let root = pager.cache().slot_for(TileAddress::ROOT).unwrap();
    let fine = addr(5, 2, 3);

    // First frame: nothing has arrived, the root stands in.
    let report = pager.run_frame([(5, 2, 3)]).unwrap();
    assert_eq!(report.requested, 3);
    assert_eq!(pager.index().resolve(fine), Some(root));
    assert_eq!(pager.index().level_snapshot(3).unwrap()[2 * 8 + 5].source_level, 0);

    // Once the loads land the tile is served by its own slot.
    pager.settle().await;
    pager.run_frame([(5, 2, 3)]).unwrap();
    let own = pager.cache().slot_for(fine).unwrap();
    assert_eq!(pager.cache().status(fine), TileStatus::Resident);
    assert_eq!(pager.index().resolve(fine), Some(own));
    assert_eq!(pager.index().level_snapshot(3).unwrap()[2 * 8 + 5].source_level, 3);
}

#[tokio::test]
async fn test_shared_ancestor_committed_after_trigger_lands() {
    let parent = addr(1, 1, 1);
    let first = addr(3, 3, 2);
    let second = addr(2, 2, 2);
    let source = Arc::new(SlowTile {
        inner: SyntheticTileSource::new(6),
        slow: parent,
        delay: Duration::from_millis(80),
    });
    let mut pager = new_pager(test_config(8, 2, 2), source);
    pager.bootstrap().await.unwrap();

    // The parent is requested on behalf of the first tile.
    let report = pager.run_frame([(3, 3, 2)]).unwrap();
    assert_eq!(report.requested, 2);
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The first tile lands; the second tile shares the parent still in flight.
    let report = pager.run_frame([(3, 3, 2), (2, 2, 2)]).unwrap();
    assert_eq!(report.committed, 1);
    assert_eq!(report.requested, 1);
    assert!(pager.queue().contains(parent));

    pager.settle().await;
    let report = pager.run_frame([(3, 3, 2), (2, 2, 2)]).unwrap();
    assert_eq!(report.superseded, 0);
    assert_eq!(pager.cache().status(first), TileStatus::Resident);
    assert_eq!(pager.cache().status(parent), TileStatus::Resident);
    assert_eq!(pager.cache().status(second), TileStatus::Resident);

    // A sibling that never loaded is served by the shared parent.
    let report = pager.run_frame([(3, 3, 2)]).unwrap();
    assert_eq!(report.requested, 0);
    let parent_slot = pager.cache().slot_for(parent);
    assert!(parent_slot.is_some());
    assert_eq!(pager.index().resolve(addr(2, 3, 2)), parent_slot);
}

#[tokio::test]
async fn test_queue_stays_within_concurrency_limit() {
    let source = Arc::new(SyntheticTileSource::new(6).with_latency(Duration::from_millis(5)));
    let mut pager = new_pager(test_config(32, 3, 2), source);
    pager.bootstrap().await.unwrap();

    for frame in 0..10u32 {
        let samples: Vec<_> = (0..8).map(|i| ((i + frame) % 8, i, 3)).collect();
        let report = pager.run_frame(samples).unwrap();
        assert!(report.in_flight <= 2);
        assert!(pager.queue().in_flight_count() <= 2);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    pager.settle().await;

    let stats = pager.queue().stats();
    assert!(stats.peak_in_flight <= 2);
    assert!(stats.total_completed > 0);
    assert_eq!(stats.total_failed, 0);
}

#[tokio::test]
async fn test_small_cache_keeps_root_and_consistent_index() {
    let source = Arc::new(SyntheticTileSource::new(6));
    let mut pager = new_pager(test_config(4, 3, 2), source);
    pager.bootstrap().await.unwrap();

    for i in 0..16u32 {
        let sample = [(i % 8, 7 - i % 8, 3)];
        pager.run_frame(sample).unwrap();
        pager.settle().await;
        pager.run_frame(sample).unwrap();

        assert_eq!(pager.cache().status(TileAddress::ROOT), TileStatus::Resident);
        let snapshot = pager.index().level_snapshot(3).unwrap();
        assert!(snapshot.iter().all(|e| e.is_resolved()));

        for y in 0..8 {
            for x in 0..8 {
                let address = addr(x, y, 3);
                let slot = pager.index().resolve(address).unwrap();
                let source = pager.cache().slot(slot).and_then(|s| s.address).unwrap();
                assert!(source == address || address.is_descendant_of(source));
            }
        }
    }
    assert!(pager.cache().eviction_count() > 0);
    assert!(pager.metrics().tiles_evicted.get() > 0);
}

#[tokio::test]
async fn test_failed_tile_falls_back_to_ancestor() {
    let source = Arc::new(SyntheticTileSource::new(6));
    let fine = addr(3, 3, 2);
    source.fail(fine);
    let mut pager = new_pager(test_config(8, 2, 2), source.clone());
    pager.bootstrap().await.unwrap();

    pager.run_frame([(3, 3, 2)]).unwrap();
    pager.settle().await;
    let report = pager.run_frame([(3, 3, 2)]).unwrap();

    let parent = addr(1, 1, 1);
    assert_eq!(pager.cache().status(parent), TileStatus::Resident);
    assert_eq!(pager.cache().status(fine), TileStatus::Absent);
    assert_eq!(pager.index().resolve(fine), pager.cache().slot_for(parent));
    assert_eq!(pager.metrics().fetch_failures.get(), 1);
    // The fine tile is asked for again.
    assert_eq!(report.requested, 1);

    source.heal(fine);
    pager.settle().await;
    pager.run_frame([(3, 3, 2)]).unwrap();
    assert_eq!(pager.cache().status(fine), TileStatus::Resident);
}

#[tokio::test]
async fn test_directory_source_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let disk = DirectoryTileSource::new(dir.path(), 6);
    let pixels = vec![90u8; TileImage::byte_len(6)];
    disk.store(TileAddress::ROOT, &pixels, false).await.unwrap();
    disk.store(addr(1, 0, 1), &pixels, true).await.unwrap();

    let mut pager = new_pager(test_config(8, 2, 1), Arc::new(disk));
    pager.bootstrap().await.unwrap();

    pager.run_frame([(1, 0, 1)]).unwrap();
    pager.settle().await;
    let report = pager.run_frame([(1, 0, 1)]).unwrap();
    assert_eq!(report.committed, 1);
    assert_eq!(pager.cache().status(addr(1, 0, 1)), TileStatus::Resident);

    // A tile missing on disk degrades to the root.
    pager.run_frame([(0, 1, 1)]).unwrap();
    pager.settle().await;
    pager.run_frame([(0, 1, 1)]).unwrap();
    assert_eq!(pager.cache().status(addr(0, 1, 1)), TileStatus::Absent);
    assert_eq!(
        pager.index().resolve(addr(0, 1, 1)),
        pager.cache().slot_for(TileAddress::ROOT)
    );
}

#[tokio::test]
async fn test_metrics_track_frame_activity() {
    let source = Arc::new(SyntheticTileSource::new(6));
    let mut pager = new_pager(test_config(8, 2, 2), source);
    pager.bootstrap().await.unwrap();

    pager.run_frame([(2, 2, 2)]).unwrap();
    pager.settle().await;
    pager.run_frame([(2, 2, 2)]).unwrap();
    pager.run_frame(std::iter::empty()).unwrap();

    let metrics = pager.metrics();
    // Root at bootstrap plus (1,1)@1 and (2,2)@2.
    assert_eq!(metrics.tiles_requested.get(), 3);
    assert!(metrics.tiles_committed.get() >= 2);
    assert!(metrics.tiles_released.get() >= 1);
    assert!(metrics.encode().contains("vt_pager_tiles_requested_total 3"));
}
