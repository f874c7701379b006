//! Prometheus metrics for the paging loop.
//!
//! Each orchestrator owns its own registry so several pagers (and tests) can
//! coexist in one process.

use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};

/// Counters and gauges updated by the frame loop.
#[derive(Clone)]
pub struct PagerMetrics {
    registry: Registry,

    pub tiles_requested: IntCounter,
    pub tiles_committed: IntCounter,
    pub tiles_evicted: IntCounter,
    pub tiles_released: IntCounter,
    pub tiles_restored: IntCounter,
    pub fetch_failures: IntCounter,
    pub samples_skipped: IntCounter,

    pub resident_slots: IntGauge,
    pub in_flight: IntGauge,
}

impl PagerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("vt_pager".to_string()), None)?;

        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let c = IntCounter::with_opts(Opts::new(name, help))?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };
        let tiles_requested = counter("tiles_requested_total", "Tile loads enqueued")?;
        let tiles_committed = counter("tiles_committed_total", "Tiles written into the atlas")?;
        let tiles_evicted = counter("tiles_evicted_total", "Tiles displaced from a slot")?;
        let tiles_released = counter("tiles_released_total", "Slots marked pending delete")?;
        let tiles_restored = counter("tiles_restored_total", "Pending-delete tiles taken back")?;
        let fetch_failures = counter("fetch_failures_total", "Tile fetches dropped after retries")?;
        let samples_skipped = counter("samples_skipped_total", "Feedback samples outside the pyramid")?;

        let gauge = |name: &str, help: &str| -> Result<IntGauge, prometheus::Error> {
            let g = IntGauge::with_opts(Opts::new(name, help))?;
            registry.register(Box::new(g.clone()))?;
            Ok(g)
        };
        let resident_slots = gauge("resident_slots", "Slots holding a resident tile")?;
        let in_flight = gauge("fetches_in_flight", "Tile fetches currently running")?;

        Ok(Self {
            registry,
            tiles_requested,
            tiles_committed,
            tiles_evicted,
            tiles_released,
            tiles_restored,
            fetch_failures,
            samples_skipped,
            resident_slots,
            in_flight,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every metric in the Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buf = Vec::new();
        if let Err(err) = TextEncoder::new().encode(&self.registry.gather(), &mut buf) {
            tracing::warn!(error = %err, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buf).into_owned()
    }
}
