//! Per-frame statistics.

use std::fmt;

use serde::Serialize;

/// What one frame of reconciliation did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FrameReport {
    pub frame: u64,

    /// Distinct tiles reported visible.
    pub used: usize,
    /// Samples dropped because they fall outside the pyramid.
    pub skipped_samples: usize,

    pub released: usize,
    pub restored: usize,
    pub already_resident: usize,
    /// Loads accepted by the queue this frame, ancestors included.
    pub requested: usize,

    pub committed: usize,
    /// Loads discarded because the tile was already resident.
    pub superseded: usize,
    /// Payloads the cache refused.
    pub rejected: usize,
    pub evicted: u64,

    /// Queue depth after the frame.
    pub pending: usize,
    pub in_flight: usize,
}

impl FrameReport {
    pub fn new(frame: u64) -> Self {
        Self {
            frame,
            ..Default::default()
        }
    }

    /// Whether the frame changed cache contents.
    pub fn changed_residency(&self) -> bool {
        self.released + self.restored + self.committed > 0 || self.evicted > 0
    }
}

impl fmt::Display for FrameReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "frame {}: used={} requested={} committed={} evicted={} released={} restored={} queue={}+{}",
            self.frame,
            self.used,
            self.requested,
            self.committed,
            self.evicted,
            self.released,
            self.restored,
            self.pending,
            self.in_flight
        )
    }
}
