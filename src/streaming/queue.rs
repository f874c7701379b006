//! Streaming queue: bounded, prioritised tile fetching.
//!
//! Requests wait in a priority queue (highest hit count first, FIFO among
//! equals) and are dispatched as tokio tasks while fewer than
//! `max_concurrent` fetches are in flight. A finishing fetch frees its
//! concurrency slot, buffers its payload for the frame loop and dispatches
//! the next request itself, so the pipeline refills without waiting for a
//! frame. Failed fetches are retried with backoff and then dropped.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::config::StreamingConfig;
use crate::streaming::source::{FetchError, TileImage, TileSource};
use crate::tile::address::TileAddress;

/// A request to load one tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileRequest {
    /// Tile to load.
    pub address: TileAddress,

    /// Higher loads first.
    pub priority: u32,

    /// Finer tile whose use caused this ancestor request.
    pub trigger: Option<TileAddress>,

    /// Pin the tile once committed.
    pub forced: bool,

    /// Failed attempts so far.
    pub attempt: u32,
}

impl TileRequest {
    pub fn new(address: TileAddress, priority: u32) -> Self {
        Self {
            address,
            priority,
            trigger: None,
            forced: false,
            attempt: 0,
        }
    }

    pub fn triggered_by(mut self, trigger: TileAddress) -> Self {
        self.trigger = (trigger != self.address).then_some(trigger);
        self
    }

    pub fn forced(mut self) -> Self {
        self.forced = true;
        self
    }
}

/// A fetched tile waiting to be committed.
#[derive(Debug)]
pub struct LoadedTile {
    pub request: TileRequest,
    pub image: TileImage,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub total_enqueued: u64,
    pub total_deduplicated: u64,
    pub total_dispatched: u64,
    pub total_completed: u64,
    pub total_retried: u64,
    pub total_failed: u64,
    pub total_cancelled: u64,
    pub peak_in_flight: usize,
}

#[derive(Debug)]
struct QueuedTile {
    request: TileRequest,
    seq: u64,
}

// Max-heap: higher priority first, then lower sequence number (FIFO).
impl PartialEq for QueuedTile {
    fn eq(&self, other: &Self) -> bool {
        self.request.priority == other.request.priority && self.seq == other.seq
    }
}

impl Eq for QueuedTile {}

impl PartialOrd for QueuedTile {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTile {
    fn cmp(&self, other: &Self) -> Ordering {
        self.request
            .priority
            .cmp(&other.request.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: BinaryHeap<QueuedTile>,
    queued: HashSet<TileAddress>,
    in_flight: HashSet<TileAddress>,
    backing_off: HashSet<TileAddress>,
    completed: Vec<LoadedTile>,
    next_seq: u64,
    stats: QueueStats,
}

impl QueueState {
    /// Queued, running, backing off, or fetched but not yet taken.
    fn contains(&self, address: TileAddress) -> bool {
        self.queued.contains(&address)
            || self.in_flight.contains(&address)
            || self.backing_off.contains(&address)
            || self.completed.iter().any(|t| t.request.address == address)
    }

    fn push(&mut self, request: TileRequest) {
        self.queued.insert(request.address);
        self.pending.push(QueuedTile {
            request,
            seq: self.next_seq,
        });
        self.next_seq += 1;
    }
}

struct Shared {
    state: Mutex<QueueState>,
    source: Arc<dyn TileSource>,
    config: StreamingConfig,
    changed: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The streaming queue. Cloning shares the same queue.
#[derive(Clone)]
pub struct StreamingQueue {
    shared: Arc<Shared>,
}

impl StreamingQueue {
    /// Create a queue fetching from `source`.
    ///
    /// Dispatch spawns tokio tasks, so requests must be enqueued from within
    /// a runtime.
    pub fn new(config: StreamingConfig, source: Arc<dyn TileSource>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                source,
                config,
                changed: Notify::new(),
            }),
        }
    }

    /// Queue a request unless the tile is already queued, in flight, waiting
    /// to retry or buffered for commit. Returns whether it was accepted.
    pub fn enqueue(&self, request: TileRequest) -> bool {
        {
            let mut state = self.shared.lock();
            if state.contains(request.address) {
                state.stats.total_deduplicated += 1;
                return false;
            }
            debug!(
                tile = %request.address,
                priority = request.priority,
                forced = request.forced,
                "Queued tile"
            );
            state.push(request);
            state.stats.total_enqueued += 1;
        }
        dispatch(&self.shared);
        true
    }

    /// Drop a request that has not been dispatched yet.
    pub fn cancel(&self, address: TileAddress) -> bool {
        let removed = {
            let mut state = self.shared.lock();
            let removed = state.queued.remove(&address) || state.backing_off.remove(&address);
            if removed {
                state.pending.retain(|q| q.request.address != address);
                state.stats.total_cancelled += 1;
            }
            removed
        };
        if removed {
            debug!(tile = %address, "Cancelled queued tile");
            self.shared.changed.notify_waiters();
        }
        removed
    }

    /// Whether a request for the tile is outstanding.
    pub fn contains(&self, address: TileAddress) -> bool {
        self.shared.lock().contains(address)
    }

    /// Fetched tiles buffered since the last call.
    pub fn take_completed(&self) -> Vec<LoadedTile> {
        std::mem::take(&mut self.shared.lock().completed)
    }

    /// Number of requests waiting for dispatch.
    pub fn pending_count(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Number of fetches currently running.
    pub fn in_flight_count(&self) -> usize {
        self.shared.lock().in_flight.len()
    }

    /// Nothing queued, running or waiting to retry.
    pub fn is_idle(&self) -> bool {
        let state = self.shared.lock();
        state.pending.is_empty() && state.in_flight.is_empty() && state.backing_off.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        self.shared.lock().stats.clone()
    }

    /// Wait until every accepted request has completed, failed or been cancelled.
    pub async fn settle(&self) {
        loop {
            let notified = self.shared.changed.notified();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

/// Start queued requests while concurrency allows.
fn dispatch(shared: &Arc<Shared>) {
    let started = {
        let mut state = shared.lock();
        let mut started = Vec::new();
        while state.in_flight.len() < shared.config.max_concurrent {
            let Some(next) = state.pending.pop() else {
                break;
            };
            let address = next.request.address;
            state.queued.remove(&address);
            state.in_flight.insert(address);
            state.stats.total_dispatched += 1;
            started.push(next.request);
        }
        state.stats.peak_in_flight = state.stats.peak_in_flight.max(state.in_flight.len());
        started
    };

    for request in started {
        tokio::spawn(run_fetch(shared.clone(), request));
    }
}

async fn run_fetch(shared: Arc<Shared>, request: TileRequest) {
    let address = request.address;
    let result = match shared.config.fetch_timeout() {
        Some(limit) => tokio::time::timeout(limit, shared.source.fetch(address))
            .await
            .unwrap_or(Err(FetchError::Timeout(address))),
        None => shared.source.fetch(address).await,
    };

    let retry = {
        let mut state = shared.lock();
        state.in_flight.remove(&address);
        match result {
            Ok(image) => {
                state.stats.total_completed += 1;
                debug!(tile = %address, "Fetched tile");
                state.completed.push(LoadedTile { request, image });
                None
            }
            Err(err) if request.attempt < shared.config.max_retries => {
                warn!(tile = %address, attempt = request.attempt + 1, error = %err, "Tile fetch failed, retrying");
                state.stats.total_retried += 1;
                state.backing_off.insert(address);
                Some(request)
            }
            Err(err) => {
                warn!(tile = %address, error = %err, "Tile fetch failed, dropping request");
                state.stats.total_failed += 1;
                None
            }
        }
    };

    shared.changed.notify_waiters();
    dispatch(&shared);

    if let Some(mut request) = retry {
        request.attempt += 1;
        tokio::time::sleep(shared.config.backoff(request.attempt)).await;
        {
            let mut state = shared.lock();
            // Cancelled while backing off.
            if !state.backing_off.remove(&address) {
                return;
            }
            state.push(request);
        }
        dispatch(&shared);
    }
}
