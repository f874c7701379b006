//! vt-pager: sparse texture paging.
//!
//! Streams a huge logical image, cut into a mip pyramid of fixed-size tiles,
//! into a small fixed-capacity atlas:
//!   feedback samples → usage table → residency decisions → streaming queue
//!   → page cache commit → indirection index → read-side snapshot
//!
//! Tiles that have not arrived yet are served by their nearest resident
//! ancestor, so the view is never blank once the root is loaded.

pub mod cache;
pub mod config;
pub mod frame;
pub mod indirection;
pub mod metrics;
pub mod streaming;
pub mod tile;

pub use cache::atlas::{AtlasStore, HostAtlas};
pub use cache::page_cache::{CacheError, PageCache};
pub use config::Config;
pub use frame::orchestrator::{Orchestrator, PagerError};
pub use frame::report::FrameReport;
pub use indirection::table::{IndirectionEntry, IndirectionIndex};
pub use streaming::source::{TileImage, TileSource};
pub use tile::address::TileAddress;
