//! Logical coordinate → cache slot mapping.
//!
//! - [`table`]: IndirectionIndex (flat quad-tree with ancestor fallback) and
//!   the read-side IndirectionEntry snapshot

pub mod table;
