//! Append-style change-event index ("RECENT" files) for mirrored file
//! trees.
//!
//! The index is partitioned into files covering increasing time
//! windows. The smallest (the principal) absorbs live change events
//! from a filesystem watcher; larger files are produced by periodic
//! upward aggregation, so downstream mirrors can incrementally fetch
//! only what changed since their last sync.

pub mod cmd;
pub mod collection;
pub mod epoch;
pub mod error;
pub mod fsck;
pub mod interval;
pub mod metrics;
pub mod recentfile;
pub mod watcher;

pub use error::{Error, Result};
