//! Deployment mirror
//!
//! The mirror holds the latest observed state of every deployment in the watched scope. It is
//! populated by a full list when the process starts and is then kept current by following the
//! store's watch:
//!
//! ```text
//! [ ObjectStore ] --list/watch--> [ Synchronizer ] --apply--> [ Mirror ] <--read-- [ Reader ]
//! ```
//!
//! The [`Synchronizer`] is the only writer. It applies every change through a single function, so
//! that events for a key are never applied out of version order, and it repairs drift by
//! periodically re-listing the collection. Watch failures are retried in the background; readers
//! observe a stale but available mirror in the meantime.
//!
//! A [`Reader`] serves point and namespace lookups without touching the store. Lookups take a
//! shared lock, so concurrent readers never serialize against one another and never observe a
//! partially applied event.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod metrics;
mod mirror;
mod reader;
mod sync;

#[cfg(test)]
mod tests;

pub use self::{
    metrics::SyncMetrics,
    mirror::{Applied, Mirror},
    reader::Reader,
    sync::{Handle, Params, SyncError, Synchronizer},
};
use parking_lot::RwLock;
use std::sync::Arc;

pub type SharedMirror = Arc<RwLock<Mirror>>;
