//! Change detection for dirmirror
//!
//! This crate turns OS filesystem notifications for one watched root into a
//! minimal stream of [`Intent`](dirmirror_types::Intent)s:
//!
//! - [`watcher`]: a recursive `notify` subscription producing raw events
//! - [`ignore`]: glob and hidden-file filtering, excluded subtrees
//! - [`coalescer`]: per-path debouncing and merging into intents
//! - [`scan`]: the initial walk that reports files present at startup

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod coalescer;
pub mod ignore;
pub mod scan;
pub mod watcher;

pub use coalescer::{
    path_changes, Coalescer, CoalescerConfig, CoalescerStats, CoalescerStatsHandle, MergeOutcome,
    PathChange, PendingIntents,
};
pub use ignore::IgnorePolicy;
pub use scan::initial_scan;
pub use watcher::{WatchSignal, WatchSubscription};
