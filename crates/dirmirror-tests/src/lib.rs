//! dirmirror integration test suite
//!
//! Shared fixtures for the cross-crate scenarios in `tests/` and the
//! benchmarks in `benches/`.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Unified test utilities
///
/// Fixtures for driving the coalescer and dispatcher against an in-memory
/// remote store without a real filesystem watcher.
pub mod test_utils;
