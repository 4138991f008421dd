//! Dispatch engine for dirmirror
//!
//! This crate turns coalesced intents into remote operations and hosts the
//! whole pipeline:
//!
//! - **Dispatcher**: a worker pool that keeps at most one operation in flight
//!   per path, retries transient failures with backoff and dead-letters the rest
//! - **Monitoring**: observability sinks and aggregated statistics
//! - **Engine**: starts the watcher, coalescer and dispatcher and shuts them
//!   down in order
//!
//! # Examples
//!
//! ```rust
//! use dirmirror_config::{Config, TransportKind};
//! use dirmirror_engine::{transport_from_config, MirrorEngine};
//! use dirmirror_session::Credentials;
//! use dirmirror_types::NoopSink;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> dirmirror_types::Result<()> {
//! let mut config = Config::default();
//! config.watch_root = "/srv/data".into();
//! config.remote_root = "mirror".to_string();
//! config.remote.transport = TransportKind::Memory;
//!
//! let transport = transport_from_config(&config, &Credentials::anonymous())?;
//! let handle =
//!     MirrorEngine::start(config, transport, Credentials::anonymous(), Arc::new(NoopSink)).await?;
//! let report = handle.shutdown(Duration::from_secs(5)).await;
//! println!("{} operations completed", report.completed);
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod dispatcher;
pub mod engine;
pub mod monitor;
pub mod operation;

pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherSnapshot, DrainReport};
pub use engine::{
    credentials_from_config, transport_from_config, MirrorEngine, MirrorHandle, ShutdownReport,
};
pub use monitor::{ChannelSink, SinkSet, Statistics, StatisticsCollector, TracingSink};
pub use operation::PendingOperation;
