//! Core traits shared across dirmirror crates

use crate::types::OperationEvent;
use std::sync::Arc;

/// Receiver for per-operation observability records
///
/// Called from dispatcher workers, so implementations must return promptly
/// and never block on I/O.
pub trait ObservabilitySink: Send + Sync {
    /// Record one completed, retried or dead-lettered operation
    fn record(&self, event: &OperationEvent);
}

impl<T: ObservabilitySink + ?Sized> ObservabilitySink for Arc<T> {
    fn record(&self, event: &OperationEvent) {
        (**self).record(event);
    }
}

impl<T: ObservabilitySink + ?Sized> ObservabilitySink for Box<T> {
    fn record(&self, event: &OperationEvent) {
        (**self).record(event);
    }
}

/// Sink that discards every record
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl ObservabilitySink for NoopSink {
    fn record(&self, _event: &OperationEvent) {}
}
