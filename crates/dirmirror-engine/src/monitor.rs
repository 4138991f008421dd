//! Observability sinks and statistics collection

use dirmirror_types::{IntentOp, ObservabilitySink, OperationEvent, OperationOutcome};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Overall statistics for the mirror engine
#[derive(Debug, Clone)]
pub struct Statistics {
    /// Operations completed successfully
    pub completed: u64,
    /// Failed attempts that were scheduled again
    pub retried: u64,
    /// Operations given up on
    pub dead_lettered: u64,
    /// Completed uploads
    pub uploads: u64,
    /// Completed deletions
    pub deletes: u64,
    /// Summed latency of completed operations
    pub total_latency: Duration,
    /// Slowest completed operation
    pub max_latency: Duration,
    /// Engine uptime
    pub uptime: Duration,
}

impl Default for Statistics {
    fn default() -> Self {
        Self {
            completed: 0,
            retried: 0,
            dead_lettered: 0,
            uploads: 0,
            deletes: 0,
            total_latency: Duration::ZERO,
            max_latency: Duration::ZERO,
            uptime: Duration::ZERO,
        }
    }
}

impl Statistics {
    /// Calculate overall success rate over finished operations, in percent
    pub fn success_rate(&self) -> f64 {
        let finished = self.completed + self.dead_lettered;
        if finished > 0 {
            (self.completed as f64 / finished as f64) * 100.0
        } else {
            0.0
        }
    }

    /// Mean latency of completed operations
    pub fn average_latency(&self) -> Duration {
        if self.completed > 0 {
            let nanos = self.total_latency.as_nanos() / u128::from(self.completed);
            Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
        } else {
            Duration::ZERO
        }
    }

    /// Completed operations per second of uptime
    pub fn operations_per_second(&self) -> f64 {
        if self.uptime.as_secs_f64() > 0.0 {
            self.completed as f64 / self.uptime.as_secs_f64()
        } else {
            0.0
        }
    }
}

/// Sink aggregating operation records into [`Statistics`]
#[derive(Debug)]
pub struct StatisticsCollector {
    statistics: Mutex<Statistics>,
    start_time: Instant,
}

impl StatisticsCollector {
    /// Create a new statistics collector
    pub fn new() -> Self {
        Self {
            statistics: Mutex::new(Statistics::default()),
            start_time: Instant::now(),
        }
    }

    /// Get current statistics
    pub fn get_current_stats(&self) -> Statistics {
        let mut stats = self
            .statistics
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        stats.uptime = self.start_time.elapsed();
        stats
    }
}

impl Default for StatisticsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl ObservabilitySink for StatisticsCollector {
    fn record(&self, event: &OperationEvent) {
        let mut stats = self
            .statistics
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match event.outcome {
            OperationOutcome::Completed => {
                stats.completed += 1;
                match event.operation {
                    IntentOp::Upload => stats.uploads += 1,
                    IntentOp::Delete => stats.deletes += 1,
                }
                stats.total_latency += event.latency;
                stats.max_latency = stats.max_latency.max(event.latency);
            }
            OperationOutcome::Retried => stats.retried += 1,
            OperationOutcome::DeadLettered => stats.dead_lettered += 1,
        }
    }
}

/// Sink writing one log line per record
///
/// Completions log at `info`, retries at `warn` and dead-letters at `error`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl ObservabilitySink for TracingSink {
    fn record(&self, event: &OperationEvent) {
        let error = event
            .error
            .as_ref()
            .map_or_else(String::new, ToString::to_string);
        match event.outcome {
            OperationOutcome::Completed => info!(
                operation_id = %event.operation_id,
                attempts = event.attempts,
                latency_ms = event.latency.as_millis() as u64,
                "{} {}",
                event.operation,
                event.path
            ),
            OperationOutcome::Retried => warn!(
                operation_id = %event.operation_id,
                attempts = event.attempts,
                "{} {} failed, retrying: {}",
                event.operation,
                event.path,
                error
            ),
            OperationOutcome::DeadLettered => error!(
                operation_id = %event.operation_id,
                attempts = event.attempts,
                "{} {} dead-lettered: {}",
                event.operation,
                event.path,
                error
            ),
        }
    }
}

/// Sink forwarding records into a bounded channel
///
/// Records are dropped, and counted, when the channel is full or closed.
#[derive(Debug)]
pub struct ChannelSink {
    sender: mpsc::Sender<OperationEvent>,
    dropped: AtomicU64,
}

impl ChannelSink {
    /// Create a sink and the receiver its records arrive on
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<OperationEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                sender,
                dropped: AtomicU64::new(0),
            },
            receiver,
        )
    }

    /// Records dropped so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl ObservabilitySink for ChannelSink {
    fn record(&self, event: &OperationEvent) {
        if self.sender.try_send(event.clone()).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            debug!("observability channel full, {} records dropped", dropped);
        }
    }
}

/// Fan-out over several sinks
#[derive(Clone, Default)]
pub struct SinkSet {
    sinks: Vec<Arc<dyn ObservabilitySink>>,
}

impl std::fmt::Debug for SinkSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkSet")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl SinkSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink
    pub fn with<S: ObservabilitySink + 'static>(mut self, sink: S) -> Self {
        self.sinks.push(Arc::new(sink));
        self
    }

    /// Add a shared sink
    pub fn with_shared(mut self, sink: Arc<dyn ObservabilitySink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Number of sinks
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl ObservabilitySink for SinkSet {
    fn record(&self, event: &OperationEvent) {
        for sink in &self.sinks {
            sink.record(event);
        }
    }
}
