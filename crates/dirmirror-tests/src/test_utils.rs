//! Unified test utilities for dirmirror tests and benchmarks

use dirmirror_engine::{Dispatcher, DispatcherConfig, DrainReport};
use dirmirror_session::{Credentials, MemoryTransport, Session};
use dirmirror_types::{
    DebounceWindow, ObservabilitySink, OperationEvent, OperationOutcome, RawEvent, RawEventKind,
    RelativePath, RetryConfig, RetryPolicy, WorkerCount,
};
use dirmirror_watch::{Coalescer, CoalescerConfig, CoalescerStats};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Shorthand for a valid relative path
pub fn rel(path: &str) -> RelativePath {
    RelativePath::new(path).expect("valid relative path")
}

/// Deterministic file content of `size` bytes
pub fn generate_content(size: usize, seed: u8) -> Vec<u8> {
    (0..size)
        .map(|i| ((i * 7 + 13 + usize::from(seed)) % 256) as u8)
        .collect()
}

/// Poll `check` until it holds or `timeout` passes
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Observability sink keeping every record
#[derive(Debug, Default)]
pub struct Recorder {
    events: Mutex<Vec<OperationEvent>>,
}

impl Recorder {
    /// All records so far, in arrival order
    pub fn events(&self) -> Vec<OperationEvent> {
        self.lock().clone()
    }

    /// Records for one path
    pub fn for_path(&self, path: &str) -> Vec<OperationEvent> {
        self.lock()
            .iter()
            .filter(|event| event.path.as_str() == path)
            .cloned()
            .collect()
    }

    /// Number of records with `outcome`
    pub fn count(&self, outcome: OperationOutcome) -> usize {
        self.lock()
            .iter()
            .filter(|event| event.outcome == outcome)
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<OperationEvent>> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl ObservabilitySink for Recorder {
    fn record(&self, event: &OperationEvent) {
        self.lock().push(event.clone());
    }
}

/// Settings for a [`Pipeline`]
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Debounce window
    pub window: Duration,
    /// Dispatcher workers
    pub workers: usize,
    /// Attempts per operation
    pub max_attempts: u32,
    /// First retry delay
    pub backoff_base: Duration,
    /// Retry delay cap
    pub backoff_cap: Duration,
    /// Simulated latency of every remote call
    pub latency: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(300),
            workers: 4,
            max_attempts: 5,
            backoff_base: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(40),
            latency: Duration::ZERO,
        }
    }
}

/// Coalescer and dispatcher over an in-memory store, fed with raw events by hand
pub struct Pipeline {
    dir: TempDir,
    settings: PipelineSettings,
    /// The remote store
    pub transport: Arc<MemoryTransport>,
    /// Every operation record
    pub recorder: Arc<Recorder>,
    /// The dispatcher under test
    pub dispatcher: Arc<Dispatcher>,
    events: Option<mpsc::Sender<RawEvent>>,
    coalescer: JoinHandle<CoalescerStats>,
    intake: JoinHandle<()>,
}

/// What a [`Pipeline`] did, collected by [`Pipeline::finish`]
pub struct PipelineReport {
    /// The remote store
    pub transport: Arc<MemoryTransport>,
    /// Every operation record
    pub recorder: Arc<Recorder>,
    /// Coalescer counters
    pub coalescer: CoalescerStats,
    /// Dispatcher totals
    pub drain: DrainReport,
}

impl Pipeline {
    /// Start the stages inside the current runtime
    pub fn start(settings: PipelineSettings) -> Self {
        let dir = TempDir::new().expect("temporary directory");
        let transport = Arc::new(MemoryTransport::new().with_latency(settings.latency));
        let session = Arc::new(Session::new(transport.clone(), Credentials::anonymous()));
        let retry = RetryConfig::new(
            settings.max_attempts,
            settings.backoff_base,
            settings.backoff_cap,
            0.0,
        )
        .expect("valid retry settings");

        let recorder = Arc::new(Recorder::default());
        let mut config = DispatcherConfig::new(dir.path());
        config.worker_count = WorkerCount::new(settings.workers).expect("valid worker count");
        config.degraded_wait = settings.backoff_cap;
        let dispatcher = Arc::new(Dispatcher::new(
            session,
            RetryPolicy::new(retry),
            recorder.clone(),
            config,
        ));
        dispatcher.spawn_workers();

        let (events, raw_rx) = mpsc::channel(1024);
        let (intent_tx, intent_rx) = mpsc::channel(1024);
        let coalescer = Coalescer::new(
            dir.path(),
            CoalescerConfig {
                window: DebounceWindow::new(settings.window).expect("valid window"),
                flush_on_shutdown: true,
            },
        );
        let coalescer = tokio::spawn(coalescer.run(raw_rx, intent_tx));
        let intake = tokio::spawn(Arc::clone(&dispatcher).run_intake(intent_rx));

        Self {
            dir,
            settings,
            transport,
            recorder,
            dispatcher,
            events: Some(events),
            coalescer,
            intake,
        }
    }

    /// Local root the events refer to
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Write `content` below the root, creating parents
    pub fn write(&self, relative: &str, content: impl AsRef<[u8]>) -> PathBuf {
        let path = self.dir.path().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent directories");
        }
        fs::write(&path, content).expect("write test file");
        path
    }

    /// Remove a file below the root
    pub fn remove(&self, relative: &str) {
        fs::remove_file(self.dir.path().join(relative)).expect("remove test file");
    }

    /// Feed one raw event for `relative`
    pub async fn emit(&self, relative: &str, kind: RawEventKind) {
        let event = RawEvent::new(self.dir.path().join(relative), kind);
        self.events
            .as_ref()
            .expect("pipeline input open")
            .send(event)
            .await
            .expect("coalescer running");
    }

    /// Wait for the window to pass and the dispatcher to run dry
    pub async fn settle(&self) -> bool {
        tokio::time::sleep(self.settings.window + Duration::from_millis(100)).await;
        wait_until(Duration::from_secs(10), || {
            self.dispatcher.snapshot().is_idle()
        })
        .await
    }

    /// Close the input, flush pending intents and wait for the queue to empty
    pub async fn finish(mut self) -> PipelineReport {
        drop(self.events.take());
        let coalescer = self.coalescer.await.expect("coalescer task");
        self.intake.await.expect("intake task");
        wait_until(Duration::from_secs(10), || {
            self.dispatcher.snapshot().is_idle()
        })
        .await;
        let drain = self.dispatcher.drain(Duration::from_secs(1)).await;

        PipelineReport {
            transport: self.transport,
            recorder: self.recorder,
            coalescer,
            drain,
        }
    }
}
