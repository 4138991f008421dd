//! Per-path ordered, globally concurrent execution of intents
//!
//! Every relative path has at most one *current* operation and at most one
//! *backlog* intent. Workers only pick up a path whose current operation is
//! queued and eligible, so operations for one path never overlap while
//! different paths proceed in parallel. Failed attempts go through the
//! [`RetryPolicy`]: a retried operation keeps its path blocked until it
//! succeeds or is dead-lettered, after which the backlog is promoted.

use crate::operation::PendingOperation;
use bytes::Bytes;
use dirmirror_session::Session;
use dirmirror_types::{
    is_transient_io_kind, ConnectionState, DeadLetter, Error, Intent, IntentOp,
    ObservabilitySink, OperationEvent, OperationOutcome, OperationState, RelativePath, Result,
    RetryDecision, RetryPolicy, WorkerCount,
};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Configuration for the dispatcher
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Number of concurrent workers
    pub worker_count: WorkerCount,
    /// Local root uploads read their content from
    pub local_root: PathBuf,
    /// Longest a worker holds back while the session is degraded
    pub degraded_wait: Duration,
}

impl DispatcherConfig {
    /// Default settings for content below `local_root`
    pub fn new<P: Into<PathBuf>>(local_root: P) -> Self {
        Self {
            worker_count: WorkerCount::default(),
            local_root: local_root.into(),
            degraded_wait: Duration::from_secs(30),
        }
    }
}

/// Point-in-time view of the dispatcher's queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherSnapshot {
    /// Paths whose current operation waits for a worker
    pub queued: usize,
    /// Operations being executed
    pub in_flight: usize,
    /// Operations waiting out a backoff delay
    pub retrying: usize,
    /// Intents parked behind a current operation
    pub backlog: usize,
    /// Operations completed so far
    pub completed: u64,
    /// Operations dead-lettered so far
    pub dead_lettered: u64,
}

impl DispatcherSnapshot {
    /// Whether no work is outstanding
    pub fn is_idle(&self) -> bool {
        self.queued + self.in_flight + self.retrying + self.backlog == 0
    }
}

/// Outcome of [`Dispatcher::drain`]
#[derive(Debug, Clone, Default)]
pub struct DrainReport {
    /// Operations completed over the dispatcher's lifetime
    pub completed: u64,
    /// Operations dead-lettered over the dispatcher's lifetime
    pub dead_lettered: u64,
    /// Intents still outstanding when the grace period ran out, by path
    pub abandoned: Vec<Intent>,
    /// Whether the grace period expired before the queue emptied
    pub timed_out: bool,
}

#[derive(Debug)]
struct PathSlot {
    current: PendingOperation,
    backlog: Option<Intent>,
}

enum Next {
    Run(PendingOperation),
    WaitUntil(Instant),
    Wait,
    Exit,
}

#[derive(Debug, Default)]
struct DispatchState {
    slots: HashMap<RelativePath, PathSlot>,
    // eligibility order; the sequence number keeps equal instants FIFO
    schedule: BTreeMap<(Instant, u64), RelativePath>,
    sequence: u64,
    dead_letters: Vec<DeadLetter>,
    completed: u64,
    closed: bool,
}

impl DispatchState {
    fn schedule(&mut self, path: RelativePath, at: Instant) {
        self.sequence += 1;
        self.schedule.insert((at, self.sequence), path);
    }

    fn admit(&mut self, intent: Intent, now: Instant) {
        let Some(slot) = self.slots.get_mut(&intent.path) else {
            let path = intent.path.clone();
            let mut current = PendingOperation::new(intent);
            current.next_eligible_at = now;
            self.slots.insert(
                path.clone(),
                PathSlot {
                    current,
                    backlog: None,
                },
            );
            self.schedule(path, now);
            return;
        };

        if slot.current.state == OperationState::Queued && slot.current.attempts == 0 {
            // never attempted, so the newer intent takes its place
            let previous = slot.current.intent.clone();
            slot.current.intent = intent.superseding(previous);
            debug!("replaced queued operation: {}", slot.current.intent);
            return;
        }

        let parked = match slot.backlog.take() {
            Some(previous) => intent.superseding(previous),
            None => intent,
        };
        debug!("parked {} behind {}", parked, slot.current.intent);
        slot.backlog = Some(parked);
    }

    fn take_eligible(&mut self, now: Instant) -> Next {
        while let Some((&(at, _), _)) = self.schedule.first_key_value() {
            if at > now {
                return Next::WaitUntil(at);
            }
            let Some((_, path)) = self.schedule.pop_first() else {
                break;
            };
            if let Some(slot) = self.slots.get_mut(&path) {
                if slot.current.is_eligible(now) {
                    slot.current.start();
                    return Next::Run(slot.current.clone());
                }
            }
        }

        if self.closed && self.slots.is_empty() {
            Next::Exit
        } else {
            Next::Wait
        }
    }

    /// Drop the current operation for `path` and promote its backlog
    fn release(&mut self, path: &RelativePath, now: Instant) -> Option<PathSlot> {
        let mut slot = self.slots.remove(path)?;
        if let Some(next) = slot.backlog.take() {
            self.admit(next, now);
        }
        Some(slot)
    }

    fn settle(
        &mut self,
        attempt: &PendingOperation,
        result: Result<()>,
        policy: &RetryPolicy,
        latency: Duration,
        now: Instant,
    ) -> Option<OperationEvent> {
        let path = attempt.path();
        let slot = self.slots.get_mut(path)?;
        if slot.current.id != attempt.id {
            return None;
        }

        let error = match result {
            Ok(()) => {
                self.completed += 1;
                let slot = self.release(path, now)?;
                debug!("{} completed after {} attempts", slot.current.intent, slot.current.attempts);
                return Some(slot.current.event(OperationOutcome::Completed, latency, None));
            }
            Err(error) => error,
        };

        match policy.decide(slot.current.attempts, error.failure_class()) {
            RetryDecision::Retry(delay) => {
                slot.current.retry_after(delay, error.clone(), now);
                let event = slot
                    .current
                    .event(OperationOutcome::Retried, latency, Some(error));
                self.schedule(path.clone(), now + delay);
                Some(event)
            }
            RetryDecision::DeadLetter => {
                let slot = self.release(path, now)?;
                let event =
                    slot.current
                        .event(OperationOutcome::DeadLettered, latency, Some(error.clone()));
                self.dead_letters.push(slot.current.dead_letter(error));
                Some(event)
            }
        }
    }

    fn snapshot(&self) -> DispatcherSnapshot {
        let mut snapshot = DispatcherSnapshot {
            completed: self.completed,
            dead_lettered: self.dead_letters.len() as u64,
            ..DispatcherSnapshot::default()
        };
        for slot in self.slots.values() {
            match slot.current.state {
                OperationState::Queued => snapshot.queued += 1,
                OperationState::InFlight => snapshot.in_flight += 1,
                OperationState::Retrying => snapshot.retrying += 1,
                OperationState::DeadLettered => {}
            }
            if slot.backlog.is_some() {
                snapshot.backlog += 1;
            }
        }
        snapshot
    }
}

fn local_error(path: &RelativePath, error: &io::Error) -> Error {
    if error.kind() == io::ErrorKind::NotFound {
        return Error::permanent(path.as_str(), "local source vanished");
    }
    Error::Io {
        message: error.to_string(),
        transient: is_transient_io_kind(error.kind()),
    }
    .into_transfer(path.as_str())
}

/// Executes intents against the session with a fixed pool of workers
pub struct Dispatcher {
    session: Arc<Session>,
    policy: RetryPolicy,
    sink: Arc<dyn ObservabilitySink>,
    config: DispatcherConfig,
    state: Mutex<DispatchState>,
    changed: Notify,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("policy", &self.policy)
            .field("snapshot", &self.snapshot())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Create a dispatcher; no work runs until [`spawn_workers`](Self::spawn_workers)
    pub fn new(
        session: Arc<Session>,
        policy: RetryPolicy,
        sink: Arc<dyn ObservabilitySink>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            session,
            policy,
            sink,
            config,
            state: Mutex::new(DispatchState::default()),
            changed: Notify::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DispatchState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_workers(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Accept an intent; fails with [`Error::Cancelled`] once closed
    pub fn enqueue(&self, intent: Intent) -> Result<()> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(Error::Cancelled);
            }
            state.admit(intent, Instant::now());
        }
        self.changed.notify_waiters();
        Ok(())
    }

    /// Enqueue every intent received on `intents` until the channel closes
    pub async fn run_intake(self: Arc<Self>, mut intents: mpsc::Receiver<Intent>) {
        while let Some(intent) = intents.recv().await {
            if let Err(e) = self.enqueue(intent) {
                debug!("intake stopped: {}", e);
                break;
            }
        }
        debug!("intent intake finished");
    }

    /// Start the worker pool; calling it again has no effect
    pub fn spawn_workers(self: &Arc<Self>) {
        let mut workers = self.lock_workers();
        if !workers.is_empty() {
            return;
        }
        let count = self.config.worker_count.get();
        for index in 0..count {
            let dispatcher = Arc::clone(self);
            workers.push(tokio::spawn(async move { dispatcher.worker(index).await }));
        }
        info!("Started {} dispatcher workers", count);
    }

    async fn worker(&self, index: usize) {
        debug!("worker {} started", index);
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = self.lock().take_eligible(Instant::now());
            match next {
                Next::Run(operation) => self.process(operation).await,
                Next::WaitUntil(deadline) => {
                    tokio::select! {
                        () = &mut notified => {}
                        () = tokio::time::sleep_until(deadline) => {}
                    }
                }
                Next::Wait => notified.await,
                Next::Exit => break,
            }
        }
        debug!("worker {} finished", index);
    }

    async fn process(&self, operation: PendingOperation) {
        self.wait_while_degraded().await;

        let started = Instant::now();
        let result = self.apply(&operation.intent).await;
        let latency = started.elapsed();

        let event = self
            .lock()
            .settle(&operation, result, &self.policy, latency, Instant::now());
        if let Some(event) = event {
            self.sink.record(&event);
        }
        self.changed.notify_waiters();
    }

    async fn wait_while_degraded(&self) {
        if self.session.state() != ConnectionState::Degraded {
            return;
        }
        debug!("session degraded, holding back");
        let mut states = self.session.subscribe_state();
        let recovered = tokio::time::timeout(
            self.config.degraded_wait,
            states.wait_for(|state| *state != ConnectionState::Degraded),
        )
        .await;
        if recovered.is_err() {
            warn!(
                "session still degraded after {:?}, proceeding",
                self.config.degraded_wait
            );
        }
    }

    async fn apply(&self, intent: &Intent) -> Result<()> {
        let path = &intent.path;
        match intent.op {
            IntentOp::Delete => self.session.remove(path).await,
            IntentOp::Upload => {
                let local = path.to_local(&self.config.local_root);
                let metadata = tokio::fs::metadata(&local)
                    .await
                    .map_err(|e| local_error(path, &e))?;
                if metadata.is_dir() {
                    self.session.mkdir_all(path).await
                } else if metadata.is_file() {
                    let content = tokio::fs::read(&local)
                        .await
                        .map_err(|e| local_error(path, &e))?;
                    self.session.put(path, Bytes::from(content)).await
                } else {
                    Err(Error::permanent(path.as_str(), "unsupported file type"))
                }
            }
        }
    }

    /// Stop accepting new intents
    pub fn close(&self) {
        self.lock().closed = true;
        self.changed.notify_waiters();
    }

    /// Close, wait up to `grace` for outstanding work, then abort the workers
    pub async fn drain(&self, grace: Duration) -> DrainReport {
        self.close();
        let deadline = Instant::now() + grace;
        let mut timed_out = false;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.lock().slots.is_empty() {
                break;
            }
            tokio::select! {
                () = &mut notified => {}
                () = tokio::time::sleep_until(deadline) => {
                    timed_out = true;
                    break;
                }
            }
        }

        let workers = std::mem::take(&mut *self.lock_workers());
        for worker in &workers {
            worker.abort();
        }
        for worker in workers {
            // cancelled workers report a JoinError, which is expected here
            let _ = worker.await;
        }

        let mut state = self.lock();
        state.schedule.clear();
        let mut abandoned: Vec<Intent> = state
            .slots
            .drain()
            .flat_map(|(_, slot)| std::iter::once(slot.current.intent).chain(slot.backlog))
            .collect();
        abandoned.sort_by(|a, b| a.path.cmp(&b.path));
        if !abandoned.is_empty() {
            warn!("Abandoning {} outstanding operations", abandoned.len());
        }

        DrainReport {
            completed: state.completed,
            dead_lettered: state.dead_letters.len() as u64,
            abandoned,
            timed_out,
        }
    }

    /// Operations that will not be retried
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock().dead_letters.clone()
    }

    /// Number of dead-lettered operations
    pub fn dead_letter_count(&self) -> usize {
        self.lock().dead_letters.len()
    }

    /// Counts of outstanding work
    pub fn snapshot(&self) -> DispatcherSnapshot {
        self.lock().snapshot()
    }

    /// Operations currently being executed
    pub fn in_flight_count(&self) -> usize {
        self.snapshot().in_flight
    }

    /// The session operations run against
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirmirror_session::{CallKind, Credentials, MemoryTransport};
    use dirmirror_types::{FailureClass, RetryConfig};
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<OperationEvent>>);

    impl ObservabilitySink for Recorder {
        fn record(&self, event: &OperationEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    impl Recorder {
        fn outcomes(&self, path: &str) -> Vec<(OperationOutcome, u32)> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.path.as_str() == path)
                .map(|e| (e.outcome, e.attempts))
                .collect()
        }
    }

    struct Fixture {
        dir: TempDir,
        transport: Arc<MemoryTransport>,
        recorder: Arc<Recorder>,
        dispatcher: Arc<Dispatcher>,
    }

    fn fixture(max_attempts: u32, workers: usize, latency: Duration) -> Fixture {
        degraded_fixture(max_attempts, workers, latency, Duration::from_millis(50))
    }

    fn degraded_fixture(
        max_attempts: u32,
        workers: usize,
        latency: Duration,
        degraded_wait: Duration,
    ) -> Fixture {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MemoryTransport::new().with_latency(latency));
        let session = Arc::new(Session::new(transport.clone(), Credentials::anonymous()));
        let retry = RetryConfig::new(
            max_attempts,
            Duration::from_millis(10),
            Duration::from_millis(40),
            0.0,
        )
        .unwrap();
        let recorder = Arc::new(Recorder::default());
        let mut config = DispatcherConfig::new(dir.path());
        config.worker_count = WorkerCount::new(workers).unwrap();
        config.degraded_wait = degraded_wait;
        let dispatcher = Arc::new(Dispatcher::new(
            session,
            RetryPolicy::new(retry),
            recorder.clone(),
            config,
        ));
        Fixture {
            dir,
            transport,
            recorder,
            dispatcher,
        }
    }

    fn rel(path: &str) -> RelativePath {
        RelativePath::new(path).unwrap()
    }

    async fn wait_idle(dispatcher: &Dispatcher) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !dispatcher.snapshot().is_idle() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("dispatcher did not become idle");
    }

    /// Break the connection through a failed put of `first.txt` whose
    /// reconnect also fails, leaving the session degraded.
    async fn degrade(f: &Fixture) {
        let session = f.dispatcher.session();
        session.connect().await.unwrap();
        std::fs::write(f.dir.path().join("first.txt"), "1").unwrap();
        std::fs::write(f.dir.path().join("second.txt"), "2").unwrap();
        f.transport
            .fail_next(CallKind::Put, Some(rel("first.txt")), FailureClass::Transient, 1);
        f.transport
            .fail_next(CallKind::Connect, None, FailureClass::Transient, 1);

        f.dispatcher.enqueue(Intent::upload(rel("first.txt"))).unwrap();
        tokio::time::timeout(Duration::from_secs(10), async {
            while session.state() != ConnectionState::Degraded {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("session did not degrade");
    }

    #[tokio::test]
    async fn test_degraded_session_holds_back_until_recovery() {
        let f = degraded_fixture(5, 2, Duration::ZERO, Duration::from_secs(30));
        f.dispatcher.spawn_workers();
        degrade(&f).await;

        f.dispatcher.enqueue(Intent::upload(rel("second.txt"))).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(f
            .transport
            .calls_of(CallKind::Put, Some(&rel("second.txt")))
            .is_empty());
        assert!(!f.dispatcher.snapshot().is_idle());

        f.dispatcher.session().connect().await.unwrap();
        wait_idle(&f.dispatcher).await;
        assert_eq!(f.transport.file(&rel("second.txt")).unwrap(), "2");
        assert_eq!(f.transport.file(&rel("first.txt")).unwrap(), "1");
        assert_eq!(
            f.recorder.outcomes("second.txt"),
            vec![(OperationOutcome::Completed, 1)]
        );
    }

    #[tokio::test]
    async fn test_degraded_session_proceeds_after_wait_expires() {
        let f = degraded_fixture(5, 2, Duration::ZERO, Duration::from_millis(300));
        f.dispatcher.spawn_workers();
        degrade(&f).await;

        let enqueued = Instant::now();
        f.dispatcher.enqueue(Intent::upload(rel("second.txt"))).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(f
            .transport
            .calls_of(CallKind::Put, Some(&rel("second.txt")))
            .is_empty());

        wait_idle(&f.dispatcher).await;
        assert!(enqueued.elapsed() >= Duration::from_millis(200));
        assert_eq!(f.transport.file(&rel("second.txt")).unwrap(), "2");
        assert_eq!(f.dispatcher.session().state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_upload_and_delete() {
        let f = fixture(5, 2, Duration::ZERO);
        std::fs::write(f.dir.path().join("a.txt"), "hi").unwrap();
        std::fs::create_dir(f.dir.path().join("dir")).unwrap();
        f.dispatcher.spawn_workers();

        f.dispatcher.enqueue(Intent::upload(rel("a.txt"))).unwrap();
        f.dispatcher.enqueue(Intent::upload(rel("dir"))).unwrap();
        wait_idle(&f.dispatcher).await;

        assert_eq!(f.transport.file(&rel("a.txt")).unwrap(), "hi");
        assert!(f.transport.has_dir(&rel("dir")));
        assert_eq!(f.recorder.outcomes("a.txt"), vec![(OperationOutcome::Completed, 1)]);

        f.dispatcher.enqueue(Intent::delete(rel("a.txt"))).unwrap();
        wait_idle(&f.dispatcher).await;
        assert!(f.transport.file(&rel("a.txt")).is_none());
        assert_eq!(f.dispatcher.snapshot().completed, 3);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let f = fixture(5, 2, Duration::ZERO);
        std::fs::write(f.dir.path().join("c.txt"), "content").unwrap();
        f.transport
            .fail_next(CallKind::Put, Some(rel("c.txt")), FailureClass::Transient, 2);
        f.dispatcher.spawn_workers();

        f.dispatcher.enqueue(Intent::upload(rel("c.txt"))).unwrap();
        wait_idle(&f.dispatcher).await;

        assert_eq!(
            f.recorder.outcomes("c.txt"),
            vec![
                (OperationOutcome::Retried, 1),
                (OperationOutcome::Retried, 2),
                (OperationOutcome::Completed, 3),
            ]
        );
        assert_eq!(f.transport.file(&rel("c.txt")).unwrap(), "content");
        assert_eq!(f.dispatcher.dead_letter_count(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter_without_blocking_others() {
        let f = fixture(3, 2, Duration::ZERO);
        std::fs::write(f.dir.path().join("bad.bin"), "x").unwrap();
        std::fs::write(f.dir.path().join("good.bin"), "y").unwrap();
        f.transport
            .fail_always(CallKind::Put, Some(rel("bad.bin")), FailureClass::Transient);
        f.dispatcher.spawn_workers();

        f.dispatcher.enqueue(Intent::upload(rel("bad.bin"))).unwrap();
        f.dispatcher.enqueue(Intent::upload(rel("good.bin"))).unwrap();
        wait_idle(&f.dispatcher).await;

        let letters = f.dispatcher.dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].intent.path, rel("bad.bin"));
        assert_eq!(letters[0].attempts, 3);
        assert!(letters[0].error.is_recoverable());
        assert_eq!(
            f.recorder.outcomes("bad.bin").last(),
            Some(&(OperationOutcome::DeadLettered, 3))
        );
        assert_eq!(f.transport.file(&rel("good.bin")).unwrap(), "y");
    }

    #[tokio::test]
    async fn test_vanished_source_is_dead_lettered_immediately() {
        let f = fixture(5, 1, Duration::ZERO);
        f.dispatcher.spawn_workers();

        f.dispatcher.enqueue(Intent::upload(rel("gone.txt"))).unwrap();
        wait_idle(&f.dispatcher).await;

        let letters = f.dispatcher.dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].attempts, 1);
        assert!(letters[0].error.to_string().contains("local source vanished"));
        assert!(f.transport.calls_of(CallKind::Put, None).is_empty());
    }

    #[tokio::test]
    async fn test_same_path_operations_never_overlap() {
        let f = fixture(5, 4, Duration::from_millis(40));
        let file = f.dir.path().join("a.txt");
        std::fs::write(&file, "v1").unwrap();
        f.dispatcher.spawn_workers();

        f.dispatcher.enqueue(Intent::upload(rel("a.txt"))).unwrap();
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert_eq!(f.dispatcher.in_flight_count(), 1);

        // parked behind the in-flight upload; the second replaces the first
        std::fs::write(&file, "v2").unwrap();
        f.dispatcher.enqueue(Intent::delete(rel("a.txt"))).unwrap();
        f.dispatcher.enqueue(Intent::upload(rel("a.txt"))).unwrap();
        assert_eq!(f.dispatcher.snapshot().backlog, 1);
        wait_idle(&f.dispatcher).await;

        let puts: Vec<_> = f
            .transport
            .calls_of(CallKind::Put, Some(&rel("a.txt")))
            .into_iter()
            .filter_map(|c| c.content)
            .collect();
        assert_eq!(puts, vec![Bytes::from_static(b"v1"), Bytes::from_static(b"v2")]);
        assert!(f.transport.calls_of(CallKind::Remove, None).is_empty());
        assert!(f.transport.overlapping_paths().is_empty());
    }

    #[tokio::test]
    async fn test_concurrency_bounded_by_worker_count() {
        let f = fixture(5, 3, Duration::from_millis(20));
        for i in 0..12 {
            std::fs::write(f.dir.path().join(format!("f{}.txt", i)), "data").unwrap();
        }
        f.dispatcher.spawn_workers();
        for i in 0..12 {
            f.dispatcher
                .enqueue(Intent::upload(rel(&format!("f{}.txt", i))))
                .unwrap();
        }
        wait_idle(&f.dispatcher).await;

        assert_eq!(f.transport.files().len(), 12);
        assert!(f.transport.max_concurrency() <= 3);
        assert!(f.transport.max_concurrency() >= 2);
    }

    #[tokio::test]
    async fn test_drain_abandons_outstanding_work() {
        let f = fixture(100, 1, Duration::ZERO);
        std::fs::write(f.dir.path().join("stuck.txt"), "x").unwrap();
        f.transport
            .fail_always(CallKind::Put, Some(rel("stuck.txt")), FailureClass::Transient);
        f.dispatcher.spawn_workers();
        f.dispatcher.enqueue(Intent::upload(rel("stuck.txt"))).unwrap();

        let report = f.dispatcher.drain(Duration::from_millis(100)).await;
        assert!(report.timed_out);
        assert_eq!(report.abandoned.len(), 1);
        assert_eq!(report.abandoned[0].path, rel("stuck.txt"));
        assert!(matches!(
            f.dispatcher.enqueue(Intent::upload(rel("late.txt"))),
            Err(Error::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_drain_waits_for_completion() {
        let f = fixture(5, 2, Duration::from_millis(20));
        std::fs::write(f.dir.path().join("a.txt"), "a").unwrap();
        f.dispatcher.spawn_workers();
        f.dispatcher.enqueue(Intent::upload(rel("a.txt"))).unwrap();

        let report = f.dispatcher.drain(Duration::from_secs(5)).await;
        assert!(!report.timed_out);
        assert!(report.abandoned.is_empty());
        assert_eq!(report.completed, 1);
    }

    #[tokio::test]
    async fn test_queued_intent_is_replaced_before_start() {
        let f = fixture(5, 1, Duration::ZERO);
        f.dispatcher.enqueue(Intent::upload(rel("x"))).unwrap();
        f.dispatcher.enqueue(Intent::delete(rel("x"))).unwrap();

        let snapshot = f.dispatcher.snapshot();
        assert_eq!(snapshot.queued, 1);
        assert_eq!(snapshot.backlog, 0);

        f.dispatcher.spawn_workers();
        wait_idle(&f.dispatcher).await;
        assert_eq!(f.transport.calls_of(CallKind::Remove, Some(&rel("x"))).len(), 1);
        assert!(f.transport.calls_of(CallKind::Put, None).is_empty());
    }
}
