//! Lifecycle host wiring the pipeline together
//!
//! [`MirrorEngine::start`] validates the configuration, connects the session,
//! and spawns the three pipeline stages connected by bounded channels:
//! watcher → coalescer → dispatcher. The returned [`MirrorHandle`] is the
//! only way to stop them again.

use crate::dispatcher::{Dispatcher, DispatcherConfig, DispatcherSnapshot};
use crate::monitor::{SinkSet, Statistics, StatisticsCollector, TracingSink};
use dirmirror_config::{Config, ConfigBuilder, TransportKind};
use dirmirror_session::{
    CredentialProvider, Credentials, EnvCredentialProvider, LocalTransport, MemoryTransport,
    RemoteTransport, Session, SessionConfig, SessionStats, SftpTransport, SshConfig, SshTransport,
};
use dirmirror_types::{
    ConnectionState, DeadLetter, Error, Intent, ObservabilitySink, RawEvent, Result, RetryPolicy,
};
use dirmirror_watch::{
    initial_scan, Coalescer, CoalescerConfig, CoalescerStats, CoalescerStatsHandle, IgnorePolicy,
    WatchSignal, WatchSubscription,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Build the transport named by the configuration
///
/// The system `ssh` client runs in batch mode and cannot log in with a
/// password, so an `ssh` remote with a password in `credentials` is reached
/// over SFTP instead.
pub fn transport_from_config(
    config: &Config,
    credentials: &Credentials,
) -> Result<Arc<dyn RemoteTransport>> {
    let transport: Arc<dyn RemoteTransport> = match config.remote.transport {
        TransportKind::Local => Arc::new(LocalTransport::new(&config.remote_root)),
        TransportKind::Memory => Arc::new(MemoryTransport::new()),
        TransportKind::Ssh if credentials.password().is_none() => {
            Arc::new(SshTransport::new(ssh_config(config)?))
        }
        TransportKind::Ssh => {
            info!("Password supplied, reaching {} over sftp", config.remote_root);
            Arc::new(SftpTransport::new(ssh_config(config)?))
        }
        TransportKind::Sftp => Arc::new(SftpTransport::new(ssh_config(config)?)),
    };
    Ok(transport)
}

fn ssh_config(config: &Config) -> Result<SshConfig> {
    let host = config
        .remote
        .host
        .clone()
        .ok_or_else(|| Error::config("remote.host is required for the ssh and sftp transports"))?;
    let mut ssh = SshConfig::new(host, config.remote_root.clone());
    ssh.port = config.remote.port;
    ssh.username = config.remote.username.clone();
    ssh.identity_file = config.remote.identity_file.clone();
    ssh.connect_timeout = Duration::from_millis(config.remote.connect_timeout_ms);
    ssh.operation_timeout = Duration::from_millis(config.remote.operation_timeout_ms);
    Ok(ssh)
}

/// Credentials from the environment, falling back to the configured user and key
pub fn credentials_from_config(config: &Config) -> Result<Credentials> {
    EnvCredentialProvider::new()
        .with_default_username(config.remote.username.clone())
        .with_default_identity_file(config.remote.identity_file.clone())
        .credentials()
}

/// A local mirror root inside the watched root, which must not be watched
fn mirror_inside_root(root: &Path, config: &Config) -> Option<PathBuf> {
    if config.remote.transport != TransportKind::Local {
        return None;
    }
    let remote = Path::new(&config.remote_root);
    let remote = std::fs::canonicalize(remote).unwrap_or_else(|_| remote.to_path_buf());
    remote.starts_with(root).then_some(remote)
}

/// Summary returned by [`MirrorHandle::shutdown`]
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    /// Operations completed over the engine's lifetime
    pub completed: u64,
    /// Operations dead-lettered over the engine's lifetime
    pub dead_lettered: u64,
    /// Intents still outstanding when the grace period ran out
    pub abandoned: Vec<Intent>,
    /// Every dead-lettered operation
    pub dead_letters: Vec<DeadLetter>,
    /// Final coalescer counters
    pub coalescer: CoalescerStats,
    /// Final operation statistics
    pub statistics: Statistics,
    /// Whether the grace period expired before the queue emptied
    pub timed_out: bool,
}

/// Entry point for running a mirror
#[derive(Debug, Clone, Copy, Default)]
pub struct MirrorEngine;

impl MirrorEngine {
    /// Validate `config` and start mirroring its watch root through `transport`
    ///
    /// Configuration problems fail here, before any component is created. A
    /// remote store that is unreachable at startup is only logged; the
    /// session keeps reconnecting as work arrives.
    pub async fn start(
        config: Config,
        transport: Arc<dyn RemoteTransport>,
        credentials: Credentials,
        sink: Arc<dyn ObservabilitySink>,
    ) -> Result<MirrorHandle> {
        ConfigBuilder::validate(&config)?;
        let window = config.debounce_window()?;
        let workers = config.worker_count()?;
        let retry = config.retry_config()?;
        let mut ignore = IgnorePolicy::new(&config.ignore.patterns, config.ignore.ignore_hidden)?;

        let root = std::fs::canonicalize(&config.watch_root).map_err(|e| {
            Error::config(format!(
                "watch root '{}' is not accessible: {}",
                config.watch_root.display(),
                e
            ))
        })?;

        let session = Arc::new(Session::with_config(
            transport,
            credentials,
            SessionConfig {
                skip_unchanged: config.sync.skip_unchanged,
                connect_timeout: Duration::from_millis(config.remote.connect_timeout_ms),
                operation_timeout: Duration::from_millis(config.remote.operation_timeout_ms),
            },
        ));
        match session.connect().await {
            Ok(()) => {}
            Err(e) if e.is_recoverable() => {
                warn!("Remote store unavailable at startup, will keep trying: {}", e);
            }
            Err(e) => return Err(e),
        }

        // checked after connect, which creates a missing local mirror root
        if let Some(mirror) = mirror_inside_root(&root, &config) {
            if mirror == root {
                return Err(Error::config("remote_root must differ from watch_root"));
            }
            info!("Excluding mirror directory {} from watching", mirror.display());
            ignore = ignore.exclude_subtree(mirror);
        }

        let statistics = Arc::new(StatisticsCollector::new());
        let sinks = SinkSet::new()
            .with(TracingSink)
            .with_shared(statistics.clone())
            .with_shared(sink);

        let mut dispatcher_config = DispatcherConfig::new(&root);
        dispatcher_config.worker_count = workers;
        dispatcher_config.degraded_wait = retry.max_delay;
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&session),
            RetryPolicy::new(retry),
            Arc::new(sinks),
            dispatcher_config,
        ));

        let capacity = config.sync.queue_capacity;
        let subscription = WatchSubscription::subscribe(&root, ignore.clone(), capacity)?;

        dispatcher.spawn_workers();
        let (raw_tx, raw_rx) = mpsc::channel(capacity);
        let (intent_tx, intent_rx) = mpsc::channel(capacity);

        let coalescer = Coalescer::new(
            &root,
            CoalescerConfig {
                window,
                flush_on_shutdown: config.sync.flush_on_shutdown,
            },
        );
        let coalescer_stats = coalescer.stats_handle();
        let coalescer_task = tokio::spawn(coalescer.run(raw_rx, intent_tx));
        let intake_task = tokio::spawn(Arc::clone(&dispatcher).run_intake(intent_rx));

        let (failure_tx, failure_rx) = watch::channel(None);
        let (stop_tx, stop_rx) = oneshot::channel();
        let scan_task = if config.sync.initial_sync {
            Some(tokio::spawn(scan(root.clone(), ignore, raw_tx.clone())))
        } else {
            None
        };
        let watch_task = tokio::spawn(pump(subscription, raw_tx, stop_rx, failure_tx));

        info!(
            "Mirroring {} to {} via {}",
            root.display(),
            config.remote_root,
            session.transport_name()
        );

        Ok(MirrorHandle {
            root,
            dispatcher,
            session,
            statistics,
            coalescer_stats,
            failure: failure_rx,
            stop: Some(stop_tx),
            watch_task,
            scan_task,
            coalescer_task,
            intake_task,
            grace: config.shutdown_grace(),
        })
    }
}

async fn scan(root: PathBuf, policy: IgnorePolicy, events: mpsc::Sender<RawEvent>) {
    let scan_root = root.clone();
    let found = match tokio::task::spawn_blocking(move || initial_scan(&scan_root, &policy)).await
    {
        Ok(found) => found,
        Err(e) => {
            warn!("Initial scan of {} failed: {}", root.display(), e);
            return;
        }
    };

    info!("Initial scan found {} files", found.len());
    for event in found {
        if events.send(event).await.is_err() {
            break;
        }
    }
}

async fn pump(
    mut subscription: WatchSubscription,
    events: mpsc::Sender<RawEvent>,
    mut stop: oneshot::Receiver<()>,
    failure: watch::Sender<Option<Error>>,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            signal = subscription.next_signal() => match signal {
                Some(WatchSignal::Event(raw)) => {
                    if events.send(raw).await.is_err() {
                        break;
                    }
                }
                Some(WatchSignal::Failure(e)) => {
                    error!("Watch on {} failed: {}", subscription.root().display(), e);
                    failure.send_replace(Some(e));
                    break;
                }
                None => {
                    let e = Error::watch(subscription.root(), "watch stream ended unexpectedly");
                    error!("{}", e);
                    failure.send_replace(Some(e));
                    break;
                }
            }
        }
    }
    subscription.close();
    debug!("watch pump finished");
}

/// Handle onto a running mirror
#[derive(Debug)]
pub struct MirrorHandle {
    root: PathBuf,
    dispatcher: Arc<Dispatcher>,
    session: Arc<Session>,
    statistics: Arc<StatisticsCollector>,
    coalescer_stats: CoalescerStatsHandle,
    failure: watch::Receiver<Option<Error>>,
    stop: Option<oneshot::Sender<()>>,
    watch_task: JoinHandle<()>,
    scan_task: Option<JoinHandle<()>>,
    coalescer_task: JoinHandle<CoalescerStats>,
    intake_task: JoinHandle<()>,
    grace: Duration,
}

impl MirrorHandle {
    /// The canonical watched root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Grace period from the configuration
    pub fn shutdown_grace(&self) -> Duration {
        self.grace
    }

    /// Wait for the watch subscription to fail
    ///
    /// Returns `None` if the watch ended without a failure.
    pub async fn watch_failure(&self) -> Option<Error> {
        let mut failure = self.failure.clone();
        let error = match failure.wait_for(Option::is_some).await {
            Ok(current) => current.clone(),
            Err(_) => None,
        };
        error
    }

    /// Operations that will not be retried
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dispatcher.dead_letters()
    }

    /// Aggregated operation statistics
    pub fn statistics(&self) -> Statistics {
        self.statistics.get_current_stats()
    }

    /// Outstanding work in the dispatcher
    pub fn snapshot(&self) -> DispatcherSnapshot {
        self.dispatcher.snapshot()
    }

    /// Coalescer counters so far
    pub fn coalescer_stats(&self) -> CoalescerStats {
        self.coalescer_stats.snapshot()
    }

    /// Current connection state of the session
    pub fn connection_state(&self) -> ConnectionState {
        self.session.state()
    }

    /// Session activity counters
    pub fn session_stats(&self) -> SessionStats {
        self.session.stats()
    }

    /// Stop watching, flush or discard pending intents, give in-flight
    /// operations `grace` to finish and close the session
    pub async fn shutdown(self, grace: Duration) -> ShutdownReport {
        let Self {
            root,
            dispatcher,
            session,
            statistics,
            coalescer_stats,
            stop,
            watch_task,
            scan_task,
            coalescer_task,
            intake_task,
            ..
        } = self;
        info!("Stopping mirror of {}", root.display());

        if let Some(stop) = stop {
            // the pump may already have ended after a watch failure
            let _ = stop.send(());
        }
        if let Some(scan) = scan_task {
            scan.abort();
            let _ = scan.await;
        }
        if let Err(e) = watch_task.await {
            warn!("watch task ended abnormally: {}", e);
        }

        let coalescer = match coalescer_task.await {
            Ok(stats) => stats,
            Err(e) => {
                warn!("coalescer task ended abnormally: {}", e);
                coalescer_stats.snapshot()
            }
        };
        if let Err(e) = intake_task.await {
            warn!("intake task ended abnormally: {}", e);
        }

        let drained = dispatcher.drain(grace).await;
        if let Err(e) = session.close().await {
            warn!("Closing the session failed: {}", e);
        }

        let report = ShutdownReport {
            completed: drained.completed,
            dead_lettered: drained.dead_lettered,
            abandoned: drained.abandoned,
            dead_letters: dispatcher.dead_letters(),
            coalescer,
            statistics: statistics.get_current_stats(),
            timed_out: drained.timed_out,
        };
        info!(
            "Mirror stopped: {} completed, {} dead-lettered, {} abandoned",
            report.completed,
            report.dead_lettered,
            report.abandoned.len()
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirmirror_session::CallKind;
    use dirmirror_types::{FailureClass, NoopSink, RelativePath};
    use tempfile::TempDir;

    fn config(root: &Path, transport: TransportKind, remote_root: &str) -> Config {
        let mut config = Config::default();
        config.watch_root = root.to_path_buf();
        config.remote_root = remote_root.to_string();
        config.remote.transport = transport;
        config.sync.debounce_window_ms = 50;
        config.retry.backoff_base_ms = 10;
        config.retry.backoff_cap_ms = 50;
        config
    }

    async fn eventually<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        check()
    }

    #[tokio::test]
    async fn test_mirrors_new_and_existing_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("existing.txt"), "old").unwrap();
        let transport = Arc::new(MemoryTransport::new());

        let handle = MirrorEngine::start(
            config(dir.path(), TransportKind::Memory, "mem"),
            transport.clone(),
            Credentials::anonymous(),
            Arc::new(NoopSink),
        )
        .await
        .unwrap();

        std::fs::write(dir.path().join("a.txt"), "hi").unwrap();
        let existing = RelativePath::new("existing.txt").unwrap();
        let created = RelativePath::new("a.txt").unwrap();
        assert!(eventually(|| transport.file(&existing).is_some()).await);
        assert!(eventually(|| transport.file(&created).as_deref() == Some(b"hi".as_slice())).await);

        let report = handle.shutdown(Duration::from_secs(5)).await;
        assert!(report.completed >= 2);
        assert!(report.abandoned.is_empty());
        assert!(report.coalescer.events_received >= 2);
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_deletes_are_mirrored() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("gone.txt");
        std::fs::write(&file, "bye").unwrap();
        let transport = Arc::new(MemoryTransport::new());

        let handle = MirrorEngine::start(
            config(dir.path(), TransportKind::Memory, "mem"),
            transport.clone(),
            Credentials::anonymous(),
            Arc::new(NoopSink),
        )
        .await
        .unwrap();

        let path = RelativePath::new("gone.txt").unwrap();
        assert!(eventually(|| transport.file(&path).is_some()).await);
        std::fs::remove_file(&file).unwrap();
        assert!(eventually(|| transport.file(&path).is_none()).await);

        handle.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_invalid_config_fails_before_start() {
        let dir = TempDir::new().unwrap();
        let mut bad = config(dir.path(), TransportKind::Memory, "mem");
        bad.sync.worker_count = 0;

        let error = MirrorEngine::start(
            bad,
            Arc::new(MemoryTransport::new()),
            Credentials::anonymous(),
            Arc::new(NoopSink),
        )
        .await
        .unwrap_err();
        assert!(error.is_fatal());
    }

    #[tokio::test]
    async fn test_permanent_connect_failure_fails_start() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        transport.fail_next(CallKind::Connect, None, FailureClass::Permanent, 1);

        let result = MirrorEngine::start(
            config(dir.path(), TransportKind::Memory, "mem"),
            transport,
            Credentials::anonymous(),
            Arc::new(NoopSink),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_local_mirror_inside_root_is_not_watched() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let mirror = root.join("mirror");
        let cfg = config(&root, TransportKind::Local, mirror.to_str().unwrap());
        let transport = transport_from_config(&cfg, &Credentials::anonymous()).unwrap();

        let handle = MirrorEngine::start(cfg, transport, Credentials::anonymous(), Arc::new(NoopSink))
            .await
            .unwrap();

        std::fs::write(root.join("doc.txt"), "content").unwrap();
        assert!(eventually(|| mirror.join("doc.txt").is_file()).await);
        tokio::time::sleep(Duration::from_millis(300)).await;

        let report = handle.shutdown(Duration::from_secs(5)).await;
        assert!(!mirror.join("mirror").exists());
        assert_eq!(report.completed, 1);
    }

    #[tokio::test]
    async fn test_removed_root_surfaces_watch_failure() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("watched");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(root.join("a.txt"), "x").unwrap();

        let handle = MirrorEngine::start(
            config(&root, TransportKind::Memory, "mem"),
            Arc::new(MemoryTransport::new()),
            Credentials::anonymous(),
            Arc::new(NoopSink),
        )
        .await
        .unwrap();

        std::fs::remove_dir_all(&root).unwrap();
        let failure = tokio::time::timeout(Duration::from_secs(10), handle.watch_failure())
            .await
            .unwrap()
            .expect("watch failure reported");
        assert!(failure.is_fatal());
        assert!(matches!(failure, Error::WatchFailure { .. }));

        handle.shutdown(Duration::from_secs(2)).await;
    }

    #[test]
    fn test_transport_from_config() {
        let dir = TempDir::new().unwrap();
        let anonymous = Credentials::anonymous();
        let mut cfg = config(dir.path(), TransportKind::Ssh, "/srv/mirror");
        assert!(transport_from_config(&cfg, &anonymous).is_err());

        cfg.remote.host = Some("example.org".to_string());
        assert_eq!(transport_from_config(&cfg, &anonymous).unwrap().name(), "ssh");
        cfg.remote.transport = TransportKind::Sftp;
        assert_eq!(transport_from_config(&cfg, &anonymous).unwrap().name(), "sftp");
        cfg.remote.transport = TransportKind::Memory;
        assert_eq!(transport_from_config(&cfg, &anonymous).unwrap().name(), "memory");
    }

    #[test]
    fn test_password_selects_sftp_for_ssh_remotes() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(dir.path(), TransportKind::Ssh, "/srv/mirror");
        cfg.remote.host = Some("example.org".to_string());
        let password = Credentials::for_user("deploy").with_password("hunter2");

        assert_eq!(transport_from_config(&cfg, &password).unwrap().name(), "sftp");
        cfg.remote.transport = TransportKind::Local;
        assert_eq!(transport_from_config(&cfg, &password).unwrap().name(), "local");
    }
}
