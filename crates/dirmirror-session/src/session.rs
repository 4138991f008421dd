//! A single logical connection to the remote store
//!
//! The [`Session`] owns the transport, the credentials and the connection
//! state. Dispatcher workers share one session and call its primitives
//! concurrently for different paths; only the session itself mutates the
//! connection state, which workers observe through [`Session::subscribe_state`].

use crate::credentials::Credentials;
use crate::transport::RemoteTransport;
use bytes::Bytes;
use dirmirror_types::{ConnectionState, Error, RelativePath, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

/// Session behaviour settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Skip a put whose content matches the last successful put for the path
    pub skip_unchanged: bool,
    /// Bound on a single connect attempt; zero disables the bound
    pub connect_timeout: Duration,
    /// Bound on a single remote operation; zero disables the bound
    pub operation_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            skip_unchanged: true,
            connect_timeout: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(60),
        }
    }
}

/// Counters describing session activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Successful connects, the first one included
    pub connects: u64,
    /// Connect attempts that failed
    pub failed_connects: u64,
    /// Remote operations that succeeded
    pub operations: u64,
    /// Remote operations that failed
    pub failures: u64,
    /// Puts skipped because the content was unchanged
    pub skipped_puts: u64,
}

#[derive(Debug, Default)]
struct SessionCounters {
    connects: AtomicU64,
    failed_connects: AtomicU64,
    operations: AtomicU64,
    failures: AtomicU64,
    skipped_puts: AtomicU64,
}

impl SessionCounters {
    fn snapshot(&self) -> SessionStats {
        SessionStats {
            connects: self.connects.load(Ordering::Relaxed),
            failed_connects: self.failed_connects.load(Ordering::Relaxed),
            operations: self.operations.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            skipped_puts: self.skipped_puts.load(Ordering::Relaxed),
        }
    }
}

enum RemoteOp<'a> {
    Put(&'a RelativePath, Bytes),
    Remove(&'a RelativePath),
    MkdirAll(&'a RelativePath),
}

impl RemoteOp<'_> {
    fn path(&self) -> &RelativePath {
        match self {
            Self::Put(path, _) | Self::Remove(path) | Self::MkdirAll(path) => path,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Put(..) => "put",
            Self::Remove(_) => "remove",
            Self::MkdirAll(_) => "mkdir_all",
        }
    }
}

async fn bounded<F>(limit: Duration, future: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    if limit.is_zero() {
        return future.await;
    }
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            millis: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

/// Connection to the remote store shared by all dispatcher workers
pub struct Session {
    transport: Arc<dyn RemoteTransport>,
    credentials: Credentials,
    config: SessionConfig,
    state: watch::Sender<ConnectionState>,
    last_error: RwLock<Option<Error>>,
    connect_lock: tokio::sync::Mutex<()>,
    digests: Mutex<HashMap<RelativePath, blake3::Hash>>,
    counters: SessionCounters,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("transport", &self.transport.name())
            .field("credentials", &self.credentials)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a disconnected session with default settings
    pub fn new(transport: Arc<dyn RemoteTransport>, credentials: Credentials) -> Self {
        Self::with_config(transport, credentials, SessionConfig::default())
    }

    /// Create a disconnected session
    pub fn with_config(
        transport: Arc<dyn RemoteTransport>,
        credentials: Credentials,
        config: SessionConfig,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            credentials,
            config,
            state,
            last_error: RwLock::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            digests: Mutex::new(HashMap::new()),
            counters: SessionCounters::default(),
        }
    }

    /// Name of the underlying transport
    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Read-only subscription to connection state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// The most recent failure, if any
    pub async fn last_error(&self) -> Option<Error> {
        self.last_error.read().await.clone()
    }

    /// Activity counters
    pub fn stats(&self) -> SessionStats {
        self.counters.snapshot()
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!("session state {} -> {}", previous, next);
        }
    }

    fn digests(&self) -> MutexGuard<'_, HashMap<RelativePath, blake3::Hash>> {
        self.digests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    async fn record_error(&self, error: &Error) {
        *self.last_error.write().await = Some(error.clone());
    }

    /// Connect unless already `Ready`
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        if self.state() == ConnectionState::Ready {
            return Ok(());
        }

        let previous = self.state();
        self.set_state(ConnectionState::Connecting);
        let result = bounded(
            self.config.connect_timeout,
            self.transport.connect(&self.credentials),
        )
        .await;

        match result {
            Ok(()) => {
                let connects = self.counters.connects.fetch_add(1, Ordering::Relaxed);
                if connects == 0 {
                    info!("Connected to remote store via {}", self.transport.name());
                } else {
                    info!("Reconnected to remote store via {}", self.transport.name());
                }
                self.set_state(ConnectionState::Ready);
                Ok(())
            }
            Err(error) => {
                self.counters.failed_connects.fetch_add(1, Ordering::Relaxed);
                warn!("Connecting via {} failed: {}", self.transport.name(), error);
                self.record_error(&error).await;
                // a session that never connected stays disconnected
                self.set_state(if previous == ConnectionState::Disconnected {
                    ConnectionState::Disconnected
                } else {
                    ConnectionState::Degraded
                });
                Err(error)
            }
        }
    }

    async fn execute(&self, op: RemoteOp<'_>) -> Result<()> {
        let path = op.path();
        if self.state() != ConnectionState::Ready {
            self.connect()
                .await
                .map_err(|e| e.into_transfer(path.as_str()))?;
        }

        let call = match &op {
            RemoteOp::Put(path, content) => self.transport.put(path, content.clone()),
            RemoteOp::Remove(path) => self.transport.remove(path),
            RemoteOp::MkdirAll(path) => self.transport.mkdir_all(path),
        };
        let Err(error) = bounded(self.config.operation_timeout, call).await else {
            self.counters.operations.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        };

        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        let error = error.into_transfer(path.as_str());
        self.record_error(&error).await;
        if error.is_recoverable() {
            warn!("{} {} failed transiently: {}", op.name(), path, error);
            self.state.send_if_modified(|state| {
                let ready = *state == ConnectionState::Ready;
                if ready {
                    *state = ConnectionState::Degraded;
                }
                ready
            });
            if let Err(reconnect) = self.connect().await {
                debug!("reconnect after failed {} did not succeed: {}", op.name(), reconnect);
            }
        } else {
            debug!("{} {} failed permanently: {}", op.name(), path, error);
        }
        Err(error)
    }

    /// Replace the content at `path`
    ///
    /// Identical content to the last successful put for `path` is skipped
    /// when `skip_unchanged` is set.
    pub async fn put(&self, path: &RelativePath, content: Bytes) -> Result<()> {
        let digest = self
            .config
            .skip_unchanged
            .then(|| blake3::hash(&content));

        {
            let mut digests = self.digests();
            if digest.is_some() && digests.get(path) == digest.as_ref() {
                self.counters.skipped_puts.fetch_add(1, Ordering::Relaxed);
                debug!("skipping unchanged {}", path);
                return Ok(());
            }
            // remote content is uncertain until the put succeeds
            digests.remove(path);
        }

        self.execute(RemoteOp::Put(path, content)).await?;

        let mut digests = self.digests();
        digests.retain(|known, _| !path.is_ancestor_of(known));
        if let Some(digest) = digest {
            digests.insert(path.clone(), digest);
        }
        Ok(())
    }

    /// Remove `path` and everything below it; an absent path is success
    pub async fn remove(&self, path: &RelativePath) -> Result<()> {
        self.forget(path);
        self.execute(RemoteOp::Remove(path)).await
    }

    /// Create the directory `path` and its parents
    pub async fn mkdir_all(&self, path: &RelativePath) -> Result<()> {
        self.digests().remove(path);
        self.execute(RemoteOp::MkdirAll(path)).await
    }

    fn forget(&self, path: &RelativePath) {
        self.digests()
            .retain(|known, _| known != path && !path.is_ancestor_of(known));
    }

    /// Release the connection
    pub async fn close(&self) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        if self.state() == ConnectionState::Disconnected {
            return Ok(());
        }
        let result = self.transport.close().await;
        self.set_state(ConnectionState::Disconnected);
        info!("Session closed");
        result
    }
}
