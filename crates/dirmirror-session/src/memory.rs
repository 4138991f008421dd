//! In-process transport with scripted faults
//!
//! Keeps the mirrored tree in memory and records every call. Faults can be
//! scripted per call kind and path to exercise retry and dead-letter paths
//! deterministically. The CLI's `--dry-run` mode also mirrors into it.

use crate::credentials::Credentials;
use crate::transport::RemoteTransport;
use bytes::Bytes;
use dirmirror_types::{Error, FailureClass, RelativePath, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Kind of transport call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    /// `connect`
    Connect,
    /// `put`
    Put,
    /// `remove`
    Remove,
    /// `mkdir_all`
    MkdirAll,
    /// `close`
    Close,
}

/// One recorded transport call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportCall {
    /// What was called
    pub kind: CallKind,
    /// Target path, absent for connection calls
    pub path: Option<RelativePath>,
    /// Content handed to `put`
    pub content: Option<Bytes>,
    /// Whether the call succeeded
    pub succeeded: bool,
}

#[derive(Debug, Clone)]
struct Fault {
    kind: CallKind,
    path: Option<RelativePath>,
    class: FailureClass,
    remaining: u32,
}

#[derive(Debug, Default)]
struct MemoryState {
    files: BTreeMap<RelativePath, Bytes>,
    dirs: BTreeSet<RelativePath>,
    calls: Vec<TransportCall>,
    faults: Vec<Fault>,
    connected: bool,
    in_flight: HashMap<RelativePath, u32>,
    total_in_flight: usize,
    max_concurrency: usize,
    overlapping_paths: BTreeSet<RelativePath>,
}

/// Transport keeping the mirror in memory
#[derive(Debug, Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
    latency: Duration,
}

impl MemoryTransport {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every path operation take `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Fail the next `times` calls of `kind` (for `path`, or any path)
    pub fn fail_next(
        &self,
        kind: CallKind,
        path: Option<RelativePath>,
        class: FailureClass,
        times: u32,
    ) {
        self.lock().faults.push(Fault {
            kind,
            path,
            class,
            remaining: times,
        });
    }

    /// Fail every call of `kind` for `path` (or any path)
    pub fn fail_always(&self, kind: CallKind, path: Option<RelativePath>, class: FailureClass) {
        self.fail_next(kind, path, class, u32::MAX);
    }

    /// Remove all scripted faults
    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// Content stored at `path`
    pub fn file(&self, path: &RelativePath) -> Option<Bytes> {
        self.lock().files.get(path).cloned()
    }

    /// All stored files
    pub fn files(&self) -> BTreeMap<RelativePath, Bytes> {
        self.lock().files.clone()
    }

    /// Whether a directory exists at `path`
    pub fn has_dir(&self, path: &RelativePath) -> bool {
        self.lock().dirs.contains(path)
    }

    /// Every call made so far
    pub fn calls(&self) -> Vec<TransportCall> {
        self.lock().calls.clone()
    }

    /// Calls of `kind`, optionally restricted to `path`
    pub fn calls_of(&self, kind: CallKind, path: Option<&RelativePath>) -> Vec<TransportCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.kind == kind && path.map_or(true, |p| c.path.as_ref() == Some(p)))
            .cloned()
            .collect()
    }

    /// Highest number of path operations observed running at once
    pub fn max_concurrency(&self) -> usize {
        self.lock().max_concurrency
    }

    /// Paths that ever had two operations running at once
    pub fn overlapping_paths(&self) -> BTreeSet<RelativePath> {
        self.lock().overlapping_paths.clone()
    }

    /// Whether `connect` has succeeded more recently than `close`
    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    fn take_fault(
        state: &mut MemoryState,
        kind: CallKind,
        path: Option<&RelativePath>,
    ) -> Option<FailureClass> {
        let index = state.faults.iter().position(|f| {
            f.kind == kind && f.remaining > 0 && (f.path.is_none() || f.path.as_ref() == path)
        })?;
        let fault = &mut state.faults[index];
        let class = fault.class;
        if fault.remaining != u32::MAX {
            fault.remaining -= 1;
        }
        if fault.remaining == 0 {
            state.faults.remove(index);
        }
        Some(class)
    }

    fn fault_error(kind: CallKind, path: Option<&RelativePath>, class: FailureClass) -> Error {
        let target = path.map_or("", RelativePath::as_str);
        let message = format!("injected {} failure for {:?}", class, kind);
        match class {
            FailureClass::Transient => Error::transient(target, message),
            FailureClass::Permanent => Error::permanent(target, message),
        }
    }

    /// Run one path operation: track concurrency, simulate latency, consult
    /// the fault script, then apply `apply` to the stored tree.
    async fn path_op<F>(
        &self,
        kind: CallKind,
        path: &RelativePath,
        content: Option<Bytes>,
        apply: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut MemoryState),
    {
        let running = InFlight::enter(self, path)?;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        drop(running);

        let mut state = self.lock();
        let fault = Self::take_fault(&mut state, kind, Some(path));
        state.calls.push(TransportCall {
            kind,
            path: Some(path.clone()),
            content,
            succeeded: fault.is_none(),
        });
        match fault {
            Some(class) => Err(Self::fault_error(kind, Some(path), class)),
            None => {
                apply(&mut state);
                Ok(())
            }
        }
    }
}

/// Marks a path operation as running until dropped, so cancelled calls are
/// accounted for too
struct InFlight<'a> {
    transport: &'a MemoryTransport,
    path: RelativePath,
}

impl<'a> InFlight<'a> {
    fn enter(transport: &'a MemoryTransport, path: &RelativePath) -> Result<Self> {
        let mut state = transport.lock();
        if !state.connected {
            return Err(Error::transient(
                path.as_str(),
                "memory transport is not connected",
            ));
        }
        let running = state.in_flight.entry(path.clone()).or_insert(0);
        *running += 1;
        if *running > 1 {
            state.overlapping_paths.insert(path.clone());
        }
        state.total_in_flight += 1;
        state.max_concurrency = state.max_concurrency.max(state.total_in_flight);
        Ok(Self {
            transport,
            path: path.clone(),
        })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = self.transport.lock();
        if let Some(running) = state.in_flight.get_mut(&self.path) {
            *running -= 1;
            if *running == 0 {
                state.in_flight.remove(&self.path);
            }
        }
        state.total_in_flight = state.total_in_flight.saturating_sub(1);
    }
}

fn add_parents(state: &mut MemoryState, path: &RelativePath) {
    let mut parent = path.parent();
    while let Some(dir) = parent {
        parent = dir.parent();
        state.dirs.insert(dir);
    }
}

#[async_trait::async_trait]
impl RemoteTransport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self, _credentials: &Credentials) -> Result<()> {
        let mut state = self.lock();
        let fault = Self::take_fault(&mut state, CallKind::Connect, None);
        state.calls.push(TransportCall {
            kind: CallKind::Connect,
            path: None,
            content: None,
            succeeded: fault.is_none(),
        });
        if let Some(class) = fault {
            state.connected = false;
            return Err(Self::fault_error(CallKind::Connect, None, class));
        }
        state.connected = true;
        Ok(())
    }

    async fn put(&self, path: &RelativePath, content: Bytes) -> Result<()> {
        let target = path.clone();
        let stored = content.clone();
        self.path_op(CallKind::Put, path, Some(content), move |state| {
            state.dirs.remove(&target);
            state.files.retain(|p, _| !target.is_ancestor_of(p));
            add_parents(state, &target);
            state.files.insert(target, stored);
        })
        .await
    }

    async fn remove(&self, path: &RelativePath) -> Result<()> {
        let target = path.clone();
        self.path_op(CallKind::Remove, path, None, move |state| {
            state.files.remove(&target);
            state.files.retain(|p, _| !target.is_ancestor_of(p));
            state.dirs.remove(&target);
            state.dirs.retain(|p| !target.is_ancestor_of(p));
        })
        .await
    }

    async fn mkdir_all(&self, path: &RelativePath) -> Result<()> {
        let target = path.clone();
        self.path_op(CallKind::MkdirAll, path, None, move |state| {
            state.files.remove(&target);
            add_parents(state, &target);
            state.dirs.insert(target);
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.lock();
        state.connected = false;
        state.calls.push(TransportCall {
            kind: CallKind::Close,
            path: None,
            content: None,
            succeeded: true,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rel(path: &str) -> RelativePath {
        RelativePath::new(path).unwrap()
    }

    async fn connected() -> MemoryTransport {
        let transport = MemoryTransport::new();
        transport.connect(&Credentials::anonymous()).await.unwrap();
        transport
    }

    #[tokio::test]
    async fn test_tree_operations() {
        let transport = connected().await;
        transport
            .put(&rel("a/b/c.txt"), Bytes::from_static(b"c"))
            .await
            .unwrap();
        assert!(transport.has_dir(&rel("a/b")));
        assert_eq!(transport.file(&rel("a/b/c.txt")).unwrap(), "c");

        transport.remove(&rel("a")).await.unwrap();
        assert!(transport.files().is_empty());
        assert!(!transport.has_dir(&rel("a/b")));

        transport.mkdir_all(&rel("x/y")).await.unwrap();
        assert!(transport.has_dir(&rel("x")));
    }

    #[tokio::test]
    async fn test_scripted_faults() {
        let transport = connected().await;
        transport.fail_next(CallKind::Put, Some(rel("f")), FailureClass::Transient, 2);

        for _ in 0..2 {
            let error = transport
                .put(&rel("f"), Bytes::from_static(b"1"))
                .await
                .unwrap_err();
            assert!(error.is_recoverable());
        }
        transport.put(&rel("f"), Bytes::from_static(b"1")).await.unwrap();

        // other paths were never affected
        transport.put(&rel("g"), Bytes::from_static(b"2")).await.unwrap();
        let puts = transport.calls_of(CallKind::Put, Some(&rel("f")));
        assert_eq!(puts.len(), 3);
        assert_eq!(puts.iter().filter(|c| c.succeeded).count(), 1);
    }

    #[tokio::test]
    async fn test_requires_connection() {
        let transport = MemoryTransport::new();
        assert!(transport.remove(&rel("a")).await.unwrap_err().is_recoverable());

        transport.fail_next(CallKind::Connect, None, FailureClass::Permanent, 1);
        assert!(!transport
            .connect(&Credentials::anonymous())
            .await
            .unwrap_err()
            .is_recoverable());
        transport.connect(&Credentials::anonymous()).await.unwrap();
        assert!(transport.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_tracking() {
        let transport = std::sync::Arc::new(
            MemoryTransport::new().with_latency(Duration::from_millis(10)),
        );
        transport.connect(&Credentials::anonymous()).await.unwrap();

        let a = {
            let t = transport.clone();
            tokio::spawn(async move { t.put(&rel("a"), Bytes::from_static(b"a")).await })
        };
        let b = {
            let t = transport.clone();
            tokio::spawn(async move { t.put(&rel("b"), Bytes::from_static(b"b")).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(transport.max_concurrency(), 2);
        assert!(transport.overlapping_paths().is_empty());
    }
}
