//! Event coalescer
//!
//! Raw events are folded per relative path into a single pending [`Intent`].
//! Every event restarts the path's debounce timer; when a timer fires the
//! path's intent is released downstream. The merge rules live in
//! [`PendingIntents`] and need no clock. [`Coalescer::run`] drives them with a
//! `DelayQueue` holding one timer per pending path.

use dirmirror_types::{DebounceWindow, Intent, IntentOp, RawEvent, RawEventKind, RelativePath};
use futures::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, info, trace, warn};

/// A change to one path, after renames have been split
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathChange {
    /// Created or modified
    Touched,
    /// Removed
    Removed,
}

/// Result of folding a change into the pending table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The path had no pending intent
    Inserted,
    /// The change folded into an existing intent
    Merged,
}

/// At most one live intent per relative path
#[derive(Debug, Default)]
pub struct PendingIntents {
    entries: HashMap<RelativePath, Intent>,
}

impl PendingIntents {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold `change` into the intent pending for `path`
    pub fn apply(&mut self, path: RelativePath, change: PathChange) -> MergeOutcome {
        let wanted = match change {
            PathChange::Touched => IntentOp::Upload,
            PathChange::Removed => IntentOp::Delete,
        };

        match self.entries.remove(&path) {
            None => {
                self.entries.insert(path.clone(), Intent::new(path, wanted));
                MergeOutcome::Inserted
            }
            Some(current) if current.op == wanted => {
                self.entries.insert(path, current);
                MergeOutcome::Merged
            }
            Some(current) => {
                let replacement = Intent::new(path.clone(), wanted).superseding(current);
                self.entries.insert(path, replacement);
                MergeOutcome::Merged
            }
        }
    }

    /// Remove and return the intent for `path`
    pub fn take(&mut self, path: &RelativePath) -> Option<Intent> {
        self.entries.remove(path)
    }

    /// The intent pending for `path`
    pub fn get(&self, path: &RelativePath) -> Option<&Intent> {
        self.entries.get(path)
    }

    /// Remove every pending intent, ordered by path
    pub fn drain(&mut self) -> Vec<Intent> {
        let mut intents: Vec<Intent> = self.entries.drain().map(|(_, intent)| intent).collect();
        intents.sort_by(|a, b| a.path.cmp(&b.path));
        intents
    }

    /// Number of pending paths
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Split a raw event into per-path changes
pub fn path_changes(event: &RawEvent) -> Vec<(PathBuf, PathChange)> {
    match &event.kind {
        RawEventKind::Created | RawEventKind::Modified => {
            vec![(event.path.clone(), PathChange::Touched)]
        }
        RawEventKind::Removed => vec![(event.path.clone(), PathChange::Removed)],
        RawEventKind::Renamed { from } => vec![
            (from.clone(), PathChange::Removed),
            (event.path.clone(), PathChange::Touched),
        ],
    }
}

/// Counters published by a running coalescer
#[derive(Debug, Default)]
struct Counters {
    events_received: AtomicU64,
    events_merged: AtomicU64,
    events_dropped: AtomicU64,
    intents_released: AtomicU64,
    intents_discarded: AtomicU64,
}

/// Point-in-time coalescer statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoalescerStats {
    /// Raw events consumed
    pub events_received: u64,
    /// Per-path changes folded into an already pending intent
    pub events_merged: u64,
    /// Changes dropped because their path is outside the root
    pub events_dropped: u64,
    /// Intents handed to the dispatcher
    pub intents_released: u64,
    /// Intents dropped at shutdown
    pub intents_discarded: u64,
}

/// Shared handle onto a coalescer's counters
#[derive(Debug, Clone, Default)]
pub struct CoalescerStatsHandle(Arc<Counters>);

impl CoalescerStatsHandle {
    /// Take a snapshot of the counters
    pub fn snapshot(&self) -> CoalescerStats {
        CoalescerStats {
            events_received: self.0.events_received.load(Ordering::Relaxed),
            events_merged: self.0.events_merged.load(Ordering::Relaxed),
            events_dropped: self.0.events_dropped.load(Ordering::Relaxed),
            intents_released: self.0.intents_released.load(Ordering::Relaxed),
            intents_discarded: self.0.intents_discarded.load(Ordering::Relaxed),
        }
    }

    fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Coalescer configuration
#[derive(Debug, Clone, Copy)]
pub struct CoalescerConfig {
    /// Quiet period per path
    pub window: DebounceWindow,
    /// Release pending intents when the input closes instead of dropping them
    pub flush_on_shutdown: bool,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            window: DebounceWindow::default(),
            flush_on_shutdown: true,
        }
    }
}

/// Debounces raw events for one root into intents
#[derive(Debug)]
pub struct Coalescer {
    root: PathBuf,
    config: CoalescerConfig,
    pending: PendingIntents,
    timers: DelayQueue<RelativePath>,
    keys: HashMap<RelativePath, delay_queue::Key>,
    stats: CoalescerStatsHandle,
}

impl Coalescer {
    /// Create a coalescer for events below `root`
    pub fn new<P: Into<PathBuf>>(root: P, config: CoalescerConfig) -> Self {
        Self {
            root: root.into(),
            config,
            pending: PendingIntents::new(),
            timers: DelayQueue::new(),
            keys: HashMap::new(),
            stats: CoalescerStatsHandle::default(),
        }
    }

    /// Handle for reading statistics while [`run`](Self::run) owns the coalescer
    pub fn stats_handle(&self) -> CoalescerStatsHandle {
        self.stats.clone()
    }

    /// The root events are made relative to
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Consume `events` until the channel closes, sending released intents
    /// to `intents`
    ///
    /// When the input closes the pending set is flushed or discarded
    /// according to the configuration. Returns early if the receiving side
    /// of `intents` goes away.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<RawEvent>,
        intents: mpsc::Sender<Intent>,
    ) -> CoalescerStats {
        debug!(
            "coalescer started for {} (window {:?})",
            self.root.display(),
            self.config.window.get()
        );

        loop {
            tokio::select! {
                maybe = events.recv() => match maybe {
                    Some(event) => self.ingest(&event),
                    None => break,
                },
                Some(expired) = self.timers.next(), if !self.timers.is_empty() => {
                    let path = expired.into_inner();
                    self.keys.remove(&path);
                    if let Some(intent) = self.pending.take(&path) {
                        if !self.release(&intents, intent).await {
                            return self.stats.snapshot();
                        }
                    }
                }
            }
        }

        self.timers.clear();
        self.keys.clear();
        let remaining = self.pending.drain();
        if self.config.flush_on_shutdown {
            info!("Flushing {} pending intents", remaining.len());
            for intent in remaining {
                if !self.release(&intents, intent).await {
                    break;
                }
            }
        } else if !remaining.is_empty() {
            info!("Discarding {} pending intents", remaining.len());
            CoalescerStatsHandle::add(&self.stats.0.intents_discarded, remaining.len() as u64);
        }

        self.stats.snapshot()
    }

    fn ingest(&mut self, event: &RawEvent) {
        CoalescerStatsHandle::add(&self.stats.0.events_received, 1);

        for (path, change) in path_changes(event) {
            let relative = match RelativePath::from_root(&self.root, &path) {
                Ok(relative) => relative,
                Err(e) => {
                    warn!("Not mirroring {}: {}", path.display(), e);
                    CoalescerStatsHandle::add(&self.stats.0.events_dropped, 1);
                    continue;
                }
            };

            trace!("{:?} {}", change, relative);
            if self.pending.apply(relative.clone(), change) == MergeOutcome::Merged {
                CoalescerStatsHandle::add(&self.stats.0.events_merged, 1);
            }

            let window = self.config.window.get();
            match self.keys.get(&relative) {
                Some(key) => self.timers.reset(key, window),
                None => {
                    let key = self.timers.insert(relative.clone(), window);
                    self.keys.insert(relative, key);
                }
            }
        }
    }

    async fn release(&self, intents: &mpsc::Sender<Intent>, intent: Intent) -> bool {
        debug!("releasing {}", intent);
        if intents.send(intent).await.is_err() {
            debug!("intent receiver closed, coalescer stopping");
            return false;
        }
        CoalescerStatsHandle::add(&self.stats.0.intents_released, 1);
        true
    }
}
