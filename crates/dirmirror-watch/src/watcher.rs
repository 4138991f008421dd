//! Watcher adapter over OS filesystem notifications
//!
//! A [`WatchSubscription`] owns a recursive `notify` watch on one root. The
//! backend callback feeds a forwarding thread that maps notify events onto
//! [`RawEvent`]s, applies the [`IgnorePolicy`], arms watches on directories
//! created after startup and pushes the result into a bounded channel. The
//! subscription is consumed as a [`Stream`] of [`WatchSignal`]s.

use crate::ignore::IgnorePolicy;
use dirmirror_types::{Error, RawEvent, RawEventKind, Result};
use futures::Stream;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{mpsc as std_mpsc, Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// One item of a watch subscription
#[derive(Debug, Clone, PartialEq)]
pub enum WatchSignal {
    /// A filesystem change below the root
    Event(RawEvent),
    /// The OS watch broke; no further signals follow
    Failure(Error),
}

/// A recursive watch on one root directory
///
/// Dropping the subscription, or calling [`close`](Self::close), releases the
/// OS watch resources.
pub struct WatchSubscription {
    root: PathBuf,
    receiver: mpsc::Receiver<WatchSignal>,
    watcher: Option<Arc<Mutex<RecommendedWatcher>>>,
}

impl std::fmt::Debug for WatchSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchSubscription")
            .field("root", &self.root)
            .field("open", &self.watcher.is_some())
            .finish()
    }
}

impl WatchSubscription {
    /// Start watching `root` recursively
    ///
    /// `root` must be an existing directory. At most `capacity` signals are
    /// buffered before the backend thread blocks.
    pub fn subscribe(root: &Path, policy: IgnorePolicy, capacity: usize) -> Result<Self> {
        let root = canonical_root(root)?;

        let (raw_tx, raw_rx) = std_mpsc::channel::<notify::Result<Event>>();
        let watcher = Arc::new(Mutex::new(build_notify_watcher(&root, raw_tx)?));
        lock_or_recover(&watcher)
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| Error::watch(&root, e.to_string()))?;

        let (tx, receiver) = mpsc::channel(capacity.max(1));
        let forwarder = Forwarder {
            root: root.clone(),
            policy,
            watcher: Arc::downgrade(&watcher),
            tracked: HashSet::new(),
            tx,
        };
        std::thread::Builder::new()
            .name("dirmirror-watch".to_string())
            .spawn(move || forwarder.run(&raw_rx))
            .map_err(|e| Error::watch(&root, format!("failed to spawn forwarder: {}", e)))?;

        info!("Watching {}", root.display());
        Ok(Self {
            root,
            receiver,
            watcher: Some(watcher),
        })
    }

    /// The canonical watched root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Wait for the next signal; `None` once the subscription has ended
    pub async fn next_signal(&mut self) -> Option<WatchSignal> {
        self.receiver.recv().await
    }

    /// Release the OS watch; buffered signals can still be drained
    pub fn close(&mut self) {
        if self.watcher.take().is_some() {
            debug!("Closed watch on {}", self.root.display());
        }
        self.receiver.close();
    }
}

impl Stream for WatchSubscription {
    type Item = WatchSignal;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

fn canonical_root(root: &Path) -> Result<PathBuf> {
    let metadata = std::fs::metadata(root).map_err(|e| {
        Error::config(format!("watch root '{}' is not accessible: {}", root.display(), e))
    })?;
    if !metadata.is_dir() {
        return Err(Error::config(format!(
            "watch root '{}' is not a directory",
            root.display()
        )));
    }
    root.canonicalize().map_err(|e| {
        Error::config(format!("cannot canonicalize '{}': {}", root.display(), e))
    })
}

fn build_notify_watcher(
    root: &Path,
    event_tx: std_mpsc::Sender<notify::Result<Event>>,
) -> Result<RecommendedWatcher> {
    notify::recommended_watcher(move |event| {
        if event_tx.send(event).is_err() {
            debug!("watch event dropped because forwarder is gone");
        }
    })
    .map_err(|e| Error::watch(root, format!("watch backend error: {}", e)))
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Whether `event` removed or renamed away the watched root itself
fn root_lost(root: &Path, event: &Event) -> bool {
    let detaching = matches!(
        event.kind,
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_))
    );
    detaching && !root.is_dir()
}

struct Forwarder {
    root: PathBuf,
    policy: IgnorePolicy,
    watcher: Weak<Mutex<RecommendedWatcher>>,
    tracked: HashSet<PathBuf>,
    tx: mpsc::Sender<WatchSignal>,
}

impl Forwarder {
    fn run(mut self, raw_rx: &std_mpsc::Receiver<notify::Result<Event>>) {
        while let Ok(result) = raw_rx.recv() {
            match result {
                Ok(event) if root_lost(&self.root, &event) => {
                    error!("Watch root {} was removed", self.root.display());
                    let failure = Error::watch(&self.root, "watch root removed");
                    let _ = self.tx.blocking_send(WatchSignal::Failure(failure));
                    return;
                }
                Ok(event) => {
                    for raw in self.handle(event) {
                        if self.tx.blocking_send(WatchSignal::Event(raw)).is_err() {
                            debug!("watch subscription dropped, forwarder exiting");
                            return;
                        }
                    }
                }
                Err(e) => {
                    error!("Watch on {} failed: {}", self.root.display(), e);
                    let failure = Error::watch(&self.root, e.to_string());
                    let _ = self.tx.blocking_send(WatchSignal::Failure(failure));
                    return;
                }
            }
        }
        debug!("watch backend closed for {}", self.root.display());
    }

    fn handle(&mut self, event: Event) -> Vec<RawEvent> {
        let mut out = Vec::new();
        for raw in map_notify_event(event) {
            let Some(raw) = self.filter(raw) else {
                continue;
            };

            match raw.kind {
                RawEventKind::Created | RawEventKind::Renamed { .. } if raw.path.is_dir() => {
                    let dir = raw.path.clone();
                    out.push(raw);
                    self.track_directory(&dir, &mut out);
                }
                RawEventKind::Removed => {
                    self.untrack_directory(&raw.path);
                    out.push(raw);
                }
                _ => out.push(raw),
            }
        }
        out
    }

    fn filter(&self, raw: RawEvent) -> Option<RawEvent> {
        let ignored = |path: &Path| self.policy.is_ignored(&self.root, path);
        let RawEventKind::Renamed { from } = &raw.kind else {
            return (!ignored(&raw.path)).then_some(raw);
        };
        let from = from.clone();

        // a rename across the ignore boundary degrades to a one-sided change
        match (ignored(&from), ignored(&raw.path)) {
            (false, false) => Some(raw),
            (true, false) => Some(RawEvent {
                kind: RawEventKind::Created,
                ..raw
            }),
            (false, true) => Some(RawEvent {
                path: from,
                kind: RawEventKind::Removed,
                observed_at: raw.observed_at,
            }),
            (true, true) => None,
        }
    }

    /// Arm a watch on a directory that appeared after startup and report the
    /// files written into it before the watch was armed.
    fn track_directory(&mut self, dir: &Path, out: &mut Vec<RawEvent>) {
        if let Some(watcher) = self.watcher.upgrade() {
            if let Err(e) = lock_or_recover(&watcher).watch(dir, RecursiveMode::Recursive) {
                warn!("Failed to watch new directory {}: {}", dir.display(), e);
            }
        }
        self.tracked.insert(dir.to_path_buf());

        let walker = WalkDir::new(dir)
            .min_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| !self.policy.is_ignored(&self.root, entry.path()));
        let mut found = 0usize;
        for entry in walker.filter_map(std::result::Result::ok) {
            if entry.file_type().is_file() {
                out.push(RawEvent::created(entry.into_path()));
                found += 1;
            }
        }
        debug!("tracking {} ({} files caught up)", dir.display(), found);
    }

    fn untrack_directory(&mut self, path: &Path) {
        let removed: Vec<PathBuf> = self
            .tracked
            .iter()
            .filter(|dir| dir.starts_with(path))
            .cloned()
            .collect();
        if removed.is_empty() {
            return;
        }

        let watcher = self.watcher.upgrade();
        for dir in removed {
            if let Some(watcher) = &watcher {
                // the backend may already have dropped the watch with the directory
                let _ = lock_or_recover(watcher).unwatch(&dir);
            }
            self.tracked.remove(&dir);
            debug!("stopped tracking {}", dir.display());
        }
    }
}

/// Map one notify event onto raw events; access notifications are dropped
pub(crate) fn map_notify_event(event: Event) -> Vec<RawEvent> {
    let Event { kind, paths, .. } = event;
    if let EventKind::Modify(ModifyKind::Name(mode)) = kind {
        return map_rename_notify_event(paths, mode);
    }

    let Some(kind) = map_notify_kind(kind) else {
        return Vec::new();
    };

    paths
        .into_iter()
        .map(|path| RawEvent::new(path, kind.clone()))
        .collect()
}

fn map_notify_kind(kind: EventKind) -> Option<RawEventKind> {
    match kind {
        EventKind::Create(_) => Some(RawEventKind::Created),
        EventKind::Modify(_) => Some(RawEventKind::Modified),
        EventKind::Remove(_) => Some(RawEventKind::Removed),
        _ => None,
    }
}

fn map_rename_notify_event(paths: Vec<PathBuf>, mode: RenameMode) -> Vec<RawEvent> {
    match mode {
        RenameMode::Both => match (paths.first(), paths.get(1)) {
            (Some(from), Some(to)) => vec![RawEvent::renamed(from.clone(), to.clone())],
            (Some(only), None) => vec![RawEvent::new(only.clone(), existence_kind(only))],
            _ => Vec::new(),
        },
        RenameMode::From => paths.into_iter().map(RawEvent::removed).collect(),
        RenameMode::To => paths.into_iter().map(RawEvent::created).collect(),
        RenameMode::Any | RenameMode::Other => paths
            .into_iter()
            .map(|path| {
                let kind = existence_kind(&path);
                RawEvent::new(path, kind)
            })
            .collect(),
    }
}

fn existence_kind(path: &Path) -> RawEventKind {
    if std::fs::symlink_metadata(path).is_ok() {
        RawEventKind::Created
    } else {
        RawEventKind::Removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use notify::event::{AccessKind, CreateKind, DataChange, RemoveKind};
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        let mut event = Event::new(kind);
        for path in paths {
            event = event.add_path(PathBuf::from(path));
        }
        event
    }

    fn kinds(events: &[RawEvent]) -> Vec<(PathBuf, RawEventKind)> {
        events
            .iter()
            .map(|e| (e.path.clone(), e.kind.clone()))
            .collect()
    }

    #[test]
    fn test_map_basic_kinds() {
        let created = map_notify_event(event(EventKind::Create(CreateKind::File), &["/r/a"]));
        assert_eq!(kinds(&created), vec![(PathBuf::from("/r/a"), RawEventKind::Created)]);

        let modified = map_notify_event(event(
            EventKind::Modify(ModifyKind::Data(DataChange::Content)),
            &["/r/a"],
        ));
        assert_eq!(modified[0].kind, RawEventKind::Modified);

        let removed = map_notify_event(event(EventKind::Remove(RemoveKind::File), &["/r/a"]));
        assert_eq!(removed[0].kind, RawEventKind::Removed);

        let access = map_notify_event(event(EventKind::Access(AccessKind::Any), &["/r/a"]));
        assert!(access.is_empty());
    }

    #[test]
    fn test_map_rename_modes() {
        let both = map_notify_event(event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/r/old", "/r/new"],
        ));
        assert_eq!(
            kinds(&both),
            vec![(
                PathBuf::from("/r/new"),
                RawEventKind::Renamed {
                    from: PathBuf::from("/r/old")
                }
            )]
        );

        let from = map_notify_event(event(
            EventKind::Modify(ModifyKind::Name(RenameMode::From)),
            &["/r/old"],
        ));
        assert_eq!(from[0].kind, RawEventKind::Removed);

        let to = map_notify_event(event(
            EventKind::Modify(ModifyKind::Name(RenameMode::To)),
            &["/r/new"],
        ));
        assert_eq!(to[0].kind, RawEventKind::Created);
    }

    #[test]
    fn test_ambiguous_rename_uses_existence() {
        let dir = TempDir::new().unwrap();
        let present = dir.path().join("here");
        fs::write(&present, "x").unwrap();
        let absent = dir.path().join("gone");

        let events = map_notify_event(
            Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Any)))
                .add_path(present.clone())
                .add_path(absent.clone()),
        );
        assert_eq!(
            kinds(&events),
            vec![(present, RawEventKind::Created), (absent, RawEventKind::Removed)]
        );
    }

    #[test]
    fn test_subscribe_rejects_bad_roots() {
        let dir = TempDir::new().unwrap();
        let missing = WatchSubscription::subscribe(
            &dir.path().join("missing"),
            IgnorePolicy::default(),
            16,
        )
        .unwrap_err();
        assert!(missing.is_fatal());

        let file = dir.path().join("file");
        fs::write(&file, "x").unwrap();
        assert!(WatchSubscription::subscribe(&file, IgnorePolicy::default(), 16).is_err());
    }

    async fn wait_for(subscription: &mut WatchSubscription, name: &str) -> Vec<RawEvent> {
        let mut seen = Vec::new();
        let result = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(signal) = subscription.next().await {
                if let WatchSignal::Event(event) = signal {
                    let hit = event.path.file_name().is_some_and(|n| n == name);
                    seen.push(event);
                    if hit {
                        return;
                    }
                }
            }
        })
        .await;
        assert!(result.is_ok(), "no event for {} within timeout", name);
        seen
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reports_file_creation() {
        let dir = TempDir::new().unwrap();
        let mut subscription =
            WatchSubscription::subscribe(dir.path(), IgnorePolicy::default(), 64).unwrap();

        fs::write(dir.path().join("a.txt"), "hi").unwrap();
        let seen = wait_for(&mut subscription, "a.txt").await;
        let root = subscription.root().to_path_buf();
        assert!(seen.iter().any(|e| e.path == root.join("a.txt")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ignored_paths_are_not_emitted() {
        let dir = TempDir::new().unwrap();
        let policy = IgnorePolicy::new(&["*.swp"], false).unwrap();
        let mut subscription = WatchSubscription::subscribe(dir.path(), policy, 64).unwrap();

        fs::write(dir.path().join("a.txt.swp"), "swap").unwrap();
        fs::write(dir.path().join("keep.txt"), "data").unwrap();
        let seen = wait_for(&mut subscription, "keep.txt").await;
        assert!(seen
            .iter()
            .all(|e| e.path.extension().map_or(true, |ext| ext != "swp")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_new_directory_contents_are_reported() {
        let dir = TempDir::new().unwrap();
        let mut subscription =
            WatchSubscription::subscribe(dir.path(), IgnorePolicy::default(), 64).unwrap();

        let nested = dir.path().join("new/inner");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("early.txt"), "x").unwrap();

        let seen = wait_for(&mut subscription, "early.txt").await;
        assert!(seen
            .iter()
            .any(|e| e.path.ends_with("new/inner/early.txt")));
    }

    #[test]
    fn test_root_lost_only_when_root_is_gone() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("watched");
        fs::create_dir(&root).unwrap();

        let removed = event(
            EventKind::Remove(RemoveKind::Folder),
            &[root.to_str().unwrap()],
        );
        assert!(!root_lost(&root, &removed));

        fs::remove_dir(&root).unwrap();
        assert!(root_lost(&root, &removed));
        let renamed = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::From)),
            &[root.to_str().unwrap()],
        );
        assert!(root_lost(&root, &renamed));
        let created = event(
            EventKind::Create(CreateKind::File),
            &[root.join("a").to_str().unwrap()],
        );
        assert!(!root_lost(&root, &created));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_removed_root_ends_with_failure() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("watched");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("sub/a.txt"), "x").unwrap();
        let mut subscription =
            WatchSubscription::subscribe(&root, IgnorePolicy::default(), 64).unwrap();

        fs::remove_dir_all(&root).unwrap();
        let failure = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(signal) = subscription.next().await {
                if let WatchSignal::Failure(error) = signal {
                    return Some(error);
                }
            }
            None
        })
        .await
        .unwrap()
        .expect("failure signal");

        assert!(failure.is_fatal());
        assert!(failure.to_string().contains("watch root removed"));
        assert!(subscription.next_signal().await.is_none());
    }

    #[tokio::test]
    async fn test_close_ends_stream() {
        let dir = TempDir::new().unwrap();
        let mut subscription =
            WatchSubscription::subscribe(dir.path(), IgnorePolicy::default(), 4).unwrap();
        subscription.close();

        let next = tokio::time::timeout(Duration::from_secs(5), subscription.next_signal())
            .await
            .unwrap();
        assert!(next.is_none());
    }
}
