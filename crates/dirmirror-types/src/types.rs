//! Core data types for dirmirror
//!
//! This module provides the data model shared by every pipeline stage: the
//! per-path key, raw filesystem events, coalesced intents, operation states
//! and the records handed to observability sinks.

use crate::error::Error;
use chrono::{DateTime, Utc};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Unique identifier for operations
pub type OperationId = uuid::Uuid;

/// A path relative to the watched root
///
/// Always `/`-separated UTF-8, never empty, never containing `.` or `..`
/// components and never starting with `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "String", into = "String"))]
pub struct RelativePath(String);

impl RelativePath {
    /// Parse a `/`-separated relative path
    pub fn new<S: AsRef<str>>(value: S) -> Result<Self, Error> {
        let value = value.as_ref();
        if value.is_empty() {
            return Err(Error::invalid_path(value, "path is empty"));
        }
        if value.starts_with('/') {
            return Err(Error::invalid_path(value, "path must not be absolute"));
        }

        let mut normalized = String::with_capacity(value.len());
        for component in value.split('/') {
            match component {
                "" => continue,
                "." | ".." => {
                    return Err(Error::invalid_path(
                        value,
                        format!("component '{}' is not allowed", component),
                    ))
                }
                name => {
                    if !normalized.is_empty() {
                        normalized.push('/');
                    }
                    normalized.push_str(name);
                }
            }
        }

        if normalized.is_empty() {
            return Err(Error::invalid_path(value, "path is empty"));
        }
        Ok(Self(normalized))
    }

    /// Express an absolute path relative to `root`
    ///
    /// Fails for the root itself, for paths outside the root, and for
    /// components that are not valid UTF-8.
    pub fn from_root(root: &Path, path: &Path) -> Result<Self, Error> {
        let relative = path
            .strip_prefix(root)
            .map_err(|_| Error::invalid_path(path, "path is outside the watched root"))?;

        let mut normalized = String::new();
        for component in relative.components() {
            match component {
                Component::Normal(name) => {
                    let name = name
                        .to_str()
                        .ok_or_else(|| Error::invalid_path(path, "path is not valid UTF-8"))?;
                    if !normalized.is_empty() {
                        normalized.push('/');
                    }
                    normalized.push_str(name);
                }
                Component::CurDir => {}
                _ => {
                    return Err(Error::invalid_path(
                        path,
                        "path escapes the watched root",
                    ))
                }
            }
        }

        if normalized.is_empty() {
            return Err(Error::invalid_path(path, "path is the watched root itself"));
        }
        Ok(Self(normalized))
    }

    /// The normalized string form
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resolve against a root directory
    pub fn to_local(&self, root: &Path) -> PathBuf {
        self.components().fold(root.to_path_buf(), |acc, c| acc.join(c))
    }

    /// Iterate over the path components
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// The parent directory, `None` for a top-level entry
    pub fn parent(&self) -> Option<Self> {
        self.0
            .rsplit_once('/')
            .map(|(parent, _)| Self(parent.to_string()))
    }

    /// The final component
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Number of components
    pub fn depth(&self) -> usize {
        self.components().count()
    }

    /// Whether `other` lies strictly below this path
    pub fn is_ancestor_of(&self, other: &Self) -> bool {
        other.0.len() > self.0.len()
            && other.0.starts_with(&self.0)
            && other.0.as_bytes()[self.0.len()] == b'/'
    }
}

impl fmt::Display for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RelativePath {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for RelativePath {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RelativePath> for String {
    fn from(value: RelativePath) -> Self {
        value.0
    }
}

impl AsRef<str> for RelativePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Kind of a raw filesystem notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEventKind {
    /// A file or directory appeared
    Created,
    /// Content or metadata changed
    Modified,
    /// A file or directory disappeared
    Removed,
    /// The entry moved here from `from`
    Renamed {
        /// Absolute path the entry was moved from
        from: PathBuf,
    },
}

/// A filesystem notification as reported by the OS layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    /// Absolute path of the affected entry
    pub path: PathBuf,
    /// What happened
    pub kind: RawEventKind,
    /// When the watcher observed it
    pub observed_at: SystemTime,
}

impl RawEvent {
    /// Create an event observed now
    pub fn new<P: Into<PathBuf>>(path: P, kind: RawEventKind) -> Self {
        Self {
            path: path.into(),
            kind,
            observed_at: SystemTime::now(),
        }
    }

    /// Shorthand for a `Created` event
    pub fn created<P: Into<PathBuf>>(path: P) -> Self {
        Self::new(path, RawEventKind::Created)
    }

    /// Shorthand for a `Modified` event
    pub fn modified<P: Into<PathBuf>>(path: P) -> Self {
        Self::new(path, RawEventKind::Modified)
    }

    /// Shorthand for a `Removed` event
    pub fn removed<P: Into<PathBuf>>(path: P) -> Self {
        Self::new(path, RawEventKind::Removed)
    }

    /// Shorthand for a `Renamed` event
    pub fn renamed<P: Into<PathBuf>, F: Into<PathBuf>>(from: F, to: P) -> Self {
        Self::new(to, RawEventKind::Renamed { from: from.into() })
    }
}

/// Remote mutation an intent asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum IntentOp {
    /// Make the remote copy match the local entry
    Upload,
    /// Remove the remote copy
    Delete,
}

impl fmt::Display for IntentOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upload => f.write_str("upload"),
            Self::Delete => f.write_str("delete"),
        }
    }
}

/// The net remote mutation for one path
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Intent {
    /// Path the intent applies to
    pub path: RelativePath,
    /// Mutation to perform
    pub op: IntentOp,
    /// The intent this one replaced, one level deep
    pub supersedes: Option<Box<Intent>>,
}

impl Intent {
    /// Create an intent with no history
    pub fn new(path: RelativePath, op: IntentOp) -> Self {
        Self {
            path,
            op,
            supersedes: None,
        }
    }

    /// Create an upload intent
    pub fn upload(path: RelativePath) -> Self {
        Self::new(path, IntentOp::Upload)
    }

    /// Create a delete intent
    pub fn delete(path: RelativePath) -> Self {
        Self::new(path, IntentOp::Delete)
    }

    /// Record `previous` as the intent this one replaced
    pub fn superseding(mut self, mut previous: Intent) -> Self {
        previous.supersedes = None;
        self.supersedes = Some(Box::new(previous));
        self
    }

    /// The replaced intent, if any
    pub fn superseded(&self) -> Option<&Intent> {
        self.supersedes.as_deref()
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.op, self.path)
    }
}

/// State of the connection to the remote store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ConnectionState {
    /// No connection
    #[default]
    Disconnected,
    /// Connection attempt in progress
    Connecting,
    /// Connected and usable
    Ready,
    /// The last operation failed transiently
    Degraded,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
        };
        f.write_str(name)
    }
}

/// Lifecycle state of a pending remote operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum OperationState {
    /// Waiting for a worker
    Queued,
    /// Being executed by a worker
    InFlight,
    /// Waiting out a backoff delay
    Retrying,
    /// Given up on
    DeadLettered,
}

/// Terminal or intermediate outcome reported for an operation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum OperationOutcome {
    /// The remote store accepted the mutation
    Completed,
    /// The attempt failed and another one is scheduled
    Retried,
    /// The operation was abandoned
    DeadLettered,
}

impl fmt::Display for OperationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::Retried => f.write_str("retried"),
            Self::DeadLettered => f.write_str("dead-lettered"),
        }
    }
}

/// Observability record emitted for every operation attempt outcome
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct OperationEvent {
    /// Operation identifier, stable across retries
    pub operation_id: OperationId,
    /// Path the operation targets
    pub path: RelativePath,
    /// Mutation performed
    pub operation: IntentOp,
    /// What happened
    pub outcome: OperationOutcome,
    /// Attempts made so far, including this one
    pub attempts: u32,
    /// Duration of this attempt
    pub latency: Duration,
    /// Failure of this attempt, if any
    pub error: Option<Error>,
    /// When the outcome was recorded
    pub timestamp: DateTime<Utc>,
}

/// An operation that will not be retried
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeadLetter {
    /// Operation identifier
    pub operation_id: OperationId,
    /// The intent that could not be applied
    pub intent: Intent,
    /// Attempts made
    pub attempts: u32,
    /// The last failure
    pub error: Error,
    /// When the operation was abandoned
    pub failed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("a.txt", "a.txt")]
    #[case("dir/a.txt", "dir/a.txt")]
    #[case("dir//a.txt", "dir/a.txt")]
    #[case("dir/sub/", "dir/sub")]
    fn test_relative_path_normalizes(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(RelativePath::new(input).unwrap().as_str(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("/abs")]
    #[case("a/../b")]
    #[case("./a")]
    #[case("//")]
    fn test_relative_path_rejects(#[case] input: &str) {
        assert!(RelativePath::new(input).is_err());
    }

    #[test]
    fn test_relative_path_from_root() {
        let root = Path::new("/srv/watch");
        let path = RelativePath::from_root(root, Path::new("/srv/watch/docs/a.md")).unwrap();
        assert_eq!(path.as_str(), "docs/a.md");
        assert_eq!(path.to_local(root), PathBuf::from("/srv/watch/docs/a.md"));

        assert!(RelativePath::from_root(root, Path::new("/srv/other/a.md")).is_err());
        assert!(RelativePath::from_root(root, Path::new("/srv/watch")).is_err());
        assert!(RelativePath::from_root(root, Path::new("/srv/watch/../x")).is_err());
    }

    #[test]
    fn test_relative_path_navigation() {
        let path = RelativePath::new("a/b/c.txt").unwrap();
        assert_eq!(path.file_name(), "c.txt");
        assert_eq!(path.depth(), 3);
        assert_eq!(path.parent().unwrap().as_str(), "a/b");
        assert!(RelativePath::new("top").unwrap().parent().is_none());

        let dir = RelativePath::new("a/b").unwrap();
        assert!(dir.is_ancestor_of(&path));
        assert!(!path.is_ancestor_of(&dir));
        assert!(!RelativePath::new("a/bc").unwrap().is_ancestor_of(&path));
        assert!(!dir.is_ancestor_of(&dir));
    }

    #[test]
    fn test_superseding_keeps_one_level() {
        let path = RelativePath::new("x").unwrap();
        let first = Intent::upload(path.clone());
        let second = Intent::delete(path.clone()).superseding(first.clone());
        let third = Intent::upload(path).superseding(second.clone());

        assert_eq!(third.superseded().unwrap().op, IntentOp::Delete);
        assert!(third.superseded().unwrap().superseded().is_none());
        assert_eq!(second.superseded(), Some(&first));
    }

    #[test]
    fn test_intent_display() {
        let intent = Intent::delete(RelativePath::new("d/e").unwrap());
        assert_eq!(intent.to_string(), "delete(d/e)");
    }
}
