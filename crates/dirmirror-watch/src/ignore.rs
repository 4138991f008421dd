//! Ignore policy for watched paths

use dirmirror_types::{Error, RelativePath, Result};
use glob::{MatchOptions, Pattern};
use std::path::{Path, PathBuf};

/// Decides which paths below a watched root are never mirrored
#[derive(Debug, Clone, Default)]
pub struct IgnorePolicy {
    patterns: Vec<Pattern>,
    ignore_hidden: bool,
    excluded: Vec<PathBuf>,
}

impl IgnorePolicy {
    /// Compile `patterns`; an invalid glob is a configuration error
    pub fn new<S: AsRef<str>>(patterns: &[S], ignore_hidden: bool) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Pattern::new(p.as_ref()).map_err(|e| {
                    Error::config(format!("invalid ignore pattern '{}': {}", p.as_ref(), e))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            patterns,
            ignore_hidden,
            excluded: Vec::new(),
        })
    }

    /// Drop every event under `subtree`, an absolute path
    pub fn exclude_subtree<P: Into<PathBuf>>(mut self, subtree: P) -> Self {
        self.excluded.push(subtree.into());
        self
    }

    /// Excluded subtrees
    pub fn excluded(&self) -> &[PathBuf] {
        &self.excluded
    }

    /// Whether an absolute path lies in an excluded subtree
    pub fn is_excluded(&self, path: &Path) -> bool {
        self.excluded.iter().any(|subtree| path.starts_with(subtree))
    }

    /// Whether a path relative to the watched root is ignored
    pub fn is_ignored_relative(&self, path: &RelativePath) -> bool {
        if self.ignore_hidden && path.components().any(|c| c.starts_with('.')) {
            return true;
        }

        let options = MatchOptions {
            require_literal_separator: true,
            ..MatchOptions::new()
        };
        self.patterns.iter().any(|pattern| {
            pattern.matches_with(path.as_str(), options)
                || path.components().any(|c| pattern.matches(c))
        })
    }

    /// Whether an absolute path below `root` is ignored
    ///
    /// Paths outside the root are not the policy's concern and are reported
    /// as not ignored.
    pub fn is_ignored(&self, root: &Path, path: &Path) -> bool {
        if self.is_excluded(path) {
            return true;
        }
        RelativePath::from_root(root, path).map_or(false, |relative| self.is_ignored_relative(&relative))
    }
}
