//! Initial scan of a watched root

use crate::ignore::IgnorePolicy;
use dirmirror_types::{RawEvent, RelativePath};
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

/// Walk `root` and produce a `Created` event for every regular file not
/// excluded by `policy`, so content present before the watch started is
/// mirrored too.
///
/// Ignored directories are pruned rather than walked. Unreadable entries are
/// skipped with a debug log.
pub fn initial_scan(root: &Path, policy: &IgnorePolicy) -> Vec<RawEvent> {
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !policy.is_ignored(root, entry.path()));

    let mut events = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!("skipping unreadable entry during initial scan: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if RelativePath::from_root(root, entry.path()).is_err() {
            debug!("skipping non-mirrorable path {}", entry.path().display());
            continue;
        }
        events.push(RawEvent::created(entry.into_path()));
    }

    debug!("initial scan of {} found {} files", root.display(), events.len());
    events
}
