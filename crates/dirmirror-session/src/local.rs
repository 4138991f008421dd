//! Transport writing into a directory on a local or mounted filesystem

use crate::credentials::Credentials;
use crate::transport::RemoteTransport;
use bytes::Bytes;
use dirmirror_types::{Error, RelativePath, Result};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Mirror into `root` using plain filesystem calls
///
/// Puts go through a temporary sibling file and a rename, so a reader never
/// observes a partially written file.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    root: PathBuf,
}

impl LocalTransport {
    /// Create a transport rooted at `root`
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// The mirror root
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn target(&self, path: &RelativePath) -> PathBuf {
        path.to_local(&self.root)
    }
}

/// Classify a filesystem error raised while applying an operation to `path`
fn classify(path: &RelativePath, error: &io::Error) -> Error {
    match error.kind() {
        io::ErrorKind::PermissionDenied | io::ErrorKind::InvalidInput => {
            Error::permanent(path.as_str(), error.to_string())
        }
        _ => Error::transient(path.as_str(), error.to_string()),
    }
}

async fn remove_entry(target: &Path) -> io::Result<()> {
    let metadata = match fs::symlink_metadata(target).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    let result = if metadata.is_dir() {
        fs::remove_dir_all(target).await
    } else {
        fs::remove_file(target).await
    };
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

async fn ensure_directory(target: &Path) -> io::Result<()> {
    if let Ok(metadata) = fs::symlink_metadata(target).await {
        if !metadata.is_dir() {
            // local side replaced a file with a directory
            fs::remove_file(target).await?;
        }
    }
    fs::create_dir_all(target).await
}

#[async_trait::async_trait]
impl RemoteTransport for LocalTransport {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn connect(&self, _credentials: &Credentials) -> Result<()> {
        fs::create_dir_all(&self.root).await.map_err(|e| {
            let kind = e.kind();
            let message = format!("cannot prepare mirror root '{}': {}", self.root.display(), e);
            if kind == io::ErrorKind::PermissionDenied {
                Error::permanent("", message)
            } else {
                Error::transient("", message)
            }
        })?;
        debug!("local transport ready at {}", self.root.display());
        Ok(())
    }

    async fn put(&self, path: &RelativePath, content: Bytes) -> Result<()> {
        let target = self.target(path);
        let parent = target
            .parent()
            .map_or_else(|| self.root.clone(), Path::to_path_buf);
        ensure_directory(&parent).await.map_err(|e| classify(path, &e))?;

        if fs::symlink_metadata(&target)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            // local side replaced a directory with a file
            fs::remove_dir_all(&target)
                .await
                .map_err(|e| classify(path, &e))?;
        }

        let temp = parent.join(format!(
            ".{}.{}.dirmirror-tmp",
            path.file_name(),
            uuid::Uuid::new_v4().simple()
        ));
        if let Err(e) = fs::write(&temp, &content).await {
            let _ = fs::remove_file(&temp).await;
            return Err(classify(path, &e));
        }
        if let Err(e) = fs::rename(&temp, &target).await {
            let _ = fs::remove_file(&temp).await;
            return Err(classify(path, &e));
        }

        debug!("wrote {} bytes to {}", content.len(), target.display());
        Ok(())
    }

    async fn remove(&self, path: &RelativePath) -> Result<()> {
        remove_entry(&self.target(path))
            .await
            .map_err(|e| classify(path, &e))
    }

    async fn mkdir_all(&self, path: &RelativePath) -> Result<()> {
        ensure_directory(&self.target(path))
            .await
            .map_err(|e| classify(path, &e))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
