//! Remote transport abstraction

use crate::credentials::Credentials;
use bytes::Bytes;
use dirmirror_types::{RelativePath, Result};

/// Primitive operations against one remote store
///
/// Every method returns a classified [`Error`](dirmirror_types::Error) so the
/// caller can tell transient failures from permanent ones. Implementations
/// take `&self` and are called concurrently for different paths.
#[async_trait::async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Establish (or re-establish) the connection
    async fn connect(&self, credentials: &Credentials) -> Result<()>;

    /// Replace the content at `path`, creating missing parent directories
    async fn put(&self, path: &RelativePath, content: Bytes) -> Result<()>;

    /// Remove the entry at `path` and everything below it; absent is success
    async fn remove(&self, path: &RelativePath) -> Result<()>;

    /// Create the directory at `path` and any missing parents
    async fn mkdir_all(&self, path: &RelativePath) -> Result<()>;

    /// Release the connection
    async fn close(&self) -> Result<()>;
}
