//! Remote session management for dirmirror
//!
//! This crate owns everything between the dispatcher and the remote store:
//!
//! - **Session**: one logical connection with lazy connect, reconnect after
//!   transient failures and an unchanged-content cache
//! - **Transports**: a [`RemoteTransport`] trait with local-directory, system
//!   `ssh`, SFTP (libssh2, password capable) and in-memory implementations
//! - **Credentials**: opaque, redacted and zeroized authentication material
//!
//! # Examples
//!
//! ```rust
//! use bytes::Bytes;
//! use dirmirror_session::{Credentials, MemoryTransport, Session};
//! use dirmirror_types::RelativePath;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let transport = Arc::new(MemoryTransport::new());
//! let session = Session::new(transport.clone(), Credentials::anonymous());
//!
//! let path = RelativePath::new("docs/readme.txt")?;
//! session.put(&path, Bytes::from_static(b"hello")).await?;
//! assert_eq!(transport.file(&path), Some(Bytes::from_static(b"hello")));
//! # Ok::<(), dirmirror_types::Error>(())
//! # }).unwrap();
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod credentials;
pub mod local;
pub mod memory;
pub mod session;
pub mod sftp;
pub mod ssh;
pub mod transport;

pub use credentials::{CredentialProvider, Credentials, EnvCredentialProvider, StaticCredentials};
pub use local::LocalTransport;
pub use memory::{CallKind, MemoryTransport, TransportCall};
pub use session::{Session, SessionConfig, SessionStats};
pub use sftp::{AuthMethod, SftpTransport};
pub use ssh::{SshConfig, SshTransport};
pub use transport::RemoteTransport;
