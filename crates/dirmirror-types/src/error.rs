//! Error types and handling for dirmirror
//!
//! Every failure in the pipeline is one of a small number of classes: a broken
//! watch subscription, a transfer that may succeed if tried again, a transfer
//! that never will, or a configuration problem detected at startup. The
//! [`Error`] type carries that classification so the retry policy and the
//! lifecycle host can act on it without string matching.

use std::io;
use std::path::PathBuf;

/// Error severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorSeverity {
    /// Low severity - operation can continue
    Low,
    /// Medium severity - operation should be retried
    Medium,
    /// High severity - operation should be abandoned
    High,
    /// Critical severity - the pipeline for this root cannot continue
    Critical,
}

/// Whether a failed remote operation is worth trying again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FailureClass {
    /// Connection loss, timeouts and similar conditions that may clear up
    Transient,
    /// The remote rejected the operation or the local source is gone
    Permanent,
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => f.write_str("transient"),
            Self::Permanent => f.write_str("permanent"),
        }
    }
}

/// Main error type for dirmirror operations
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {message}")]
    Io {
        /// Error message from the I/O operation
        message: String,
        /// Whether the underlying error kind is expected to clear up on its own
        transient: bool,
    },

    /// File not found
    #[error("File not found: {path}")]
    FileNotFound {
        /// Path to the file that was not found
        path: PathBuf,
    },

    /// Permission denied
    #[error("Permission denied: {path}")]
    PermissionDenied {
        /// Path to the file with permission issues
        path: PathBuf,
    },

    /// A path could not be expressed relative to the watched root
    #[error("Invalid path '{path}': {reason}")]
    InvalidPath {
        /// Offending path
        path: PathBuf,
        /// Why the path was rejected
        reason: String,
    },

    /// Invalid configuration, fatal at startup
    #[error("Configuration error: {message}")]
    Config {
        /// Error message describing the configuration issue
        message: String,
    },

    /// The OS-level watch subscription for a root broke
    #[error("Watch failure on '{root}': {message}")]
    WatchFailure {
        /// Watched root the subscription belonged to
        root: PathBuf,
        /// Backend error message
        message: String,
    },

    /// A remote operation failed in a way that may succeed later
    #[error("Transient transfer failure for '{path}': {message}")]
    TransientTransfer {
        /// Relative path the operation targeted
        path: String,
        /// Error message
        message: String,
    },

    /// A remote operation failed and will not succeed if repeated
    #[error("Permanent transfer failure for '{path}': {message}")]
    PermanentTransfer {
        /// Relative path the operation targeted
        path: String,
        /// Error message
        message: String,
    },

    /// Operation cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Operation timed out
    #[error("Operation timed out after {millis} ms")]
    Timeout {
        /// Number of milliseconds after which the operation timed out
        millis: u64,
    },

    /// Generic error with custom message
    #[error("{message}")]
    Other {
        /// Custom error message
        message: String,
    },
}

/// Error kind for categorizing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// I/O related errors
    Io,
    /// Configuration errors
    Config,
    /// Watch subscription errors
    Watch,
    /// Remote transfer errors
    Transfer,
    /// Cancellation
    Cancelled,
    /// Timeout
    Timeout,
    /// Other errors
    Other,
}

impl Error {
    /// Get the error kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. }
            | Self::FileNotFound { .. }
            | Self::PermissionDenied { .. }
            | Self::InvalidPath { .. } => ErrorKind::Io,
            Self::Config { .. } => ErrorKind::Config,
            Self::WatchFailure { .. } => ErrorKind::Watch,
            Self::TransientTransfer { .. } | Self::PermanentTransfer { .. } => {
                ErrorKind::Transfer
            }
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Other { .. } => ErrorKind::Other,
        }
    }

    /// Get the error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Io { transient: true, .. } => ErrorSeverity::Medium,
            Self::Io { .. } => ErrorSeverity::High,
            Self::FileNotFound { .. }
            | Self::PermissionDenied { .. }
            | Self::InvalidPath { .. } => ErrorSeverity::High,
            Self::Config { .. } | Self::WatchFailure { .. } => ErrorSeverity::Critical,
            Self::TransientTransfer { .. } | Self::Timeout { .. } => ErrorSeverity::Medium,
            Self::PermanentTransfer { .. } => ErrorSeverity::High,
            Self::Cancelled => ErrorSeverity::Low,
            Self::Other { .. } => ErrorSeverity::Medium,
        }
    }

    /// Classify the error for the retry policy
    pub fn failure_class(&self) -> FailureClass {
        match self {
            Self::Io { transient, .. } => {
                if *transient {
                    FailureClass::Transient
                } else {
                    FailureClass::Permanent
                }
            }
            Self::TransientTransfer { .. } | Self::Timeout { .. } => FailureClass::Transient,
            Self::FileNotFound { .. }
            | Self::PermissionDenied { .. }
            | Self::InvalidPath { .. }
            | Self::Config { .. }
            | Self::WatchFailure { .. }
            | Self::PermanentTransfer { .. }
            | Self::Cancelled
            | Self::Other { .. } => FailureClass::Permanent,
        }
    }

    /// Check if this error is recoverable by retrying
    pub fn is_recoverable(&self) -> bool {
        self.failure_class() == FailureClass::Transient
    }

    /// Check if this error is fatal to the whole pipeline
    pub fn is_fatal(&self) -> bool {
        self.severity() == ErrorSeverity::Critical
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a new watch failure
    pub fn watch<P: Into<PathBuf>, S: Into<String>>(root: P, message: S) -> Self {
        Self::WatchFailure {
            root: root.into(),
            message: message.into(),
        }
    }

    /// Create a new transient transfer failure
    pub fn transient<P: Into<String>, S: Into<String>>(path: P, message: S) -> Self {
        Self::TransientTransfer {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a new permanent transfer failure
    pub fn permanent<P: Into<String>, S: Into<String>>(path: P, message: S) -> Self {
        Self::PermanentTransfer {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a new invalid path error
    pub fn invalid_path<P: Into<PathBuf>, S: Into<String>>(path: P, reason: S) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a new generic error
    pub fn other<S: Into<String>>(message: S) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    /// Re-express any error as a transfer failure for `path`, keeping its class
    pub fn into_transfer(self, path: &str) -> Self {
        match self {
            Self::TransientTransfer { .. } | Self::PermanentTransfer { .. } => self,
            other => match other.failure_class() {
                FailureClass::Transient => Self::transient(path, other.to_string()),
                FailureClass::Permanent => Self::permanent(path, other.to_string()),
            },
        }
    }
}

/// Whether an I/O error kind usually indicates a condition that clears up
pub fn is_transient_io_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::AddrNotAvailable
    )
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Self::Io {
            transient: is_transient_io_kind(error.kind()),
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_recoverable_matches_failure_class(message in ".*") {
            let errors = vec![
                Error::Io { message: message.clone(), transient: true },
                Error::Io { message: message.clone(), transient: false },
                Error::config(message.clone()),
                Error::watch("/root", message.clone()),
                Error::transient("a.txt", message.clone()),
                Error::permanent("a.txt", message.clone()),
                Error::other(message.clone()),
            ];

            for error in errors {
                prop_assert_eq!(
                    error.is_recoverable(),
                    error.failure_class() == FailureClass::Transient
                );
                if error.is_recoverable() {
                    prop_assert!(error.severity() <= ErrorSeverity::Medium);
                }
            }
        }

        #[test]
        fn test_into_transfer_keeps_class(millis in 1u64..100_000u64) {
            let timeout = Error::Timeout { millis };
            let converted = timeout.into_transfer("dir/file.bin");
            prop_assert!(
                matches!(converted, Error::TransientTransfer { ref path, .. } if path == "dir/file.bin"),
                "unexpected conversion: {:?}",
                converted
            );
        }
    }

    #[test]
    fn test_error_severity_ordering() {
        assert!(ErrorSeverity::Low < ErrorSeverity::Medium);
        assert!(ErrorSeverity::Medium < ErrorSeverity::High);
        assert!(ErrorSeverity::High < ErrorSeverity::Critical);
    }

    #[test]
    fn test_io_error_conversion_classifies_kind() {
        let reset = Error::from(io::Error::new(io::ErrorKind::ConnectionReset, "peer reset"));
        assert_eq!(reset.kind(), ErrorKind::Io);
        assert_eq!(reset.failure_class(), FailureClass::Transient);
        assert!(reset.to_string().contains("peer reset"));

        let denied = Error::from(io::Error::new(io::ErrorKind::PermissionDenied, "nope"));
        assert_eq!(denied.failure_class(), FailureClass::Permanent);
        assert_eq!(denied.severity(), ErrorSeverity::High);
    }

    #[test]
    fn test_config_and_watch_errors_are_fatal() {
        assert!(Error::config("bad debounce").is_fatal());
        assert!(Error::watch("/srv", "inotify limit").is_fatal());
        assert!(!Error::transient("a", "timeout").is_fatal());
    }

    #[test]
    fn test_transfer_errors() {
        let transient = Error::transient("a.txt", "connection reset");
        assert_eq!(transient.kind(), ErrorKind::Transfer);
        assert!(transient.is_recoverable());

        let permanent = Error::permanent("a.txt", "remote rejected path");
        assert_eq!(permanent.kind(), ErrorKind::Transfer);
        assert!(!permanent.is_recoverable());
        assert!(permanent.to_string().contains("a.txt"));
    }

    #[test]
    fn test_into_transfer_on_permanent_io() {
        let error = Error::from(io::Error::new(io::ErrorKind::InvalidInput, "bad name"));
        let converted = error.into_transfer("x/y");
        assert!(matches!(converted, Error::PermanentTransfer { .. }));
    }

    #[test]
    fn test_cancelled_error() {
        let error = Error::Cancelled;
        assert_eq!(error.kind(), ErrorKind::Cancelled);
        assert_eq!(error.severity(), ErrorSeverity::Low);
        assert!(!error.is_recoverable());
    }
}
