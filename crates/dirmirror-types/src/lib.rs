//! Core type system and error handling for dirmirror
//!
//! This crate provides the foundational types shared by every stage of the
//! mirror pipeline. It includes:
//!
//! - **Error handling**: a classified error taxonomy with severity levels
//! - **Core types**: relative paths, raw events, intents and operation records
//! - **Retry policy**: pure backoff arithmetic consulted after failures
//! - **Configuration**: validated value types for worker counts and windows
//!
//! # Features
//!
//! - `serde` (default): Enable serialization support
//!
//! # Examples
//!
//! ```rust
//! use dirmirror_types::{FailureClass, RetryDecision, RetryPolicy};
//!
//! let policy = RetryPolicy::default();
//! assert!(policy.decide(1, FailureClass::Transient).is_retry());
//! assert_eq!(policy.decide(1, FailureClass::Permanent), RetryDecision::DeadLetter);
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod result;
pub mod retry;
pub mod traits;
pub mod types;

// Re-export commonly used types
pub use config::{DebounceWindow, RetryConfig, WorkerCount};
pub use error::{is_transient_io_kind, Error, ErrorKind, ErrorSeverity, FailureClass};
pub use result::Result;
pub use retry::{RetryDecision, RetryPolicy, MIN_RETRY_DELAY};
pub use traits::*;
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_severity() {
        let io_error = Error::from(std::io::Error::new(std::io::ErrorKind::TimedOut, "test"));
        assert_eq!(io_error.severity(), ErrorSeverity::Medium);

        let config_error = Error::config("invalid config");
        assert_eq!(config_error.severity(), ErrorSeverity::Critical);
        assert!(!config_error.is_recoverable());
    }

    #[test]
    fn test_default_policy_matches_default_config() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 5);
        assert_eq!(policy.config(), &RetryConfig::default());
    }
}
