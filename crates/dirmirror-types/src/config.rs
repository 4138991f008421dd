//! Validated configuration values shared by the pipeline stages
//!
//! These types are constructed from the raw numbers the configuration
//! provider supplies, so an out-of-range value is rejected once at startup
//! instead of being checked again by every consumer.

use std::time::Duration;

/// Size of the dispatcher worker pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "usize", into = "usize"))]
pub struct WorkerCount(usize);

impl WorkerCount {
    /// Minimum worker count
    pub const MIN: usize = 1;
    /// Maximum worker count
    pub const MAX: usize = 64;
    /// Default worker count
    pub const DEFAULT: usize = 4;

    /// Create a new worker count with validation
    pub fn new(count: usize) -> Result<Self, String> {
        if count < Self::MIN {
            Err(format!("Worker count {} is below minimum {}", count, Self::MIN))
        } else if count > Self::MAX {
            Err(format!("Worker count {} exceeds maximum {}", count, Self::MAX))
        } else {
            Ok(Self(count))
        }
    }

    /// Get the worker count value
    pub fn get(self) -> usize {
        self.0
    }

    /// A worker count sized to the machine, never more than 8
    pub fn optimal() -> Self {
        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(Self::DEFAULT);
        Self(cpu_count.clamp(2, 8))
    }
}

impl Default for WorkerCount {
    fn default() -> Self {
        Self(Self::DEFAULT)
    }
}

impl TryFrom<usize> for WorkerCount {
    type Error = String;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<WorkerCount> for usize {
    fn from(value: WorkerCount) -> Self {
        value.0
    }
}

/// Quiet period after the last event on a path before its intent is released
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DebounceWindow(Duration);

impl DebounceWindow {
    /// Minimum window
    pub const MIN: Duration = Duration::from_millis(10);
    /// Maximum window
    pub const MAX: Duration = Duration::from_secs(60);
    /// Default window
    pub const DEFAULT: Duration = Duration::from_millis(500);

    /// Create a new debounce window with validation
    pub fn new(window: Duration) -> Result<Self, String> {
        if window < Self::MIN {
            Err(format!(
                "Debounce window {:?} is below minimum {:?}",
                window,
                Self::MIN
            ))
        } else if window > Self::MAX {
            Err(format!(
                "Debounce window {:?} exceeds maximum {:?}",
                window,
                Self::MAX
            ))
        } else {
            Ok(Self(window))
        }
    }

    /// Create a debounce window from milliseconds
    pub fn from_millis(millis: u64) -> Result<Self, String> {
        Self::new(Duration::from_millis(millis))
    }

    /// Get the window duration
    pub fn get(self) -> Duration {
        self.0
    }
}

impl Default for DebounceWindow {
    fn default() -> Self {
        Self(Self::DEFAULT)
    }
}

/// Retry configuration for remote operations
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any single delay before jitter
    pub max_delay: Duration,
    /// Relative jitter applied to every delay, in `[0, 1)`
    pub jitter: f64,
}

impl RetryConfig {
    /// Create a new retry configuration
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        jitter: f64,
    ) -> Result<Self, String> {
        if max_attempts == 0 {
            return Err("Max attempts must be at least 1".to_string());
        }
        if base_delay.is_zero() {
            return Err("Base delay must be greater than zero".to_string());
        }
        if base_delay > max_delay {
            return Err("Base delay cannot be greater than max delay".to_string());
        }
        if !(0.0..1.0).contains(&jitter) {
            return Err(format!("Jitter {} must be within [0, 1)", jitter));
        }
        Ok(Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter,
        })
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_count_bounds() {
        assert!(WorkerCount::new(0).is_err());
        assert!(WorkerCount::new(65).is_err());
        assert_eq!(WorkerCount::new(8).unwrap().get(), 8);
        assert_eq!(WorkerCount::default().get(), 4);

        let optimal = WorkerCount::optimal().get();
        assert!((2..=8).contains(&optimal));
    }

    #[test]
    fn test_debounce_window_bounds() {
        assert!(DebounceWindow::from_millis(5).is_err());
        assert!(DebounceWindow::from_millis(61_000).is_err());
        assert_eq!(
            DebounceWindow::from_millis(300).unwrap().get(),
            Duration::from_millis(300)
        );
    }

    #[test]
    fn test_retry_config_validation() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_secs(1);
        assert!(RetryConfig::new(0, base, cap, 0.1).is_err());
        assert!(RetryConfig::new(3, cap, base, 0.1).is_err());
        assert!(RetryConfig::new(3, base, cap, 1.0).is_err());
        assert!(RetryConfig::new(3, Duration::ZERO, cap, 0.0).is_err());
        assert!(RetryConfig::new(3, base, cap, 0.0).is_ok());
    }
}
