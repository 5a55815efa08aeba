//! Policies controlling retries of a download.
//!
//! - [`RetryPolicy`]: how a session handles transient network faults
//! - [`ValidationPolicy`]: how often a task is re-downloaded after its
//!   archive fails validation or diverges from the remote source
//!
//! # Example
//!
//! ```ignore
//! use shardfetch::{RetryPolicy, ValidationPolicy};
//!
//! // Reconnect up to five times with exponential backoff
//! let retry = RetryPolicy::exponential(5);
//!
//! // Download a shard at most twice before dropping it
//! let validation = ValidationPolicy::new(2);
//! ```

use std::time::Duration;

/// Default initial delay for exponential backoff (500ms).
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 500;

/// Default maximum delay for exponential backoff (30 seconds).
pub const DEFAULT_MAX_DELAY_SECS: u64 = 30;

/// Default multiplier for exponential backoff.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Default number of connection attempts before a task gives up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default number of times a task may be downloaded before it is dropped.
pub const DEFAULT_VALIDATION_ATTEMPTS: u32 = 2;

/// How a session handles transient failures.
///
/// Attempts are counted per run of consecutive failures: an attempt that
/// stores new bytes starts the count over.
#[derive(Clone, Debug, PartialEq)]
pub enum RetryPolicy {
    /// No retries - fail immediately on error.
    None,

    /// Fixed number of attempts with constant delay between them.
    Fixed {
        /// Maximum number of attempts (including the initial attempt).
        max_attempts: u32,
        /// Delay between attempts.
        delay: Duration,
    },

    /// Exponential backoff with configurable parameters.
    ///
    /// The delay grows by `multiplier` after each failed attempt, up to
    /// `max_delay`.
    ExponentialBackoff {
        /// Maximum number of attempts (including the initial attempt).
        max_attempts: u32,
        /// Initial delay after the first failure.
        initial_delay: Duration,
        /// Maximum delay cap.
        max_delay: Duration,
        /// Multiplier applied to the delay after each failure.
        multiplier: f64,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(DEFAULT_MAX_ATTEMPTS)
    }
}

impl RetryPolicy {
    /// Creates an exponential backoff policy with default timings.
    ///
    /// # Arguments
    ///
    /// * `max_attempts` - Maximum number of attempts (including initial)
    pub fn exponential(max_attempts: u32) -> Self {
        Self::ExponentialBackoff {
            max_attempts,
            initial_delay: Duration::from_millis(DEFAULT_INITIAL_DELAY_MS),
            max_delay: Duration::from_secs(DEFAULT_MAX_DELAY_SECS),
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }

    /// Creates a fixed retry policy.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::Fixed {
            max_attempts,
            delay,
        }
    }

    /// Calculates the delay before retrying after failed attempt `attempt`.
    ///
    /// # Arguments
    ///
    /// * `attempt` - Number of consecutive failed attempts so far (1-based)
    ///
    /// # Returns
    ///
    /// The delay to wait, or `None` if the retry budget is spent.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        match self {
            Self::None => None,
            Self::Fixed {
                max_attempts,
                delay,
            } => (attempt < *max_attempts).then_some(*delay),
            Self::ExponentialBackoff {
                max_attempts,
                initial_delay,
                max_delay,
                multiplier,
            } => {
                if attempt >= *max_attempts {
                    return None;
                }
                let factor = multiplier.powi(attempt.saturating_sub(1) as i32);
                let delay_ms = initial_delay.as_millis() as f64 * factor;
                let capped = delay_ms.min(max_delay.as_millis() as f64) as u64;
                Some(Duration::from_millis(capped).min(*max_delay))
            }
        }
    }

    /// Returns the maximum number of attempts for this policy.
    pub fn max_attempts(&self) -> u32 {
        match self {
            Self::None => 1,
            Self::Fixed { max_attempts, .. } => *max_attempts,
            Self::ExponentialBackoff { max_attempts, .. } => *max_attempts,
        }
    }
}

/// How a task is treated after a validation or consistency fault.
///
/// Each fault discards the stored bytes. The task is downloaded again until
/// `max_attempts` downloads have been spent, then dropped from the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValidationPolicy {
    /// Maximum number of downloads of one task.
    pub max_attempts: u32,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_VALIDATION_ATTEMPTS)
    }
}

impl ValidationPolicy {
    /// Creates a policy allowing `max_attempts` downloads (at least one).
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// Whether another download may follow failed download number `attempt`.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_none() {
        let policy = RetryPolicy::None;
        assert_eq!(policy.max_attempts(), 1);
        assert_eq!(policy.delay_for_attempt(1), None);
    }

    #[test]
    fn test_retry_policy_fixed() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(100));
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.delay_for_attempt(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_for_attempt(2), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_for_attempt(3), None);
    }

    #[test]
    fn test_retry_policy_exponential() {
        let policy = RetryPolicy::ExponentialBackoff {
            max_attempts: 4,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        };

        assert_eq!(policy.delay_for_attempt(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_for_attempt(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay_for_attempt(3), Some(Duration::from_millis(400)));
        assert_eq!(policy.delay_for_attempt(4), None);
    }

    #[test]
    fn test_retry_policy_exponential_respects_max_delay() {
        let policy = RetryPolicy::ExponentialBackoff {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        };

        assert_eq!(policy.delay_for_attempt(8), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), DEFAULT_MAX_ATTEMPTS);
        assert_eq!(
            policy.delay_for_attempt(1),
            Some(Duration::from_millis(DEFAULT_INITIAL_DELAY_MS))
        );
    }

    #[test]
    fn test_validation_policy() {
        let policy = ValidationPolicy::new(2);
        assert!(policy.allows_retry(1));
        assert!(!policy.allows_retry(2));

        // Zero is clamped to a single download
        assert_eq!(ValidationPolicy::new(0).max_attempts, 1);
        assert!(!ValidationPolicy::new(0).allows_retry(1));
    }
}
