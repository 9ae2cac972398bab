//! Client-side tunables for the exam session core.
//!
//! Loaded from `exam-session.json`. A missing file yields validated
//! defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// Name of the client configuration file.
pub const CONFIG_FILE: &str = "exam-session.json";

/// Default seconds between heartbeats.
const fn default_heartbeat_interval() -> u64 {
    15
}

/// Default seconds between proctor message polls.
const fn default_poll_interval() -> u64 {
    5
}

/// Default capacity of the attempt event feed.
const fn default_feed_capacity() -> usize {
    64
}

const fn default_event_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 5,
        base_delay_ms: 500,
        max_delay_ms: 8_000,
    }
}

const fn default_heartbeat_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay_ms: 1_000,
        max_delay_ms: 4_000,
    }
}

const fn default_submit_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 4,
        base_delay_ms: 1_000,
        max_delay_ms: 10_000,
    }
}

/// Client configuration for one exam session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Seconds between heartbeats while an attempt is in progress.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Seconds between proctor message polls.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Retry policy for proctor event delivery.
    #[serde(default = "default_event_retry")]
    pub event_retry: RetryPolicy,

    /// Retry policy for a single heartbeat. Retries never run past the
    /// next beat.
    #[serde(default = "default_heartbeat_retry")]
    pub heartbeat_retry: RetryPolicy,

    /// Retry policy for submit calls.
    #[serde(default = "default_submit_retry")]
    pub submit_retry: RetryPolicy,

    /// Buffered notifications per subscriber on the attempt event feed.
    #[serde(default = "default_feed_capacity")]
    pub feed_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
            poll_interval_secs: default_poll_interval(),
            event_retry: default_event_retry(),
            heartbeat_retry: default_heartbeat_retry(),
            submit_retry: default_submit_retry(),
            feed_capacity: default_feed_capacity(),
        }
    }
}

impl SessionConfig {
    /// Loads `exam-session.json` from the given directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but is invalid.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        Self::load_from_file(&dir.join(CONFIG_FILE))
    }

    /// Loads configuration from a specific file path.
    ///
    /// If the file does not exist, returns the default configuration.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::ConfigParseError` if the file cannot be read or
    /// parsed, and `SessionError::ConfigValidationError` if a value is out of
    /// range.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.validate()?;
                return Ok(config);
            }
            Err(e) => {
                return Err(SessionError::config_parse(
                    path,
                    format!("failed to read file: {e}"),
                ));
            }
        };

        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| SessionError::config_parse(path, e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::ConfigValidationError` if any check fails.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_secs == 0 {
            return Err(SessionError::config_validation(
                "heartbeatIntervalSecs must be greater than 0",
                "Set heartbeatIntervalSecs to at least 1 in your exam-session.json",
            ));
        }

        if self.poll_interval_secs == 0 {
            return Err(SessionError::config_validation(
                "pollIntervalSecs must be greater than 0",
                "Set pollIntervalSecs to at least 1 in your exam-session.json",
            ));
        }

        if self.feed_capacity == 0 {
            return Err(SessionError::config_validation(
                "feedCapacity must be greater than 0",
                "Set feedCapacity to at least 1 in your exam-session.json",
            ));
        }

        self.event_retry.validate("eventRetry")?;
        self.heartbeat_retry.validate("heartbeatRetry")?;
        self.submit_retry.validate("submitRetry")?;
        Ok(())
    }

    /// Heartbeat period.
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Message poll period.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total tries, including the first.
    pub max_attempts: u32,
    /// Delay before the second try, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on any single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        default_event_retry()
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay to wait after the `failures`-th consecutive failure (1-based).
    ///
    /// ```
    /// use std::time::Duration;
    /// use exam_session::RetryPolicy;
    ///
    /// let policy = RetryPolicy { max_attempts: 5, base_delay_ms: 500, max_delay_ms: 3_000 };
    /// assert_eq!(policy.delay_for(1), Duration::from_millis(500));
    /// assert_eq!(policy.delay_for(2), Duration::from_millis(1_000));
    /// assert_eq!(policy.delay_for(4), Duration::from_millis(3_000));
    /// ```
    #[must_use]
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(20);
        let delay = self.base_delay_ms.saturating_mul(1_u64 << exponent);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    fn validate(&self, field: &str) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(SessionError::config_validation(
                format!("{field}.maxAttempts must be greater than 0"),
                format!("Set {field}.maxAttempts to at least 1 in your exam-session.json"),
            ));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(SessionError::config_validation(
                format!("{field}.maxDelayMs must not be smaller than {field}.baseDelayMs"),
                format!("Raise {field}.maxDelayMs or lower {field}.baseDelayMs"),
            ));
        }
        Ok(())
    }
}
