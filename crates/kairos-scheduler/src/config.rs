//! Scheduler configuration.

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Default fixed delay between retry attempts.
pub const DEFAULT_BACKOFF_RETRY_MILLIS: u64 = 1_000;

/// Default window after a job's expiration during which retries are allowed.
pub const DEFAULT_MAX_INTERVAL_LIMIT_TO_RETRY_MILLIS: u64 = 60_000;

/// Retry policy for the timer scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerConfig {
    /// Fixed delay before each retry attempt.
    pub backoff_retry_millis: u64,
    /// Retries stop once this long has passed since the job's expiration.
    pub max_interval_limit_to_retry_millis: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            backoff_retry_millis: DEFAULT_BACKOFF_RETRY_MILLIS,
            max_interval_limit_to_retry_millis: DEFAULT_MAX_INTERVAL_LIMIT_TO_RETRY_MILLIS,
        }
    }
}

impl SchedulerConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the retry backoff.
    pub fn with_backoff_retry_millis(mut self, millis: u64) -> Self {
        self.backoff_retry_millis = millis;
        self
    }

    /// Set the retry window.
    pub fn with_max_interval_limit_to_retry_millis(mut self, millis: u64) -> Self {
        self.max_interval_limit_to_retry_millis = millis;
        self
    }

    pub(crate) fn backoff_retry(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.backoff_retry_millis)
    }

    pub(crate) fn max_retry_window(&self) -> Duration {
        let millis = i64::try_from(self.max_interval_limit_to_retry_millis).unwrap_or(i64::MAX);
        Duration::milliseconds(millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.backoff_retry_millis, 1_000);
        assert_eq!(config.max_interval_limit_to_retry_millis, 60_000);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: SchedulerConfig =
            serde_json::from_str(r#"{"backoffRetryMillis": 250}"#).unwrap();
        assert_eq!(config.backoff_retry_millis, 250);
        assert_eq!(config.max_interval_limit_to_retry_millis, 60_000);
    }
}
