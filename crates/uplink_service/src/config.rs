//! Service configuration.

use std::time::Duration;

/// Configuration for the reference telemetry service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Account name clients must present.
    pub account: String,
    /// API key clients must present.
    pub api_key: String,
    /// Writes allowed per window.
    pub write_limit: u32,
    /// Sliding window for the write budget.
    pub write_window: Duration,
    /// Initial service time, Unix milliseconds.
    pub start_millis: i64,
    /// Maximum feeds per group.
    pub max_feeds_per_group: usize,
    /// Maximum accepted value length in bytes.
    pub max_value_len: usize,
}

impl ServiceConfig {
    /// Creates a configuration for one account.
    pub fn new(account: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            api_key: api_key.into(),
            write_limit: 30,
            write_window: Duration::from_secs(60),
            start_millis: 1_700_000_000_000,
            max_feeds_per_group: 1000,
            max_value_len: 1024,
        }
    }

    /// Sets the write budget.
    pub fn with_write_limit(mut self, limit: u32, window: Duration) -> Self {
        self.write_limit = limit;
        self.write_window = window;
        self
    }

    /// Sets the initial service time.
    pub fn with_start_millis(mut self, millis: i64) -> Self {
        self.start_millis = millis;
        self
    }

    /// Sets the per-group feed cap.
    pub fn with_max_feeds_per_group(mut self, max: usize) -> Self {
        self.max_feeds_per_group = max;
        self
    }

    /// Sets the value length cap.
    pub fn with_max_value_len(mut self, max: usize) -> Self {
        self.max_value_len = max;
        self
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::new("device", "aio_key")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServiceConfig::default();
        assert_eq!(config.write_limit, 30);
        assert_eq!(config.write_window, Duration::from_secs(60));
        assert_eq!(config.max_value_len, 1024);
    }

    #[test]
    fn config_builder() {
        let config = ServiceConfig::new("alice", "secret")
            .with_write_limit(5, Duration::from_secs(10))
            .with_max_feeds_per_group(2);

        assert_eq!(config.account, "alice");
        assert_eq!(config.write_limit, 5);
        assert_eq!(config.max_feeds_per_group, 2);
    }
}
