//! Configuration for the uplink engine.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uplink_protocol::{validate_key, DEFAULT_CHUNK_SIZE, MIN_CHUNK_SIZE};

/// What happens once the circuit breaker trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "OfflineRetryRepr", into = "OfflineRetryRepr")]
pub enum OfflineRetry {
    /// Stay offline for the given delay, then allow one connect attempt.
    After(Duration),
    /// Never retry; escalate to a hard reset instead.
    Disabled,
}

impl OfflineRetry {
    /// Returns the delay, or `None` when retries are disabled.
    pub fn delay(&self) -> Option<Duration> {
        match self {
            OfflineRetry::After(delay) => Some(*delay),
            OfflineRetry::Disabled => None,
        }
    }
}

impl Default for OfflineRetry {
    fn default() -> Self {
        OfflineRetry::After(Duration::from_secs(60))
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum OfflineRetryRepr {
    Seconds(f64),
    Word(String),
}

impl TryFrom<OfflineRetryRepr> for OfflineRetry {
    type Error = String;

    fn try_from(repr: OfflineRetryRepr) -> Result<Self, String> {
        match repr {
            OfflineRetryRepr::Seconds(secs) => secs::to_duration(secs).map(OfflineRetry::After),
            OfflineRetryRepr::Word(word) if word == "disabled" => Ok(OfflineRetry::Disabled),
            OfflineRetryRepr::Word(word) => Err(format!(
                "expected seconds or \"disabled\", got \"{word}\""
            )),
        }
    }
}

impl From<OfflineRetry> for OfflineRetryRepr {
    fn from(retry: OfflineRetry) -> Self {
        match retry {
            OfflineRetry::After(delay) => OfflineRetryRepr::Seconds(delay.as_secs_f64()),
            OfflineRetry::Disabled => OfflineRetryRepr::Word("disabled".to_string()),
        }
    }
}

/// Durations are written as (fractional) seconds in config files.
mod secs {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn to_duration(secs: f64) -> Result<Duration, String> {
        Duration::try_from_secs_f64(secs).map_err(|_| format!("invalid duration: {secs}"))
    }

    pub(super) fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(value.as_secs_f64())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        to_duration(secs).map_err(de::Error::custom)
    }
}

/// Configuration for an [`Uplink`](crate::Uplink).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UplinkConfig {
    /// Remote account name.
    pub account: String,
    /// Group all feeds live in.
    pub group: String,
    /// Metadata attached to every published value (e.g. a location).
    pub metadata: Option<String>,
    /// Circuit breaker cool-down, or disabled.
    pub offline_retry_delay: OfflineRetry,
    /// Counted failures before the breaker trips.
    pub max_consecutive_errors: u32,
    /// Time a rate-limit signal keeps publishing suspended.
    #[serde(with = "secs")]
    pub throttle_cooldown: Duration,
    /// Amount the minimum publish interval grows per rate-limit signal.
    #[serde(with = "secs")]
    pub throttle_step: Duration,
    /// Interval budget per published feed.
    #[serde(with = "secs")]
    pub min_interval_per_feed: Duration,
    /// Largest single value the service accepts, in bytes.
    pub chunk_size: usize,
    /// Requested interval between snapshot publishes.
    #[serde(with = "secs")]
    pub publish_interval: Duration,
    /// Interval between receive passes.
    #[serde(with = "secs")]
    pub receive_interval: Duration,
    /// Bound on one push-channel poll.
    #[serde(with = "secs")]
    pub receive_timeout: Duration,
    /// Bound on one polling-channel request.
    #[serde(with = "secs")]
    pub request_timeout: Duration,
    /// Fetch the remote wall clock after each connect.
    pub sync_time_on_connect: bool,
    /// Feed that receives forwarded warning and error records.
    pub log_feed: Option<String>,
}

impl UplinkConfig {
    /// Creates a configuration with default tuning.
    pub fn new(account: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            group: group.into(),
            metadata: None,
            offline_retry_delay: OfflineRetry::default(),
            max_consecutive_errors: 3,
            throttle_cooldown: Duration::from_secs(30),
            throttle_step: Duration::from_secs(1),
            min_interval_per_feed: Duration::from_secs(2),
            chunk_size: DEFAULT_CHUNK_SIZE,
            publish_interval: Duration::from_secs(2),
            receive_interval: Duration::from_secs(10),
            receive_timeout: Duration::from_millis(100),
            request_timeout: Duration::from_secs(30),
            sync_time_on_connect: true,
            log_feed: None,
        }
    }

    /// Loads a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(text: &str) -> SyncResult<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the metadata attached to published values.
    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    /// Sets the circuit breaker cool-down.
    pub fn with_offline_retry(mut self, retry: OfflineRetry) -> Self {
        self.offline_retry_delay = retry;
        self
    }

    /// Sets the number of counted failures that trip the breaker.
    pub fn with_max_consecutive_errors(mut self, max: u32) -> Self {
        self.max_consecutive_errors = max;
        self
    }

    /// Sets the throttle cool-down.
    pub fn with_throttle_cooldown(mut self, cooldown: Duration) -> Self {
        self.throttle_cooldown = cooldown;
        self
    }

    /// Sets the per-signal throttle step.
    pub fn with_throttle_step(mut self, step: Duration) -> Self {
        self.throttle_step = step;
        self
    }

    /// Sets the per-feed interval budget.
    pub fn with_min_interval_per_feed(mut self, per_feed: Duration) -> Self {
        self.min_interval_per_feed = per_feed;
        self
    }

    /// Sets the chunk size for long values.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    /// Sets the requested publish interval.
    pub fn with_publish_interval(mut self, interval: Duration) -> Self {
        self.publish_interval = interval;
        self
    }

    /// Sets the receive interval.
    pub fn with_receive_interval(mut self, interval: Duration) -> Self {
        self.receive_interval = interval;
        self
    }

    /// Sets the push-channel poll bound.
    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Enables or disables wall-clock sync after connect.
    pub fn with_time_sync(mut self, enabled: bool) -> Self {
        self.sync_time_on_connect = enabled;
        self
    }

    /// Sets the feed that receives forwarded log records.
    pub fn with_log_feed(mut self, key: impl Into<String>) -> Self {
        self.log_feed = Some(key.into());
        self
    }

    /// Checks the configuration for values the engine cannot run with.
    pub fn validate(&self) -> SyncResult<()> {
        let invalid = |msg: String| Err(SyncError::Config(msg));

        if self.account.is_empty() {
            return invalid("account must not be empty".into());
        }
        if let Err(e) = validate_key(&self.group) {
            return invalid(format!("group: {e}"));
        }
        if self.max_consecutive_errors == 0 {
            return invalid("max_consecutive_errors must be at least 1".into());
        }
        if self.chunk_size < MIN_CHUNK_SIZE {
            return invalid(format!("chunk_size must be at least {MIN_CHUNK_SIZE}"));
        }
        if self.receive_interval.is_zero() {
            return invalid("receive_interval must be positive".into());
        }
        if self.request_timeout.is_zero() {
            return invalid("request_timeout must be positive".into());
        }
        if let Some(feed) = &self.log_feed {
            if let Err(e) = validate_key(feed) {
                return invalid(format!("log_feed: {e}"));
            }
        }
        Ok(())
    }
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self::new("", "default")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = UplinkConfig::new("alice", "garden");
        assert_eq!(
            config.offline_retry_delay,
            OfflineRetry::After(Duration::from_secs(60))
        );
        assert_eq!(config.max_consecutive_errors, 3);
        assert_eq!(config.throttle_cooldown, Duration::from_secs(30));
        assert_eq!(config.throttle_step, Duration::from_secs(1));
        assert_eq!(config.min_interval_per_feed, Duration::from_secs(2));
        assert_eq!(config.chunk_size, 1023);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder() {
        let config = UplinkConfig::new("alice", "garden")
            .with_offline_retry(OfflineRetry::Disabled)
            .with_max_consecutive_errors(5)
            .with_chunk_size(64)
            .with_metadata("52.1,-1.2")
            .with_time_sync(false);

        assert_eq!(config.offline_retry_delay.delay(), None);
        assert_eq!(config.max_consecutive_errors, 5);
        assert_eq!(config.chunk_size, 64);
        assert_eq!(config.metadata.as_deref(), Some("52.1,-1.2"));
        assert!(!config.sync_time_on_connect);
    }

    #[test]
    fn json_with_seconds_and_disabled() {
        let config = UplinkConfig::from_json(
            r#"{"account":"alice","group":"garden","offline_retry_delay":"disabled","throttle_cooldown":12.5}"#,
        )
        .unwrap();
        assert_eq!(config.offline_retry_delay, OfflineRetry::Disabled);
        assert_eq!(config.throttle_cooldown, Duration::from_millis(12_500));
        assert_eq!(config.receive_interval, Duration::from_secs(10));

        let config = UplinkConfig::from_json(
            r#"{"account":"alice","group":"garden","offline_retry_delay":90}"#,
        )
        .unwrap();
        assert_eq!(
            config.offline_retry_delay,
            OfflineRetry::After(Duration::from_secs(90))
        );
    }

    #[test]
    fn json_rejects_bad_values() {
        assert!(UplinkConfig::from_json(r#"{"account":"a","offline_retry_delay":"never"}"#).is_err());
        assert!(UplinkConfig::from_json(r#"{"account":"a","throttle_step":-1}"#).is_err());
        assert!(UplinkConfig::from_json(r#"{"account":"a","colour":"red"}"#).is_err());
    }

    #[test]
    fn json_serialisation_is_readable() {
        let config = UplinkConfig::new("alice", "garden");
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"offline_retry_delay\":60.0"));
        let back: UplinkConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn log_feed_must_be_a_feed_key() {
        let config = UplinkConfig::new("alice", "garden").with_log_feed("device-log");
        assert!(config.validate().is_ok());
        assert!(UplinkConfig::new("alice", "garden")
            .with_log_feed("device log")
            .validate()
            .is_err());
        let config = UplinkConfig::from_json(r#"{"account":"a","log_feed":"log"}"#).unwrap();
        assert_eq!(config.log_feed.as_deref(), Some("log"));
    }

    #[test]
    fn validation() {
        assert!(UplinkConfig::new("", "garden").validate().is_err());
        assert!(UplinkConfig::new("alice", "bad group").validate().is_err());
        assert!(UplinkConfig::new("alice", "garden")
            .with_max_consecutive_errors(0)
            .validate()
            .is_err());
        assert!(UplinkConfig::new("alice", "garden")
            .with_chunk_size(2)
            .validate()
            .is_err());
    }
}
