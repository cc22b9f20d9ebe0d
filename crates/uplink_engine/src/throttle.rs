//! Publish rate control.

use crate::config::UplinkConfig;
use std::time::Duration;
use tracing::{debug, info};

/// Snapshot of the throttle controller for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleState {
    /// Publishing is suspended.
    pub throttled: bool,
    /// Minimum interval between accepted publishes.
    pub minimum_interval: Duration,
    /// When the current suspension started.
    pub throttled_since: Option<Duration>,
}

/// Enforces the minimum publish interval and rate-limit suspensions.
///
/// All times are monotonic clock readings.
#[derive(Debug, Clone)]
pub struct ThrottleController {
    base_interval: Duration,
    minimum_interval: Duration,
    throttled: bool,
    throttled_since: Option<Duration>,
    last_publish: Option<Duration>,
    cooldown: Duration,
    step: Duration,
    per_feed: Duration,
    rate_limited: u64,
}

impl ThrottleController {
    /// Creates a controller.
    pub fn new(interval: Duration, cooldown: Duration, step: Duration, per_feed: Duration) -> Self {
        Self {
            base_interval: interval,
            minimum_interval: interval,
            throttled: false,
            throttled_since: None,
            last_publish: None,
            cooldown,
            step,
            per_feed,
            rate_limited: 0,
        }
    }

    /// Creates a controller from the engine configuration.
    pub fn from_config(config: &UplinkConfig) -> Self {
        Self::new(
            config.publish_interval,
            config.throttle_cooldown,
            config.throttle_step,
            config.min_interval_per_feed,
        )
    }

    /// Returns true if a publish may be attempted now.
    pub fn may_publish(&self, now: Duration) -> bool {
        if self.throttled {
            return false;
        }
        match self.last_publish {
            Some(last) => now.saturating_sub(last) >= self.minimum_interval,
            None => true,
        }
    }

    /// Marks an accepted publish.
    pub fn record_publish(&mut self, now: Duration) {
        self.last_publish = Some(now);
    }

    /// Handles a rate-limit signal from the service.
    pub fn on_rate_limited(&mut self, now: Duration) {
        self.throttled = true;
        self.throttled_since = Some(now);
        self.minimum_interval = self.minimum_interval.saturating_add(self.step);
        self.rate_limited += 1;
    }

    /// Releases the suspension once the cool-down has elapsed.
    ///
    /// Returns true if this call released it.
    pub fn tick(&mut self, now: Duration) -> bool {
        if !self.throttled {
            return false;
        }
        let since = self.throttled_since.unwrap_or(now);
        if now.saturating_sub(since) < self.cooldown {
            return false;
        }
        self.throttled = false;
        self.throttled_since = None;
        info!(
            interval_secs = self.minimum_interval.as_secs_f64(),
            "throttle released"
        );
        true
    }

    /// Raises the minimum interval to fit `feeds` feeds per publish.
    pub fn clamp_for_feeds(&mut self, feeds: usize) -> Duration {
        let factor = u32::try_from(feeds).unwrap_or(u32::MAX);
        let floor = self
            .per_feed
            .saturating_mul(factor)
            .saturating_add(Duration::from_secs(1));
        if floor > self.minimum_interval {
            debug!(
                feeds,
                interval_secs = floor.as_secs_f64(),
                "publish interval clamped for feed count"
            );
            self.minimum_interval = floor;
        }
        self.minimum_interval
    }

    /// Wait until the next publish becomes eligible.
    pub fn remaining(&self, now: Duration) -> Duration {
        if self.throttled {
            let since = self.throttled_since.unwrap_or(now);
            return self.cooldown.saturating_sub(now.saturating_sub(since));
        }
        match self.last_publish {
            Some(last) => self.minimum_interval.saturating_sub(now.saturating_sub(last)),
            None => Duration::ZERO,
        }
    }

    /// Restores the configured interval and clears any suspension.
    pub fn reset(&mut self) {
        self.minimum_interval = self.base_interval;
        self.throttled = false;
        self.throttled_since = None;
    }

    /// Returns true while publishing is suspended.
    pub fn is_throttled(&self) -> bool {
        self.throttled
    }

    /// Current minimum interval.
    pub fn minimum_interval(&self) -> Duration {
        self.minimum_interval
    }

    /// Number of rate-limit signals received.
    pub fn rate_limited_count(&self) -> u64 {
        self.rate_limited
    }

    /// Returns a snapshot for reporting.
    pub fn state(&self) -> ThrottleState {
        ThrottleState {
            throttled: self.throttled,
            minimum_interval: self.minimum_interval,
            throttled_since: self.throttled_since,
        }
    }
}

/// A fixed-period cadence, independent of the publish throttle.
#[derive(Debug, Clone)]
pub struct IntervalTimer {
    interval: Duration,
    last: Option<Duration>,
}

impl IntervalTimer {
    /// Creates a timer that is ready immediately.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Returns true if the period has elapsed since the last mark.
    pub fn ready(&self, now: Duration) -> bool {
        match self.last {
            Some(last) => now.saturating_sub(last) >= self.interval,
            None => true,
        }
    }

    /// Starts a new period at `now`.
    pub fn mark(&mut self, now: Duration) {
        self.last = Some(now);
    }

    /// Time left in the current period.
    pub fn remaining(&self, now: Duration) -> Duration {
        match self.last {
            Some(last) => self.interval.saturating_sub(now.saturating_sub(last)),
            None => Duration::ZERO,
        }
    }

    /// Makes the timer ready again.
    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn controller() -> ThrottleController {
        ThrottleController::from_config(&UplinkConfig::new("alice", "garden"))
    }

    #[test]
    fn first_publish_is_immediate() {
        let throttle = controller();
        assert!(throttle.may_publish(Duration::ZERO));
        assert_eq!(throttle.remaining(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn interval_is_enforced() {
        let mut throttle = controller();
        throttle.record_publish(secs(10));
        assert!(!throttle.may_publish(secs(11)));
        assert_eq!(throttle.remaining(secs(11)), secs(1));
        assert!(throttle.may_publish(secs(12)));
    }

    #[test]
    fn rate_limit_suspends_until_cooldown() {
        let mut throttle = controller();
        throttle.on_rate_limited(secs(100));
        assert!(throttle.is_throttled());
        assert_eq!(throttle.minimum_interval(), secs(3));
        assert!(!throttle.may_publish(secs(200)));

        assert!(!throttle.tick(secs(129)));
        assert_eq!(throttle.remaining(secs(129)), secs(1));
        assert!(throttle.tick(secs(130)));
        assert!(!throttle.is_throttled());
        // The raised interval survives the cool-down.
        assert_eq!(throttle.minimum_interval(), secs(3));
        assert!(!throttle.tick(secs(131)));
    }

    #[test]
    fn repeated_signals_restart_the_cooldown() {
        let mut throttle = controller();
        throttle.on_rate_limited(secs(0));
        throttle.on_rate_limited(secs(20));
        assert!(!throttle.tick(secs(45)));
        assert!(throttle.tick(secs(50)));
        assert_eq!(throttle.rate_limited_count(), 2);
    }

    #[test]
    fn feed_count_clamp() {
        let mut throttle = controller();
        assert_eq!(throttle.clamp_for_feeds(3), secs(7));
        // Fewer feeds never lowers the interval.
        assert_eq!(throttle.clamp_for_feeds(1), secs(7));
    }

    #[test]
    fn reset_restores_configured_interval() {
        let mut throttle = controller();
        throttle.on_rate_limited(secs(0));
        throttle.clamp_for_feeds(4);
        throttle.reset();
        assert!(!throttle.is_throttled());
        assert_eq!(throttle.minimum_interval(), secs(2));
    }

    #[test]
    fn interval_timer() {
        let mut timer = IntervalTimer::new(secs(10));
        assert!(timer.ready(secs(0)));
        timer.mark(secs(0));
        assert!(!timer.ready(secs(9)));
        assert_eq!(timer.remaining(secs(4)), secs(6));
        assert!(timer.ready(secs(10)));
        timer.reset();
        assert!(timer.ready(secs(1)));
    }

    proptest! {
        #[test]
        fn interval_never_decreases(signals in proptest::collection::vec(0u64..10_000, 1..50)) {
            let mut throttle = controller();
            let mut now = 0u64;
            let mut previous = throttle.minimum_interval();
            for gap in signals {
                now += gap;
                throttle.tick(secs(now));
                throttle.on_rate_limited(secs(now));
                prop_assert!(throttle.minimum_interval() >= previous);
                previous = throttle.minimum_interval();
                prop_assert!(throttle.is_throttled());
                prop_assert!(!throttle.tick(secs(now) + secs(29)));
            }
        }

        #[test]
        fn never_publishes_inside_interval(
            publishes in proptest::collection::vec(0u64..20_000, 1..40),
            feeds in 0usize..8,
        ) {
            let mut throttle = controller();
            throttle.clamp_for_feeds(feeds);
            let mut now = Duration::ZERO;
            let mut last: Option<Duration> = None;
            for gap in publishes {
                now += Duration::from_millis(gap);
                if throttle.may_publish(now) {
                    if let Some(previous) = last {
                        prop_assert!(now - previous >= throttle.minimum_interval());
                    }
                    throttle.record_publish(now);
                    last = Some(now);
                }
            }
        }
    }
}
