//! Error classification and escalation.
//!
//! Every raw [`TransportError`] is classified exactly once into an
//! [`ErrorEvent`]. The [`EscalationPolicy`] turns the event into an
//! [`Action`] and applies its side effects to the throttle controller and the
//! connection supervisor.

use crate::error::TransportError;
use crate::supervisor::{ConnectionSupervisor, Escalation};
use crate::throttle::ThrottleController;
use crate::transport::Transport;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Category of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No answer in time.
    Timeout,
    /// Link drop, malformed response or server-side failure.
    Transient,
    /// Explicit rate-limit signal.
    RateLimited,
    /// Addressed feed or group does not exist.
    MissingResource,
    /// Memory or buffer exhaustion.
    ResourceExhaustion,
    /// Authentication failure or permanent protocol violation.
    Permanent,
    /// Anything else.
    Unknown,
}

impl ErrorKind {
    /// The action the policy takes for this kind, before breaker effects.
    pub fn default_action(self) -> Action {
        match self {
            ErrorKind::RateLimited => Action::IncreaseThrottle,
            ErrorKind::MissingResource => Action::LocalRetry,
            ErrorKind::Transient | ErrorKind::Timeout => Action::RequestReconnect,
            ErrorKind::ResourceExhaustion => Action::Ignore,
            ErrorKind::Permanent | ErrorKind::Unknown => Action::RequestHardReset,
        }
    }

    /// Returns true if failures of this kind count toward the circuit breaker.
    pub fn consumes_retry_budget(self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::Timeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Transient => "transient",
            ErrorKind::RateLimited => "rate-limited",
            ErrorKind::MissingResource => "missing-resource",
            ErrorKind::ResourceExhaustion => "resource-exhaustion",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// A classified failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    /// Category.
    pub kind: ErrorKind,
    /// The transport error that was classified.
    pub raw_cause: TransportError,
    /// Whether the event counts toward the consecutive-error counter.
    pub retry_budget_consumed: bool,
}

/// What the engine does about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing this cycle.
    Ignore,
    /// Create the missing resource and retry the operation once.
    LocalRetry,
    /// Suspend publishing and raise the minimum interval.
    IncreaseThrottle,
    /// Attempt one immediate reconnect.
    RequestReconnect,
    /// Ask the host to reinitialise the link.
    RequestHardReset,
}

/// Classifies a transport failure.
pub fn classify(err: TransportError) -> ErrorEvent {
    let kind = match &err {
        TransportError::RateLimited(_) => ErrorKind::RateLimited,
        TransportError::NotFound(_) => ErrorKind::MissingResource,
        TransportError::Connection(_) | TransportError::Malformed(_) => ErrorKind::Transient,
        TransportError::Timeout(_) => ErrorKind::Timeout,
        TransportError::ResourceExhausted(_) => ErrorKind::ResourceExhaustion,
        TransportError::Auth(_) | TransportError::Protocol(_) => ErrorKind::Permanent,
        TransportError::Other(_) => ErrorKind::Unknown,
    };
    ErrorEvent {
        kind,
        raw_cause: err,
        retry_budget_consumed: kind.consumes_retry_budget(),
    }
}

/// Applies classified failures to the throttle controller and supervisor.
#[derive(Debug, Default)]
pub struct EscalationPolicy {
    tally: BTreeMap<ErrorKind, u64>,
}

impl EscalationPolicy {
    /// Creates a policy with an empty tally.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decides and applies the action for `event`.
    ///
    /// Rate limits raise the throttle. Counted errors go to the supervisor's
    /// circuit breaker; a breaker that trips with retries disabled upgrades
    /// the action to [`Action::RequestHardReset`]. The reconnect itself is
    /// left to the caller.
    pub fn handle<T: Transport>(
        &mut self,
        event: &ErrorEvent,
        supervisor: &mut ConnectionSupervisor<T>,
        throttle: &mut ThrottleController,
        now: Duration,
    ) -> Action {
        *self.tally.entry(event.kind).or_insert(0) += 1;
        let action = event.kind.default_action();

        match action {
            Action::IncreaseThrottle => {
                throttle.on_rate_limited(now);
                warn!(
                    cause = %event.raw_cause,
                    interval_secs = throttle.minimum_interval().as_secs_f64(),
                    "rate limited, publishing suspended"
                );
                action
            }
            Action::RequestReconnect => match supervisor.note_error(event, now) {
                Some(Escalation::Fatal) => {
                    error!(cause = %event.raw_cause, "circuit breaker tripped with retries disabled");
                    Action::RequestHardReset
                }
                _ => {
                    debug!(kind = %event.kind, cause = %event.raw_cause, "transient failure");
                    action
                }
            },
            Action::RequestHardReset => {
                error!(kind = %event.kind, cause = %event.raw_cause, "unrecoverable failure");
                action
            }
            Action::Ignore => {
                warn!(cause = %event.raw_cause, "resource exhausted, skipping this cycle");
                action
            }
            Action::LocalRetry => {
                debug!(cause = %event.raw_cause, "resource missing");
                action
            }
        }
    }

    /// Number of handled events of `kind`.
    pub fn count(&self, kind: ErrorKind) -> u64 {
        self.tally.get(&kind).copied().unwrap_or(0)
    }

    /// Handled events by kind.
    pub fn tally(&self) -> &BTreeMap<ErrorKind, u64> {
        &self.tally
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OfflineRetry, UplinkConfig};
    use crate::transport::MockTransport;

    fn fixtures(retry: OfflineRetry) -> (ConnectionSupervisor<MockTransport>, ThrottleController) {
        let config = UplinkConfig::new("alice", "garden").with_offline_retry(retry);
        (
            ConnectionSupervisor::new(MockTransport::new(), &config),
            ThrottleController::from_config(&config),
        )
    }

    #[test]
    fn classification_table() {
        let cases = [
            (TransportError::RateLimited("x".into()), ErrorKind::RateLimited, Action::IncreaseThrottle, false),
            (TransportError::NotFound("x".into()), ErrorKind::MissingResource, Action::LocalRetry, false),
            (TransportError::Connection("x".into()), ErrorKind::Transient, Action::RequestReconnect, true),
            (TransportError::Malformed("x".into()), ErrorKind::Transient, Action::RequestReconnect, true),
            (TransportError::Timeout(Duration::from_secs(1)), ErrorKind::Timeout, Action::RequestReconnect, true),
            (TransportError::ResourceExhausted("x".into()), ErrorKind::ResourceExhaustion, Action::Ignore, false),
            (TransportError::Auth("x".into()), ErrorKind::Permanent, Action::RequestHardReset, false),
            (TransportError::Protocol("x".into()), ErrorKind::Permanent, Action::RequestHardReset, false),
            (TransportError::Other("x".into()), ErrorKind::Unknown, Action::RequestHardReset, false),
        ];

        for (err, kind, action, counted) in cases {
            let event = classify(err);
            assert_eq!(event.kind, kind);
            assert_eq!(event.kind.default_action(), action);
            assert_eq!(event.retry_budget_consumed, counted);
        }
    }

    #[test]
    fn rate_limit_raises_throttle() {
        let (mut supervisor, mut throttle) = fixtures(OfflineRetry::default());
        let mut policy = EscalationPolicy::new();
        let before = throttle.minimum_interval();

        let event = classify(TransportError::RateLimited("slow down".into()));
        let action = policy.handle(&event, &mut supervisor, &mut throttle, Duration::from_secs(1));

        assert_eq!(action, Action::IncreaseThrottle);
        assert!(throttle.is_throttled());
        assert!(throttle.minimum_interval() > before);
        assert_eq!(policy.count(ErrorKind::RateLimited), 1);
        assert_eq!(supervisor.consecutive_errors(), 0);
    }

    #[test]
    fn tripping_with_retries_disabled_is_fatal() {
        let (mut supervisor, mut throttle) = fixtures(OfflineRetry::Disabled);
        let mut policy = EscalationPolicy::new();
        supervisor.connect(Duration::ZERO).unwrap();

        let event = classify(TransportError::Connection("reset".into()));
        let now = Duration::from_secs(1);
        assert_eq!(
            policy.handle(&event, &mut supervisor, &mut throttle, now),
            Action::RequestReconnect
        );
        assert_eq!(
            policy.handle(&event, &mut supervisor, &mut throttle, now),
            Action::RequestReconnect
        );
        assert_eq!(
            policy.handle(&event, &mut supervisor, &mut throttle, now),
            Action::RequestHardReset
        );
        assert_eq!(policy.count(ErrorKind::Transient), 3);
    }

    #[test]
    fn permanent_errors_bypass_the_breaker() {
        let (mut supervisor, mut throttle) = fixtures(OfflineRetry::default());
        let mut policy = EscalationPolicy::new();
        let event = classify(TransportError::Auth("bad key".into()));

        let action = policy.handle(&event, &mut supervisor, &mut throttle, Duration::ZERO);
        assert_eq!(action, Action::RequestHardReset);
        assert_eq!(supervisor.consecutive_errors(), 0);
    }
}
