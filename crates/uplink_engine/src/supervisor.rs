//! Connection lifecycle and circuit breaker.

use crate::classify::ErrorEvent;
use crate::config::{OfflineRetry, UplinkConfig};
use crate::error::{SyncError, SyncResult};
use crate::transport::Transport;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, warn};
use uplink_protocol::FeedKey;

/// State of the link to the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No open channel.
    Disconnected,
    /// A connect attempt is in progress.
    Connecting,
    /// The channel is open and usable.
    Connected,
    /// The circuit breaker is open.
    Offline {
        /// When the breaker tripped.
        since: Duration,
        /// Cool-down before the next attempt; `None` means never.
        retry_after: Option<Duration>,
    },
}

/// Result of a successful [`ConnectionSupervisor::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A new connection was opened and subscriptions were replayed.
    Established,
    /// The link was already up.
    AlreadyConnected,
}

/// Raised by the circuit breaker when it trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// The channel went offline for the configured cool-down.
    Offline,
    /// The channel went offline for good; the host must reset.
    Fatal,
}

/// Counters kept by the supervisor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorStats {
    /// Successful connects.
    pub connects: u64,
    /// Successful connects after the first.
    pub reconnects: u64,
    /// Failed connect attempts.
    pub connect_failures: u64,
    /// Times the circuit breaker tripped.
    pub offline_entries: u64,
}

/// Owns the transport and drives its lifecycle.
///
/// Counted failures accumulate in a consecutive-error counter; when it reaches
/// the configured maximum the supervisor goes offline. After the cool-down
/// exactly one connect attempt is allowed before the breaker trips again.
#[derive(Debug)]
pub struct ConnectionSupervisor<T> {
    transport: T,
    state: ConnectionState,
    consecutive_errors: u32,
    max_consecutive_errors: u32,
    offline_retry: OfflineRetry,
    subscriptions: BTreeSet<FeedKey>,
    stats: SupervisorStats,
}

impl<T: Transport> ConnectionSupervisor<T> {
    /// Creates a disconnected supervisor.
    pub fn new(transport: T, config: &UplinkConfig) -> Self {
        Self {
            transport,
            state: ConnectionState::Disconnected,
            consecutive_errors: 0,
            max_consecutive_errors: config.max_consecutive_errors.max(1),
            offline_retry: config.offline_retry_delay,
            subscriptions: BTreeSet::new(),
            stats: SupervisorStats::default(),
        }
    }

    /// Opens the channel unless it is already open or the breaker is open.
    ///
    /// On success the counter is reset and every registered feed is
    /// re-subscribed. A failed replay counts as a failed connect. Errors are
    /// returned for the caller to classify.
    pub fn connect(&mut self, now: Duration) -> SyncResult<ConnectOutcome> {
        self.poll_offline(now);

        match self.state {
            ConnectionState::Connected if self.transport.is_connected() => {
                return Ok(ConnectOutcome::AlreadyConnected)
            }
            ConnectionState::Connected => {
                debug!(transport = self.transport.name(), "link dropped underneath");
                self.state = ConnectionState::Disconnected;
            }
            ConnectionState::Offline { .. } => {
                return Err(SyncError::Offline {
                    retry_in: self.retry_in(now),
                })
            }
            ConnectionState::Disconnected | ConnectionState::Connecting => {}
        }

        self.state = ConnectionState::Connecting;
        debug!(
            transport = self.transport.name(),
            attempt = self.consecutive_errors + 1,
            "connecting"
        );

        if let Err(err) = self.transport.connect() {
            self.state = ConnectionState::Disconnected;
            self.stats.connect_failures += 1;
            warn!(transport = self.transport.name(), error = %err, "connect failed");
            return Err(SyncError::Connect(err));
        }

        for key in &self.subscriptions {
            if let Err(err) = self.transport.subscribe(key) {
                self.transport.disconnect();
                self.state = ConnectionState::Disconnected;
                self.stats.connect_failures += 1;
                warn!(feed = %key, error = %err, "subscription replay failed");
                return Err(SyncError::Connect(err));
            }
        }

        if self.stats.connects > 0 {
            self.stats.reconnects += 1;
        }
        self.stats.connects += 1;
        self.state = ConnectionState::Connected;
        self.consecutive_errors = 0;
        info!(
            transport = self.transport.name(),
            subscriptions = self.subscriptions.len(),
            "connected"
        );
        Ok(ConnectOutcome::Established)
    }

    /// Closes the channel.
    pub fn disconnect(&mut self) {
        self.transport.disconnect();
        self.state = ConnectionState::Disconnected;
    }

    /// Returns true only while connected.
    pub fn is_usable(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Returns true while the circuit breaker is open.
    pub fn is_offline(&self) -> bool {
        matches!(self.state, ConnectionState::Offline { .. })
    }

    /// Feeds a classified failure into the circuit breaker.
    ///
    /// Only events that consume the retry budget count. Failures below the
    /// threshold drop the link so the next attempt reconnects.
    pub fn note_error(&mut self, event: &ErrorEvent, now: Duration) -> Option<Escalation> {
        if !event.retry_budget_consumed || self.is_offline() {
            return None;
        }

        self.consecutive_errors += 1;
        if self.consecutive_errors < self.max_consecutive_errors {
            if self.state == ConnectionState::Connected {
                self.transport.disconnect();
            }
            self.state = ConnectionState::Disconnected;
            debug!(
                errors = self.consecutive_errors,
                max = self.max_consecutive_errors,
                "link marked down"
            );
            return None;
        }

        self.transport.disconnect();
        self.stats.offline_entries += 1;
        let retry_after = self.offline_retry.delay();
        self.state = ConnectionState::Offline {
            since: now,
            retry_after,
        };
        match retry_after {
            Some(delay) => {
                warn!(
                    errors = self.consecutive_errors,
                    retry_secs = delay.as_secs_f64(),
                    "circuit breaker open"
                );
                Some(Escalation::Offline)
            }
            None => {
                warn!(
                    errors = self.consecutive_errors,
                    "circuit breaker open, retries disabled"
                );
                Some(Escalation::Fatal)
            }
        }
    }

    /// Closes the breaker once its cool-down has elapsed.
    ///
    /// The counter is left one short of the threshold, so a single counted
    /// failure re-opens the breaker. Returns true if the breaker closed.
    pub fn poll_offline(&mut self, now: Duration) -> bool {
        let ConnectionState::Offline {
            since,
            retry_after: Some(delay),
        } = self.state
        else {
            return false;
        };
        if now.saturating_sub(since) < delay {
            return false;
        }
        self.state = ConnectionState::Disconnected;
        self.consecutive_errors = self.max_consecutive_errors - 1;
        info!("offline cool-down elapsed, allowing one connect attempt");
        true
    }

    /// Time until the breaker allows another attempt.
    ///
    /// `Some(ZERO)` when not offline, `None` when offline for good.
    pub fn retry_in(&self, now: Duration) -> Option<Duration> {
        match self.state {
            ConnectionState::Offline {
                since,
                retry_after: Some(delay),
            } => Some(delay.saturating_sub(now.saturating_sub(since))),
            ConnectionState::Offline {
                retry_after: None, ..
            } => None,
            _ => Some(Duration::ZERO),
        }
    }

    /// Clears the breaker and the counter, leaving the link disconnected.
    pub fn reset(&mut self) {
        self.transport.disconnect();
        self.state = ConnectionState::Disconnected;
        self.consecutive_errors = 0;
    }

    /// Adds a feed to the replay set. Returns true if it was new.
    pub fn register(&mut self, key: FeedKey) -> bool {
        self.subscriptions.insert(key)
    }

    /// Removes a feed from the replay set. Returns true if it was present.
    pub fn unregister(&mut self, key: &FeedKey) -> bool {
        self.subscriptions.remove(key)
    }

    /// Registered feeds in replay order.
    pub fn subscriptions(&self) -> &BTreeSet<FeedKey> {
        &self.subscriptions
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Current value of the consecutive-error counter.
    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    /// Lifecycle counters.
    pub fn stats(&self) -> SupervisorStats {
        self.stats
    }

    /// The owned transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The owned transport, mutably.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}
