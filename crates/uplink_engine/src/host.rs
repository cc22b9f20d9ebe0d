//! The application-facing uplink.

use crate::classify::{EscalationPolicy, ErrorKind};
use crate::clock::Clock;
use crate::config::UplinkConfig;
use crate::error::{ResetRequest, SyncError, SyncResult};
use crate::feeds::{FeedSyncEngine, PublishReport, SyncContext};
use crate::remote_log::RemoteLog;
use crate::supervisor::{ConnectionState, ConnectionSupervisor};
use crate::throttle::{ThrottleController, ThrottleState};
use crate::transport::Transport;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uplink_protocol::FeedKey;

/// Statistics about uplink operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UplinkStats {
    /// Sync ticks run.
    pub ticks: u64,
    /// Publish cycles that went out.
    pub publishes: u64,
    /// Individual feed values sent.
    pub feeds_sent: u64,
    /// Chunks sent on the long path.
    pub chunks_sent: u64,
    /// Remote updates recorded.
    pub updates_received: u64,
    /// Feeds created remotely.
    pub feeds_created: u64,
    /// Rate-limit signals received.
    pub rate_limits: u64,
    /// Successful connects after the first.
    pub reconnects: u64,
    /// Times the circuit breaker tripped.
    pub offline_entries: u64,
    /// Device-addressed notes received.
    pub notes_received: u64,
    /// Polling passes skipped because nothing changed remotely.
    pub passes_unchanged: u64,
    /// Log lines forwarded to the log feed.
    pub logs_forwarded: u64,
    /// Handled failures by kind.
    pub errors_by_kind: BTreeMap<ErrorKind, u64>,
}

/// Result of one [`Uplink::sync`] tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// A rate-limit suspension ended during this tick.
    pub throttle_released: bool,
    /// The channel was usable after the connect step.
    pub connected: bool,
    /// The channel is usable at the end of the tick.
    pub usable: bool,
    /// Undrained remote updates.
    pub updates_pending: usize,
    /// Publish result, if a snapshot was set and the channel was usable.
    pub publish: Option<PublishReport>,
    /// Log lines forwarded to the log feed.
    pub logs_forwarded: usize,
}

/// Keeps one device synchronised with the remote service over one transport.
///
/// The host pushes a snapshot with [`Uplink::set_snapshot`] and calls
/// [`Uplink::sync`] at its own cadence. Transient failures are absorbed;
/// fatal ones latch a [`ResetRequest`] and every further call fails with
/// [`SyncError::ResetRequested`] until [`Uplink::acknowledge_reset`].
pub struct Uplink<T: Transport, C: Clock> {
    config: UplinkConfig,
    clock: C,
    supervisor: ConnectionSupervisor<T>,
    throttle: ThrottleController,
    feeds: FeedSyncEngine,
    policy: EscalationPolicy,
    snapshot: BTreeMap<FeedKey, String>,
    rejected: Vec<String>,
    reset: Option<ResetRequest>,
    log_feed: Option<FeedKey>,
    remote_log: Option<RemoteLog>,
    logs_forwarded: u64,
    ticks: u64,
}

impl<T: Transport, C: Clock> Uplink<T, C> {
    /// Creates an uplink. The channel is opened by the first tick.
    pub fn new(config: UplinkConfig, transport: T, clock: C) -> SyncResult<Self> {
        config.validate()?;
        let log_feed = config.log_feed.as_deref().map(FeedKey::new).transpose()?;
        info!(
            transport = transport.name(),
            account = %config.account,
            group = %config.group,
            "uplink created"
        );
        Ok(Self {
            supervisor: ConnectionSupervisor::new(transport, &config),
            throttle: ThrottleController::from_config(&config),
            feeds: FeedSyncEngine::new(&config),
            policy: EscalationPolicy::new(),
            snapshot: BTreeMap::new(),
            rejected: Vec::new(),
            reset: None,
            log_feed,
            remote_log: None,
            logs_forwarded: 0,
            ticks: 0,
            config,
            clock,
        })
    }

    /// Forwards lines queued in `log` to the configured log feed on every
    /// tick. Without a log feed in the configuration the lines are discarded.
    pub fn attach_log(&mut self, log: RemoteLog) {
        self.remote_log = Some(log);
    }

    /// Replaces the snapshot published by later ticks.
    ///
    /// Keys that are not valid feed keys are dropped and returned.
    pub fn set_snapshot<I, K, V>(&mut self, values: I) -> Vec<String>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.snapshot.clear();
        self.rejected.clear();
        for (key, value) in values {
            match FeedKey::new(key) {
                Ok(key) => {
                    self.snapshot.insert(key, value.into());
                }
                Err(e) => {
                    warn!(error = %e, "snapshot key rejected");
                    if let uplink_protocol::ProtocolError::InvalidFeedKey { key, .. } = e {
                        self.rejected.push(key);
                    }
                }
            }
        }
        self.rejected.clone()
    }

    /// Replaces the snapshot and publishes it now if allowed.
    pub fn publish_snapshot<I, K, V>(&mut self, values: I) -> SyncResult<PublishReport>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.set_snapshot(values);
        let rejected = self.rejected.clone();
        self.run(|feeds, ctx, snapshot, now| {
            ctx.throttle.tick(now);
            ctx.supervisor.poll_offline(now);
            ctx.ensure_connected(now)?;
            let mut report = feeds.publish_snapshot(ctx, snapshot, now)?;
            report.rejected = rejected;
            Ok(report)
        })
    }

    /// Runs one tick: release an expired throttle, connect if allowed,
    /// receive, publish the snapshot if due, then forward queued log lines.
    pub fn sync(&mut self) -> SyncResult<SyncReport> {
        self.ticks += 1;
        let rejected = self.rejected.clone();
        let log = self.remote_log.clone();
        let log_feed = self.log_feed.clone();
        let report = self.run(|feeds, ctx, snapshot, now| {
            let throttle_released = ctx.throttle.tick(now);
            ctx.supervisor.poll_offline(now);
            let connected = ctx.ensure_connected(now)?;

            let mut report = SyncReport {
                throttle_released,
                connected,
                usable: connected,
                updates_pending: feeds.updates().len(),
                publish: None,
                logs_forwarded: 0,
            };
            if connected {
                report.updates_pending = feeds.receive(ctx, now)?;
                if !snapshot.is_empty() {
                    let mut publish = feeds.publish_snapshot(ctx, snapshot, now)?;
                    publish.rejected = rejected;
                    report.publish = Some(publish);
                }
            }
            if let Some(log) = &log {
                report.logs_forwarded = forward_logs(feeds, ctx, log, log_feed.as_ref(), now)?;
            }
            report.usable = ctx.supervisor.is_usable();
            Ok(report)
        })?;
        self.logs_forwarded += report.logs_forwarded as u64;
        Ok(report)
    }

    /// Subscribes to a remote feed.
    pub fn subscribe(&mut self, key: &str) -> SyncResult<()> {
        self.run(|feeds, ctx, _, now| feeds.subscribe(ctx, key, now))
    }

    /// Unsubscribes from a remote feed. Returns true if it was subscribed.
    pub fn unsubscribe(&mut self, key: &str) -> SyncResult<bool> {
        self.run(|feeds, ctx, _, now| feeds.unsubscribe(ctx, key, now))
    }

    /// Publishes a long value to one feed in chunks.
    ///
    /// Returns true if every chunk was sent.
    pub fn publish_long(&mut self, key: &str, payload: &str) -> SyncResult<bool> {
        let key = FeedKey::new(key)?;
        self.run(|feeds, ctx, _, now| {
            ctx.throttle.tick(now);
            ctx.supervisor.poll_offline(now);
            ctx.ensure_connected(now)?;
            feeds.publish_long(ctx, &key, payload, now)
        })
    }

    /// Removes and returns every remote update received since the last call.
    pub fn drain_updates(&mut self) -> BTreeMap<String, String> {
        self.feeds.drain_updates()
    }

    /// Removes and returns every device-addressed note (JSON text) received
    /// since the last call, oldest first.
    pub fn drain_notes(&mut self) -> Vec<String> {
        self.feeds.drain_notes()
    }

    /// Returns true while the channel is connected.
    pub fn is_usable(&self) -> bool {
        self.reset.is_none() && self.supervisor.is_usable()
    }

    /// The latched reset request, if a fatal failure occurred.
    pub fn reset_request(&self) -> Option<&ResetRequest> {
        self.reset.as_ref()
    }

    /// Clears a latched reset after the host has reinitialised the link.
    ///
    /// The circuit breaker and error counter are cleared; throttle state and
    /// feed caches are kept.
    pub fn acknowledge_reset(&mut self) -> Option<ResetRequest> {
        let reset = self.reset.take()?;
        self.supervisor.reset();
        info!(reason = %reset.reason, "reset acknowledged");
        Some(reset)
    }

    /// Closes the channel.
    pub fn disconnect(&mut self) {
        self.supervisor.disconnect();
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    /// Current throttle state.
    pub fn throttle_state(&self) -> ThrottleState {
        self.throttle.state()
    }

    /// Time until the next publish becomes eligible.
    pub fn publish_remaining(&self) -> Duration {
        self.throttle.remaining(self.clock.monotonic_now())
    }

    /// Aggregated statistics.
    pub fn stats(&self) -> UplinkStats {
        let feeds = self.feeds.stats();
        let link = self.supervisor.stats();
        UplinkStats {
            ticks: self.ticks,
            publishes: feeds.publishes,
            feeds_sent: feeds.feeds_sent,
            chunks_sent: feeds.chunks_sent,
            updates_received: feeds.updates_received,
            feeds_created: feeds.feeds_created,
            rate_limits: self.throttle.rate_limited_count(),
            reconnects: link.reconnects,
            offline_entries: link.offline_entries,
            notes_received: feeds.notes_received,
            passes_unchanged: feeds.passes_unchanged,
            logs_forwarded: self.logs_forwarded,
            errors_by_kind: self.policy.tally().clone(),
        }
    }

    /// The configuration.
    pub fn config(&self) -> &UplinkConfig {
        &self.config
    }

    /// The clock.
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// The transport.
    pub fn transport(&self) -> &T {
        self.supervisor.transport()
    }

    /// The transport, mutably.
    pub fn transport_mut(&mut self) -> &mut T {
        self.supervisor.transport_mut()
    }

    /// Runs an engine operation with borrowed collaborators, latching any
    /// reset request it raises.
    fn run<R>(
        &mut self,
        op: impl FnOnce(
            &mut FeedSyncEngine,
            &mut SyncContext<'_, T>,
            &BTreeMap<FeedKey, String>,
            Duration,
        ) -> SyncResult<R>,
    ) -> SyncResult<R> {
        if let Some(reset) = &self.reset {
            return Err(SyncError::ResetRequested(reset.clone()));
        }

        let now = self.clock.monotonic_now();
        let Self {
            config,
            clock,
            supervisor,
            throttle,
            feeds,
            policy,
            snapshot,
            reset,
            ..
        } = self;
        let mut ctx = SyncContext {
            supervisor,
            throttle,
            policy,
            clock: &*clock,
            sync_time: config.sync_time_on_connect,
        };

        let result = op(feeds, &mut ctx, snapshot, now);
        if let Err(SyncError::ResetRequested(request)) = &result {
            error!(kind = %request.kind, reason = %request.reason, "hard reset requested");
            *reset = Some(request.clone());
        }
        result
    }
}

/// Publishes queued log lines one per value, oldest first.
///
/// Lines are dropped when there is no log feed, the channel is unusable or
/// publishing is throttled. Forwarding stops at the first failed line.
fn forward_logs<T: Transport>(
    feeds: &mut FeedSyncEngine,
    ctx: &mut SyncContext<'_, T>,
    log: &RemoteLog,
    feed: Option<&FeedKey>,
    now: Duration,
) -> SyncResult<usize> {
    let lines = log.drain();
    if lines.is_empty() {
        return Ok(0);
    }
    let Some(feed) = feed else {
        return Ok(0);
    };
    if !ctx.supervisor.is_usable() || ctx.throttle.is_throttled() {
        debug!(dropped = lines.len(), "log lines dropped, cannot publish");
        return Ok(0);
    }

    let mut forwarded = 0;
    for line in &lines {
        if !log.forwarding(|| feeds.publish_long(ctx, feed, line, now))? {
            debug!(dropped = lines.len() - forwarded, "log forwarding stopped");
            break;
        }
        forwarded += 1;
    }
    if forwarded > 0 && ctx.supervisor.is_usable() {
        if let Err(err) = log.forwarding(|| ctx.supervisor.transport_mut().flush()) {
            ctx.escalate(err, now)?;
        }
    }
    Ok(forwarded)
}
