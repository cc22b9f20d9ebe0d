//! Feed-level publish and receive scheduling.
//!
//! The [`FeedSyncEngine`] maps the host's key-value snapshot onto remote
//! feeds and maps remote updates back into an [`UpdatedFeedSet`]. It never
//! owns the link: every operation borrows the supervisor, throttle and
//! escalation policy through a [`SyncContext`].

use crate::classify::{classify, Action, EscalationPolicy};
use crate::clock::Clock;
use crate::config::UplinkConfig;
use crate::error::{ResetRequest, SyncError, SyncResult, TransportError};
use crate::supervisor::{ConnectOutcome, ConnectionSupervisor};
use crate::throttle::{IntervalTimer, ThrottleController};
use crate::transport::{InboundMessage, ReceiveMode, RemoteFeed, Transport};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use uplink_protocol::{split_chunks, FeedKey, RemoteTimestamp};

/// Collaborators borrowed for the duration of one engine operation.
pub struct SyncContext<'a, T> {
    /// Connection supervisor (owns the transport).
    pub supervisor: &'a mut ConnectionSupervisor<T>,
    /// Publish throttle.
    pub throttle: &'a mut ThrottleController,
    /// Escalation policy.
    pub policy: &'a mut EscalationPolicy,
    /// Clock whose wall time is refreshed after connects.
    pub clock: &'a dyn Clock,
    /// Fetch the remote wall clock after each connect.
    pub sync_time: bool,
}

impl<'a, T: Transport> SyncContext<'a, T> {
    /// Connects if needed. Returns whether the channel is usable afterwards.
    ///
    /// Connect failures are classified and absorbed; only a fatal
    /// classification is returned as an error.
    pub fn ensure_connected(&mut self, now: Duration) -> SyncResult<bool> {
        match self.supervisor.connect(now) {
            Ok(ConnectOutcome::AlreadyConnected) => Ok(true),
            Ok(ConnectOutcome::Established) => {
                self.after_connect(now)?;
                Ok(self.supervisor.is_usable())
            }
            Err(SyncError::Offline { retry_in }) => {
                debug!(retry_in = ?retry_in, "channel offline");
                Ok(false)
            }
            Err(SyncError::Connect(err)) => {
                self.absorb(err, now)?;
                Ok(false)
            }
            Err(other) => Err(other),
        }
    }

    /// Refreshes the wall clock from the service.
    pub fn after_connect(&mut self, now: Duration) -> SyncResult<()> {
        if !self.sync_time {
            return Ok(());
        }
        match self.supervisor.transport_mut().time_sync() {
            Ok(Some(unix_secs)) => {
                self.clock.set_wall_clock(unix_secs);
                debug!(unix_secs, "wall clock synchronised");
            }
            Ok(None) => {}
            Err(err) => {
                self.absorb(err, now)?;
            }
        }
        Ok(())
    }

    /// Classifies a failure and applies its action, without reconnecting.
    pub fn absorb(&mut self, err: TransportError, now: Duration) -> SyncResult<Action> {
        let event = classify(err);
        let action = self
            .policy
            .handle(&event, self.supervisor, self.throttle, now);
        if action == Action::RequestHardReset {
            return Err(SyncError::ResetRequested(ResetRequest::new(
                event.kind,
                event.raw_cause.to_string(),
            )));
        }
        Ok(action)
    }

    /// Classifies a failure, applies its action and, for reconnect actions,
    /// makes one immediate reconnect attempt.
    ///
    /// The reconnect attempt's own failure is counted but not retried.
    pub fn escalate(&mut self, err: TransportError, now: Duration) -> SyncResult<Action> {
        let action = self.absorb(err, now)?;
        if action == Action::RequestReconnect && !self.supervisor.is_offline() {
            info!("reconnecting after transient failure");
            self.ensure_connected(now)?;
        }
        Ok(action)
    }

    fn can_send(&self) -> bool {
        self.supervisor.is_usable() && !self.throttle.is_throttled()
    }
}

/// Cached remote and local state of one feed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedRecord {
    /// Last value published or received.
    pub last_value: Option<String>,
    /// Newest remote update time seen.
    pub last_remote_update: Option<RemoteTimestamp>,
    /// Monotonic time of the last successful local publish.
    pub last_local_publish: Option<Duration>,
    /// Whether the remote feed has been observed at least once.
    pub observed: bool,
}

/// Remote values that arrived since the host last drained them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdatedFeedSet {
    values: BTreeMap<FeedKey, String>,
}

impl UpdatedFeedSet {
    /// Records the newest value for a feed, replacing an undrained one.
    pub fn insert(&mut self, key: FeedKey, value: String) {
        self.values.insert(key, value);
    }

    /// Removes and returns every pending value.
    pub fn drain(&mut self) -> BTreeMap<FeedKey, String> {
        std::mem::take(&mut self.values)
    }

    /// Pending value for a feed.
    pub fn get(&self, key: &FeedKey) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Number of pending values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// How a publish cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The snapshot was sent (individual feeds may still have failed).
    Published,
    /// The minimum interval has not elapsed yet.
    Waiting {
        /// Time until the next publish is eligible.
        remaining: Duration,
    },
    /// Publishing is suspended by a rate limit.
    Throttled,
    /// The channel is not usable.
    Unusable,
}

/// Per-feed results of one publish cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReport {
    /// How the cycle ended.
    pub outcome: PublishOutcome,
    /// Feeds sent completely.
    pub sent: Vec<FeedKey>,
    /// Feeds whose send failed.
    pub failed: Vec<FeedKey>,
    /// Feeds not attempted because the channel became unusable or throttled.
    pub skipped: Vec<FeedKey>,
    /// Snapshot keys that are not valid feed keys.
    pub rejected: Vec<String>,
}

impl PublishReport {
    fn new(outcome: PublishOutcome) -> Self {
        Self {
            outcome,
            sent: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            rejected: Vec::new(),
        }
    }

    /// Returns true if every attempted feed went out.
    pub fn is_complete(&self) -> bool {
        self.outcome == PublishOutcome::Published
            && self.failed.is_empty()
            && self.skipped.is_empty()
    }
}

/// Counters kept by the feed engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedStats {
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
    /// Device-addressed notes received.
    pub notes_received: u64,
    /// Polling passes skipped because nothing changed remotely.
    pub passes_unchanged: u64,
}

/// Maps a local snapshot to remote feeds and back.
#[derive(Debug)]
pub struct FeedSyncEngine {
    records: BTreeMap<FeedKey, FeedRecord>,
    updates: UpdatedFeedSet,
    notes: VecDeque<String>,
    receive_timer: IntervalTimer,
    chunk_size: usize,
    receive_timeout: Duration,
    metadata: Option<String>,
    last_arrival: Option<RemoteTimestamp>,
    stats: FeedStats,
}

impl FeedSyncEngine {
    /// Creates an engine from the configuration.
    pub fn new(config: &UplinkConfig) -> Self {
        Self {
            records: BTreeMap::new(),
            updates: UpdatedFeedSet::default(),
            notes: VecDeque::new(),
            receive_timer: IntervalTimer::new(config.receive_interval),
            chunk_size: config.chunk_size,
            receive_timeout: config.receive_timeout,
            metadata: config.metadata.clone(),
            last_arrival: None,
            stats: FeedStats::default(),
        }
    }

    /// Publishes every feed of `snapshot` if the channel and throttle allow.
    ///
    /// Feeds go out in key order. A failing feed does not stop the others,
    /// but a rate limit or a lost channel stops the cycle.
    pub fn publish_snapshot<T: Transport>(
        &mut self,
        ctx: &mut SyncContext<'_, T>,
        snapshot: &BTreeMap<FeedKey, String>,
        now: Duration,
    ) -> SyncResult<PublishReport> {
        ctx.throttle.clamp_for_feeds(snapshot.len());

        if !ctx.supervisor.is_usable() {
            debug!("publish skipped, channel not usable");
            return Ok(PublishReport::new(PublishOutcome::Unusable));
        }
        if ctx.throttle.is_throttled() {
            debug!(
                remaining_secs = ctx.throttle.remaining(now).as_secs_f64(),
                "publish skipped, throttled"
            );
            return Ok(PublishReport::new(PublishOutcome::Throttled));
        }
        if !ctx.throttle.may_publish(now) {
            let remaining = ctx.throttle.remaining(now);
            debug!(
                remaining_secs = remaining.as_secs_f64(),
                "publish not due yet"
            );
            return Ok(PublishReport::new(PublishOutcome::Waiting { remaining }));
        }

        ctx.throttle.record_publish(now);
        self.stats.publishes += 1;
        let mut report = PublishReport::new(PublishOutcome::Published);

        for (key, value) in snapshot {
            if !ctx.can_send() {
                report.skipped.push(key.clone());
                continue;
            }
            if self.send_value(ctx, key, value, now)? {
                report.sent.push(key.clone());
            } else {
                report.failed.push(key.clone());
            }
        }

        if !report.sent.is_empty() && ctx.supervisor.is_usable() {
            if let Err(err) = ctx.supervisor.transport_mut().flush() {
                ctx.escalate(err, now)?;
            }
        }

        if report.skipped.is_empty() {
            debug!(sent = report.sent.len(), failed = report.failed.len(), "published");
        } else {
            warn!(
                sent = report.sent.len(),
                failed = report.failed.len(),
                skipped = report.skipped.len(),
                "publish cycle cut short"
            );
        }
        Ok(report)
    }

    /// Publishes `payload` to one feed in chunks of at most the configured
    /// size. Returns true if every chunk was sent.
    ///
    /// Not subject to the publish interval, only to the throttle flag and the
    /// channel state.
    pub fn publish_long<T: Transport>(
        &mut self,
        ctx: &mut SyncContext<'_, T>,
        key: &FeedKey,
        payload: &str,
        now: Duration,
    ) -> SyncResult<bool> {
        if !ctx.can_send() {
            debug!(feed = %key, "long publish skipped");
            return Ok(false);
        }
        let chunks = split_chunks(payload, self.chunk_size);
        let done = self.send_chunks(ctx, key, &chunks, now)?;
        if done {
            self.note_published(key, payload, now);
        }
        Ok(done)
    }

    /// Runs one receive pass if the channel and receive timer allow.
    ///
    /// A rate limit suspends publishing only; receiving continues while
    /// throttled. Returns the number of feeds with undrained updates.
    pub fn receive<T: Transport>(
        &mut self,
        ctx: &mut SyncContext<'_, T>,
        now: Duration,
    ) -> SyncResult<usize> {
        if !ctx.supervisor.is_usable() || !self.receive_timer.ready(now) {
            return Ok(self.updates.len());
        }
        self.receive_timer.mark(now);

        match ctx.supervisor.transport().receive_mode() {
            ReceiveMode::Poll => {
                self.receive_by_fetch(ctx, now)?;
                if ctx.supervisor.is_usable() {
                    self.receive_pushed(ctx, Duration::ZERO, now)?;
                }
            }
            ReceiveMode::Push => {
                self.seed_deferred(ctx, now)?;
                let timeout = self.receive_timeout;
                self.receive_pushed(ctx, timeout, now)?;
            }
        }
        Ok(self.updates.len())
    }

    /// Registers a feed for receiving and seeds its cache.
    ///
    /// Seeding never reports an update. When the channel is not usable the
    /// feed is only registered; the first successful receive seeds it.
    /// Subscribing again is a no-op.
    pub fn subscribe<T: Transport>(
        &mut self,
        ctx: &mut SyncContext<'_, T>,
        key: &str,
        now: Duration,
    ) -> SyncResult<()> {
        let key = FeedKey::new(key)?;
        let newly = ctx.supervisor.register(key.clone());
        let observed = self.records.entry(key.clone()).or_default().observed;

        if !ctx.supervisor.is_usable() {
            debug!(feed = %key, "subscribe deferred until connected");
            return Ok(());
        }
        if newly {
            if let Err(err) = ctx.supervisor.transport_mut().subscribe(&key) {
                ctx.escalate(err, now)?;
                return Ok(());
            }
        }
        if observed {
            return Ok(());
        }

        match ctx.supervisor.transport_mut().fetch(&key) {
            Ok(remote) => {
                self.seed(remote);
                debug!(feed = %key, "subscribed");
            }
            Err(err) => {
                if ctx.escalate(err, now)? == Action::LocalRetry {
                    self.create_remote(ctx, &key, now)?;
                }
            }
        }
        Ok(())
    }

    /// Stops receiving a feed. Returns true if it was subscribed.
    ///
    /// The cached record is kept.
    pub fn unsubscribe<T: Transport>(
        &mut self,
        ctx: &mut SyncContext<'_, T>,
        key: &str,
        now: Duration,
    ) -> SyncResult<bool> {
        let key = FeedKey::new(key)?;
        if !ctx.supervisor.unregister(&key) {
            return Ok(false);
        }
        if ctx.supervisor.is_usable() {
            if let Err(err) = ctx.supervisor.transport_mut().unsubscribe(&key) {
                ctx.escalate(err, now)?;
            }
        }
        debug!(feed = %key, "unsubscribed");
        Ok(true)
    }

    /// Removes and returns every pending remote update.
    pub fn drain_updates(&mut self) -> BTreeMap<String, String> {
        self.updates
            .drain()
            .into_iter()
            .map(|(key, value)| (key.into(), value))
            .collect()
    }

    /// Removes and returns every device-addressed note, oldest first.
    pub fn drain_notes(&mut self) -> Vec<String> {
        self.notes.drain(..).collect()
    }

    /// Pending remote updates.
    pub fn updates(&self) -> &UpdatedFeedSet {
        &self.updates
    }

    /// Cached state of a feed.
    pub fn record(&self, key: &FeedKey) -> Option<&FeedRecord> {
        self.records.get(key)
    }

    /// Counters.
    pub fn stats(&self) -> FeedStats {
        self.stats
    }

    /// Sends one value, taking the long path when it exceeds the chunk size.
    fn send_value<T: Transport>(
        &mut self,
        ctx: &mut SyncContext<'_, T>,
        key: &FeedKey,
        value: &str,
        now: Duration,
    ) -> SyncResult<bool> {
        let sent = if value.len() > self.chunk_size {
            let chunks = split_chunks(value, self.chunk_size);
            self.send_chunks(ctx, key, &chunks, now)?
        } else {
            self.send_one(ctx, key, value, now)?
        };
        if sent {
            self.note_published(key, value, now);
        }
        Ok(sent)
    }

    fn send_chunks<T: Transport>(
        &mut self,
        ctx: &mut SyncContext<'_, T>,
        key: &FeedKey,
        chunks: &[&str],
        now: Duration,
    ) -> SyncResult<bool> {
        for (index, chunk) in chunks.iter().enumerate() {
            if index > 0 && !ctx.can_send() {
                warn!(feed = %key, chunk = index, total = chunks.len(), "long publish interrupted");
                return Ok(false);
            }
            if !self.send_one(ctx, key, chunk, now)? {
                warn!(feed = %key, chunk = index, total = chunks.len(), "long publish failed");
                return Ok(false);
            }
            self.stats.chunks_sent += 1;
        }
        Ok(true)
    }

    /// Sends one payload. A missing feed is created and the send retried once.
    fn send_one<T: Transport>(
        &mut self,
        ctx: &mut SyncContext<'_, T>,
        key: &FeedKey,
        payload: &str,
        now: Duration,
    ) -> SyncResult<bool> {
        let metadata = self.metadata.clone();
        let metadata = metadata.as_deref();
        let err = match ctx.supervisor.transport_mut().send(key, payload, metadata) {
            Ok(()) => return Ok(true),
            Err(err) => err,
        };
        debug!(feed = %key, error = %err, "send failed");
        if ctx.escalate(err, now)? != Action::LocalRetry {
            return Ok(false);
        }

        if !self.create_remote(ctx, key, now)? {
            return Ok(false);
        }
        match ctx.supervisor.transport_mut().send(key, payload, metadata) {
            Ok(()) => Ok(true),
            Err(err) => {
                warn!(feed = %key, error = %err, "send failed after creating feed");
                ctx.escalate(err, now)?;
                Ok(false)
            }
        }
    }

    /// Creates a feed remotely and marks it observed with no update yet.
    fn create_remote<T: Transport>(
        &mut self,
        ctx: &mut SyncContext<'_, T>,
        key: &FeedKey,
        now: Duration,
    ) -> SyncResult<bool> {
        match ctx.supervisor.transport_mut().create_feed(key) {
            Ok(()) => {
                info!(feed = %key, "created remote feed");
                self.stats.feeds_created += 1;
                self.records.entry(key.clone()).or_default().observed = true;
                Ok(true)
            }
            Err(err) => {
                warn!(feed = %key, error = %err, "feed creation failed");
                ctx.escalate(err, now)?;
                Ok(false)
            }
        }
    }

    fn receive_by_fetch<T: Transport>(
        &mut self,
        ctx: &mut SyncContext<'_, T>,
        now: Duration,
    ) -> SyncResult<()> {
        let keys: Vec<FeedKey> = ctx.supervisor.subscriptions().iter().cloned().collect();
        if keys.is_empty() {
            return Ok(());
        }
        let seeded = keys
            .iter()
            .all(|key| self.records.get(key).is_some_and(|r| r.observed));
        if seeded {
            match ctx.supervisor.transport_mut().remote_changed() {
                Ok(true) => {}
                Ok(false) => {
                    trace!("nothing changed remotely");
                    self.stats.passes_unchanged += 1;
                    return Ok(());
                }
                Err(err) => {
                    ctx.escalate(err, now)?;
                    return Ok(());
                }
            }
        }
        for key in keys {
            if !ctx.supervisor.is_usable() {
                debug!("receive pass stopped");
                break;
            }
            match ctx.supervisor.transport_mut().fetch(&key) {
                Ok(remote) => self.observe(remote),
                Err(err) => {
                    if ctx.escalate(err, now)? == Action::LocalRetry {
                        self.create_remote(ctx, &key, now)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Fetches subscriptions registered while the channel was down, so the
    /// first pushed value after them is compared against the remote state.
    fn seed_deferred<T: Transport>(
        &mut self,
        ctx: &mut SyncContext<'_, T>,
        now: Duration,
    ) -> SyncResult<()> {
        let unseeded: Vec<FeedKey> = ctx
            .supervisor
            .subscriptions()
            .iter()
            .filter(|key| !self.records.get(*key).is_some_and(|r| r.observed))
            .cloned()
            .collect();
        for key in unseeded {
            if !ctx.supervisor.is_usable() {
                break;
            }
            match ctx.supervisor.transport_mut().fetch(&key) {
                Ok(remote) => self.seed(remote),
                Err(err) => {
                    if ctx.escalate(err, now)? == Action::LocalRetry {
                        self.create_remote(ctx, &key, now)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn receive_pushed<T: Transport>(
        &mut self,
        ctx: &mut SyncContext<'_, T>,
        timeout: Duration,
        now: Duration,
    ) -> SyncResult<()> {
        let messages = match ctx.supervisor.transport_mut().poll(timeout) {
            Ok(messages) => messages,
            Err(err) => {
                ctx.escalate(err, now)?;
                return Ok(());
            }
        };

        for message in messages {
            match message {
                InboundMessage::Feed(mut remote) => {
                    if ctx.supervisor.subscriptions().contains(&remote.key) {
                        if remote.updated_at.is_none() {
                            remote.updated_at = Some(self.arrival_stamp(ctx.clock));
                        }
                        self.observe(remote);
                    } else {
                        debug!(feed = %remote.key, "ignoring update for unsubscribed feed");
                    }
                }
                InboundMessage::WallClock(unix_secs) => ctx.clock.set_wall_clock(unix_secs),
                InboundMessage::Signal(err) => {
                    ctx.absorb(err, now)?;
                }
                InboundMessage::Note(body) => {
                    debug!(bytes = body.len(), "note received");
                    self.notes.push_back(body);
                    self.stats.notes_received += 1;
                }
            }
        }
        Ok(())
    }

    /// Stamps a pushed value that carries no service time with the synced
    /// wall clock, strictly after the previous arrival.
    fn arrival_stamp(&mut self, clock: &dyn Clock) -> RemoteTimestamp {
        let wall = RemoteTimestamp::from_unix(clock.wall_clock()).ok();
        let stamp = match (wall, self.last_arrival) {
            (Some(wall), Some(last)) if wall > last => wall,
            (Some(wall), None) => wall,
            (_, Some(last)) => last.next_millisecond(),
            (None, None) => RemoteTimestamp::now(),
        };
        self.last_arrival = Some(stamp);
        stamp
    }

    /// Applies one remote observation to the cache.
    ///
    /// The first observation of a feed only seeds the cache. Later ones are
    /// recorded as updates iff their timestamp is strictly newer than the
    /// cached one.
    fn observe(&mut self, remote: RemoteFeed) {
        let record = self.records.entry(remote.key.clone()).or_default();
        if !record.observed {
            Self::seed_record(record, remote);
            return;
        }

        let Some(updated_at) = remote.updated_at else {
            return;
        };
        if record
            .last_remote_update
            .is_some_and(|cached| updated_at <= cached)
        {
            return;
        }

        record.last_remote_update = Some(updated_at);
        if let Some(value) = remote.value {
            debug!(feed = %remote.key, at = %updated_at, "remote update");
            record.last_value = Some(value.clone());
            self.updates.insert(remote.key, value);
            self.stats.updates_received += 1;
        }
    }

    fn seed(&mut self, remote: RemoteFeed) {
        let record = self.records.entry(remote.key.clone()).or_default();
        Self::seed_record(record, remote);
    }

    fn seed_record(record: &mut FeedRecord, remote: RemoteFeed) {
        record.observed = true;
        if remote.updated_at > record.last_remote_update {
            record.last_remote_update = remote.updated_at;
            if remote.value.is_some() {
                record.last_value = remote.value;
            }
        }
    }

    fn note_published(&mut self, key: &FeedKey, value: &str, now: Duration) {
        let record = self.records.entry(key.clone()).or_default();
        record.last_value = Some(value.to_string());
        record.last_local_publish = Some(now);
        self.stats.feeds_sent += 1;
    }
}
