//! Transport layer abstraction.

use crate::error::{TransportError, TransportResult};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;
use uplink_protocol::{FeedKey, RemoteTimestamp};

/// How a transport delivers remote updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveMode {
    /// The engine fetches every subscribed feed on each receive pass.
    Poll,
    /// The transport buffers pushed messages; the engine drains them with
    /// [`Transport::poll`].
    Push,
}

/// A remote feed as observed through a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFeed {
    /// Feed key.
    pub key: FeedKey,
    /// Latest value, `None` if the feed has never been written.
    pub value: Option<String>,
    /// When the service last wrote the feed.
    pub updated_at: Option<RemoteTimestamp>,
}

impl RemoteFeed {
    /// Creates an observation.
    pub fn new(key: FeedKey, value: Option<String>, updated_at: Option<RemoteTimestamp>) -> Self {
        Self {
            key,
            value,
            updated_at,
        }
    }
}

/// A message delivered by a push transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    /// Feed value update.
    Feed(RemoteFeed),
    /// Wall-clock broadcast, Unix seconds.
    WallClock(i64),
    /// A service notice (throttle, error) to be classified like a failure.
    Signal(TransportError),
    /// A message addressed to the device rather than to a feed, as JSON text.
    Note(String),
}

/// A channel to the remote telemetry service.
///
/// Implementations translate their wire-level failures into
/// [`TransportError`]; everything above this trait is transport-agnostic.
/// All calls must return within a bounded time.
pub trait Transport {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// How remote updates arrive.
    fn receive_mode(&self) -> ReceiveMode;

    /// Opens the channel.
    fn connect(&mut self) -> TransportResult<()>;

    /// Closes the channel. Never fails.
    fn disconnect(&mut self);

    /// Returns true while the channel is open.
    fn is_connected(&self) -> bool;

    /// Publishes one value to a feed.
    fn send(&mut self, key: &FeedKey, payload: &str, metadata: Option<&str>) -> TransportResult<()>;

    /// Reads the current state of a feed.
    fn fetch(&mut self, key: &FeedKey) -> TransportResult<RemoteFeed>;

    /// Creates a feed that does not exist yet.
    fn create_feed(&mut self, key: &FeedKey) -> TransportResult<()>;

    /// Starts receiving updates for a feed.
    fn subscribe(&mut self, _key: &FeedKey) -> TransportResult<()> {
        Ok(())
    }

    /// Stops receiving updates for a feed.
    fn unsubscribe(&mut self, _key: &FeedKey) -> TransportResult<()> {
        Ok(())
    }

    /// Drains inbound messages, waiting at most `timeout`.
    fn poll(&mut self, _timeout: Duration) -> TransportResult<Vec<InboundMessage>> {
        Ok(Vec::new())
    }

    /// Returns false when no feed can have changed since the previous call,
    /// letting a polling receive pass skip its fetches.
    fn remote_changed(&mut self) -> TransportResult<bool> {
        Ok(true)
    }

    /// Asks the service for the current wall-clock time in Unix seconds.
    fn time_sync(&mut self) -> TransportResult<Option<i64>> {
        Ok(None)
    }

    /// Pushes buffered outbound data upstream, for transports that buffer.
    fn flush(&mut self) -> TransportResult<()> {
        Ok(())
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn receive_mode(&self) -> ReceiveMode {
        (**self).receive_mode()
    }

    fn connect(&mut self) -> TransportResult<()> {
        (**self).connect()
    }

    fn disconnect(&mut self) {
        (**self).disconnect()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn send(&mut self, key: &FeedKey, payload: &str, metadata: Option<&str>) -> TransportResult<()> {
        (**self).send(key, payload, metadata)
    }

    fn fetch(&mut self, key: &FeedKey) -> TransportResult<RemoteFeed> {
        (**self).fetch(key)
    }

    fn create_feed(&mut self, key: &FeedKey) -> TransportResult<()> {
        (**self).create_feed(key)
    }

    fn subscribe(&mut self, key: &FeedKey) -> TransportResult<()> {
        (**self).subscribe(key)
    }

    fn unsubscribe(&mut self, key: &FeedKey) -> TransportResult<()> {
        (**self).unsubscribe(key)
    }

    fn poll(&mut self, timeout: Duration) -> TransportResult<Vec<InboundMessage>> {
        (**self).poll(timeout)
    }

    fn remote_changed(&mut self) -> TransportResult<bool> {
        (**self).remote_changed()
    }

    fn time_sync(&mut self) -> TransportResult<Option<i64>> {
        (**self).time_sync()
    }

    fn flush(&mut self) -> TransportResult<()> {
        (**self).flush()
    }
}

/// Operations a [`MockTransport`] failure can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    /// `connect`.
    Connect,
    /// `send`.
    Send,
    /// `fetch`.
    Fetch,
    /// `create_feed`.
    Create,
    /// `subscribe`.
    Subscribe,
    /// `poll`.
    Poll,
    /// `time_sync`.
    TimeSync,
}

/// A published value recorded by [`MockTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentValue {
    /// Target feed.
    pub key: FeedKey,
    /// Payload (one chunk for long values).
    pub payload: String,
    /// Attached metadata.
    pub metadata: Option<String>,
}

/// A scriptable in-memory transport for testing.
///
/// Remote feed state is set by the test with [`MockTransport::set_remote`];
/// sends are only recorded. Failures are queued per operation and consumed
/// in order.
#[derive(Debug)]
pub struct MockTransport {
    mode: ReceiveMode,
    connected: bool,
    remote: BTreeMap<FeedKey, RemoteFeed>,
    failures: VecDeque<(MockOp, usize, TransportError)>,
    inbound: VecDeque<InboundMessage>,
    sent: Vec<SentValue>,
    created: Vec<FeedKey>,
    subscriptions: BTreeSet<FeedKey>,
    subscribe_calls: Vec<FeedKey>,
    wall_clock: Option<i64>,
    strict_feeds: bool,
    changed: bool,
    connects: u32,
    disconnects: u32,
    fetches: u32,
    flushes: u32,
}

impl MockTransport {
    /// Creates a polling mock transport.
    pub fn new() -> Self {
        Self::with_mode(ReceiveMode::Poll)
    }

    /// Creates a mock transport with the given receive mode.
    pub fn with_mode(mode: ReceiveMode) -> Self {
        Self {
            mode,
            connected: false,
            remote: BTreeMap::new(),
            failures: VecDeque::new(),
            inbound: VecDeque::new(),
            sent: Vec::new(),
            created: Vec::new(),
            subscriptions: BTreeSet::new(),
            subscribe_calls: Vec::new(),
            wall_clock: None,
            strict_feeds: false,
            changed: true,
            connects: 0,
            disconnects: 0,
            fetches: 0,
            flushes: 0,
        }
    }

    /// Makes `send` fail with not-found for feeds that do not exist remotely.
    pub fn with_strict_feeds(mut self) -> Self {
        self.strict_feeds = true;
        self
    }

    /// Sets the wall-clock time returned by `time_sync`.
    pub fn with_wall_clock(mut self, unix_secs: i64) -> Self {
        self.wall_clock = Some(unix_secs);
        self
    }

    /// Sets what `remote_changed` reports.
    pub fn set_changed(&mut self, changed: bool) {
        self.changed = changed;
    }

    /// Sets the remote state of a feed.
    pub fn set_remote(&mut self, key: &FeedKey, value: &str, updated_at: RemoteTimestamp) {
        self.remote.insert(
            key.clone(),
            RemoteFeed::new(key.clone(), Some(value.to_string()), Some(updated_at)),
        );
    }

    /// Queues a failure for the next call of `op`.
    pub fn fail_next(&mut self, op: MockOp, err: TransportError) {
        self.fail_at(op, 0, err);
    }

    /// Queues a failure for `op` after `skip` further successful calls.
    pub fn fail_at(&mut self, op: MockOp, skip: usize, err: TransportError) {
        self.failures.push_back((op, skip, err));
    }

    /// Queues an inbound message for `poll`.
    pub fn push_inbound(&mut self, msg: InboundMessage) {
        self.inbound.push_back(msg);
    }

    /// Simulates the link dropping underneath the engine.
    pub fn drop_link(&mut self) {
        self.connected = false;
    }

    /// Values sent so far, in order.
    pub fn sent(&self) -> &[SentValue] {
        &self.sent
    }

    /// Feeds created so far, in order.
    pub fn created(&self) -> &[FeedKey] {
        &self.created
    }

    /// Every `subscribe` call, in order, including replays.
    pub fn subscribe_calls(&self) -> &[FeedKey] {
        &self.subscribe_calls
    }

    /// Feeds currently subscribed.
    pub fn subscriptions(&self) -> &BTreeSet<FeedKey> {
        &self.subscriptions
    }

    /// Number of successful connects.
    pub fn connects(&self) -> u32 {
        self.connects
    }

    /// Number of disconnects.
    pub fn disconnects(&self) -> u32 {
        self.disconnects
    }

    /// Number of fetch calls, including failed ones.
    pub fn fetches(&self) -> u32 {
        self.fetches
    }

    /// Number of flush calls.
    pub fn flushes(&self) -> u32 {
        self.flushes
    }

    fn take_failure(&mut self, op: MockOp) -> TransportResult<()> {
        let Some(index) = self.failures.iter().position(|(o, _, _)| *o == op) else {
            return Ok(());
        };
        if let Some((_, skip, _)) = self.failures.get_mut(index) {
            if *skip > 0 {
                *skip -= 1;
                return Ok(());
            }
        }
        match self.failures.remove(index) {
            Some((_, _, err)) => {
                if err.is_link_failure() {
                    self.connected = false;
                }
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn require_link(&self) -> TransportResult<()> {
        if self.connected {
            Ok(())
        } else {
            Err(TransportError::Connection("not connected".into()))
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn receive_mode(&self) -> ReceiveMode {
        self.mode
    }

    fn connect(&mut self) -> TransportResult<()> {
        self.take_failure(MockOp::Connect)?;
        self.connected = true;
        self.connects += 1;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
        self.disconnects += 1;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn send(&mut self, key: &FeedKey, payload: &str, metadata: Option<&str>) -> TransportResult<()> {
        self.require_link()?;
        self.take_failure(MockOp::Send)?;
        if self.strict_feeds && !self.remote.contains_key(key) {
            return Err(TransportError::NotFound(key.to_string()));
        }
        self.sent.push(SentValue {
            key: key.clone(),
            payload: payload.to_string(),
            metadata: metadata.map(str::to_string),
        });
        Ok(())
    }

    fn fetch(&mut self, key: &FeedKey) -> TransportResult<RemoteFeed> {
        self.fetches += 1;
        self.require_link()?;
        self.take_failure(MockOp::Fetch)?;
        self.remote
            .get(key)
            .cloned()
            .ok_or_else(|| TransportError::NotFound(key.to_string()))
    }

    fn create_feed(&mut self, key: &FeedKey) -> TransportResult<()> {
        self.require_link()?;
        self.take_failure(MockOp::Create)?;
        self.created.push(key.clone());
        self.remote
            .entry(key.clone())
            .or_insert_with(|| RemoteFeed::new(key.clone(), None, None));
        Ok(())
    }

    fn subscribe(&mut self, key: &FeedKey) -> TransportResult<()> {
        self.require_link()?;
        self.take_failure(MockOp::Subscribe)?;
        self.subscribe_calls.push(key.clone());
        self.subscriptions.insert(key.clone());
        Ok(())
    }

    fn unsubscribe(&mut self, key: &FeedKey) -> TransportResult<()> {
        self.require_link()?;
        self.subscriptions.remove(key);
        Ok(())
    }

    fn poll(&mut self, _timeout: Duration) -> TransportResult<Vec<InboundMessage>> {
        self.require_link()?;
        self.take_failure(MockOp::Poll)?;
        Ok(self.inbound.drain(..).collect())
    }

    fn remote_changed(&mut self) -> TransportResult<bool> {
        self.require_link()?;
        Ok(self.changed)
    }

    fn time_sync(&mut self) -> TransportResult<Option<i64>> {
        self.require_link()?;
        self.take_failure(MockOp::TimeSync)?;
        Ok(self.wall_clock)
    }

    fn flush(&mut self) -> TransportResult<()> {
        self.flushes += 1;
        Ok(())
    }
}
