//! Test rigs: an [`Uplink`] wired to a reference service.
//!
//! A rig owns one [`ManualClock`] for the engine and advances the service
//! clock in lockstep, so every timing rule can be exercised without sleeping.

use crate::loopback::{LoopbackHttpClient, LoopbackNoteClient, LoopbackPubSubClient};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use uplink_engine::{
    HttpTransport, ManualClock, PubSubTransport, StoreForwardTransport, SyncReport, SyncResult,
    Transport, Uplink, UplinkConfig,
};
use uplink_protocol::{Credentials, FeedKey, FeedName, RemoteTimestamp};
use uplink_service::{ServiceConfig, TelemetryService};

/// Account used by rigs.
pub const TEST_ACCOUNT: &str = "device";
/// API key used by rigs.
pub const TEST_KEY: &str = "aio_key";
/// Feed group used by rigs.
pub const TEST_GROUP: &str = "garden";

/// Default uplink configuration for rigs.
pub fn uplink_config() -> UplinkConfig {
    UplinkConfig::new(TEST_ACCOUNT, TEST_GROUP)
}

/// Default service configuration for rigs.
pub fn service_config() -> ServiceConfig {
    ServiceConfig::new(TEST_ACCOUNT, TEST_KEY)
}

/// Creates a shared service.
pub fn test_service(config: ServiceConfig) -> Arc<TelemetryService> {
    Arc::new(TelemetryService::new(config).expect("Failed to create service"))
}

fn credentials(config: &UplinkConfig) -> Credentials {
    Credentials::new(config.account.clone(), TEST_KEY)
}

/// HTTP transport over the loopback client.
pub fn http_transport(
    service: &Arc<TelemetryService>,
    config: &UplinkConfig,
) -> HttpTransport<LoopbackHttpClient> {
    HttpTransport::new(
        LoopbackHttpClient::new(Arc::clone(service)),
        credentials(config),
        config.group.clone(),
    )
    .with_timeout(config.request_timeout)
}

/// Pub/sub transport over the loopback client.
pub fn pubsub_transport(
    service: &Arc<TelemetryService>,
    config: &UplinkConfig,
) -> PubSubTransport<LoopbackPubSubClient> {
    PubSubTransport::new(
        LoopbackPubSubClient::new(Arc::clone(service)),
        credentials(config),
        config.group.clone(),
    )
    .with_wait(config.receive_timeout)
}

/// Store-and-forward transport over the loopback modem.
pub fn store_forward_transport(
    service: &Arc<TelemetryService>,
    config: &UplinkConfig,
) -> StoreForwardTransport<LoopbackNoteClient> {
    StoreForwardTransport::new(LoopbackNoteClient::new(Arc::clone(service)), config.group.clone())
}

/// The channel a rig talks over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// HTTP polling.
    Http,
    /// Pub/sub push.
    PubSub,
    /// Store-and-forward modem.
    StoreForward,
}

impl Channel {
    /// Every channel.
    pub const ALL: [Channel; 3] = [Channel::Http, Channel::PubSub, Channel::StoreForward];

    /// Builds a boxed transport for this channel.
    pub fn transport(
        self,
        service: &Arc<TelemetryService>,
        config: &UplinkConfig,
    ) -> Box<dyn Transport> {
        match self {
            Channel::Http => Box::new(http_transport(service, config)),
            Channel::PubSub => Box::new(pubsub_transport(service, config)),
            Channel::StoreForward => Box::new(store_forward_transport(service, config)),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Channel::Http => "http",
            Channel::PubSub => "pubsub",
            Channel::StoreForward => "store-forward",
        })
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Channel::Http),
            "pubsub" | "mqtt" => Ok(Channel::PubSub),
            "store-forward" | "notecard" => Ok(Channel::StoreForward),
            other => Err(format!("unknown channel: {other}")),
        }
    }
}

/// An uplink, its clock and the service it talks to.
pub struct Rig<T: Transport> {
    /// The reference service.
    pub service: Arc<TelemetryService>,
    /// Engine clock handle.
    pub clock: ManualClock,
    /// The engine under test.
    pub uplink: Uplink<T, ManualClock>,
}

impl<T: Transport> Rig<T> {
    /// Wires a transport to a service.
    pub fn new(service: Arc<TelemetryService>, transport: T, config: UplinkConfig) -> Self {
        let clock = ManualClock::new();
        let uplink =
            Uplink::new(config, transport, clock.clone()).expect("Failed to create uplink");
        Self {
            service,
            clock,
            uplink,
        }
    }

    /// Advances engine and service time together.
    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
        self.service.advance(by);
    }

    /// Advances time and runs one tick.
    pub fn step(&mut self, by: Duration) -> SyncResult<SyncReport> {
        self.advance(by);
        self.uplink.sync()
    }

    /// Runs `ticks` ticks `every` apart, stopping at the first error.
    pub fn run(&mut self, ticks: usize, every: Duration) -> SyncResult<()> {
        for _ in 0..ticks {
            self.step(every)?;
        }
        Ok(())
    }

    /// Writes a feed from the dashboard side.
    pub fn remote_write(&self, key: &str, value: &str) -> RemoteTimestamp {
        self.service
            .dashboard_write(&self.feed(key), value)
            .expect("Failed to write remote value")
    }

    /// Current remote value of a feed.
    pub fn remote_value(&self, key: &str) -> Option<String> {
        self.service
            .store()
            .feed(&self.feed(key))
            .ok()
            .and_then(|doc| doc.last_value)
    }

    fn feed(&self, key: &str) -> FeedName {
        FeedName::new(
            self.uplink.config().group.clone(),
            FeedKey::new(key).expect("Invalid feed key"),
        )
    }
}

impl Rig<HttpTransport<LoopbackHttpClient>> {
    /// HTTP rig with default configurations.
    pub fn http() -> Self {
        Self::http_with(uplink_config(), service_config())
    }

    /// HTTP rig.
    pub fn http_with(config: UplinkConfig, service: ServiceConfig) -> Self {
        let service = test_service(service);
        let transport = http_transport(&service, &config);
        Self::new(service, transport, config)
    }
}

impl Rig<PubSubTransport<LoopbackPubSubClient>> {
    /// Pub/sub rig with default configurations.
    pub fn pubsub() -> Self {
        Self::pubsub_with(uplink_config(), service_config())
    }

    /// Pub/sub rig.
    pub fn pubsub_with(config: UplinkConfig, service: ServiceConfig) -> Self {
        let service = test_service(service);
        let transport = pubsub_transport(&service, &config);
        Self::new(service, transport, config)
    }
}

impl Rig<StoreForwardTransport<LoopbackNoteClient>> {
    /// Store-and-forward rig with default configurations.
    pub fn store_forward() -> Self {
        Self::store_forward_with(uplink_config(), service_config())
    }

    /// Store-and-forward rig.
    pub fn store_forward_with(config: UplinkConfig, service: ServiceConfig) -> Self {
        let service = test_service(service);
        let transport = store_forward_transport(&service, &config);
        Self::new(service, transport, config)
    }
}

impl Rig<Box<dyn Transport>> {
    /// Rig over any channel.
    pub fn channel(channel: Channel, config: UplinkConfig, service: ServiceConfig) -> Self {
        let service = test_service(service);
        let transport = channel.transport(&service, &config);
        Self::new(service, transport, config)
    }
}
