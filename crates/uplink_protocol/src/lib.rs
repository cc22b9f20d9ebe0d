//! # Uplink Protocol
//!
//! Addressing and wire types shared by the uplink engine and the reference
//! telemetry service.
//!
//! This crate provides:
//! - `FeedKey` / `FeedName` validation and formatting
//! - `Topic` layout for push-style transports
//! - `RemoteTimestamp` for ordering remote feed updates
//! - Payload chunking for long publishes
//! - JSON documents and request/response types for the polling channel
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod chunk;
mod error;
mod feed;
mod messages;
mod timestamp;
mod topic;

pub use chunk::{split_chunks, DEFAULT_CHUNK_SIZE, MIN_CHUNK_SIZE};
pub use error::{ProtocolError, ProtocolResult};
pub use feed::{validate_key, Credentials, FeedKey, FeedName, MAX_KEY_LEN};
pub use messages::{
    feed_data_path, feed_path, group_feeds_path, group_path, groups_path, DataPoint,
    FeedDocument, FeedEnvelope, GroupDocument, HttpMethod, HttpRequest, HttpResponse, NewFeed,
    NewFeedBody, NewGroup, ServiceNotice, API_KEY_HEADER, TIME_PATH,
};
pub use timestamp::RemoteTimestamp;
pub use topic::{Topic, TopicFormat};
