//! Property-based test generators using proptest.

use proptest::prelude::*;
use std::collections::BTreeMap;
use std::time::Duration;
use uplink_engine::TransportError;
use uplink_service::Fault;

/// Strategy for valid feed keys.
pub fn feed_key_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9-]{0,15}").expect("Invalid regex")
}

/// Strategy for keys the engine must reject.
pub fn invalid_key_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just(String::new()),
        prop::string::string_regex("[a-z]{1,6}[ ._/#+][a-z]{1,6}").expect("Invalid regex"),
        prop::string::string_regex("[a-z]{129,140}").expect("Invalid regex"),
    ]
}

/// Strategy for payloads of up to `max_chars` arbitrary characters.
pub fn payload_strategy(max_chars: usize) -> impl Strategy<Value = String> {
    prop::collection::vec(any::<char>(), 0..=max_chars).prop_map(|chars| chars.into_iter().collect())
}

/// Strategy for short printable sensor readings.
pub fn reading_strategy() -> impl Strategy<Value = String> {
    (-500i32..500, 0u8..100).prop_map(|(whole, frac)| format!("{whole}.{frac:02}"))
}

/// Strategy for snapshots of up to `max_feeds` valid feeds.
pub fn snapshot_strategy(max_feeds: usize) -> impl Strategy<Value = BTreeMap<String, String>> {
    prop::collection::btree_map(feed_key_strategy(), reading_strategy(), 0..=max_feeds)
}

/// Strategy for injectable service faults.
pub fn fault_strategy() -> impl Strategy<Value = Fault> {
    prop_oneof![
        Just(Fault::Disconnect),
        Just(Fault::Timeout),
        Just(Fault::OutOfMemory),
        prop::sample::select(vec![400u16, 401, 404, 408, 429, 500, 502, 503]).prop_map(Fault::Status),
    ]
}

/// Strategy for raw transport errors.
pub fn transport_error_strategy() -> impl Strategy<Value = TransportError> {
    let detail = prop::string::string_regex("[a-z ]{0,12}").expect("Invalid regex");
    (0u8..9, detail).prop_map(|(variant, detail)| match variant {
        0 => TransportError::RateLimited(detail),
        1 => TransportError::NotFound(detail),
        2 => TransportError::Connection(detail),
        3 => TransportError::Malformed(detail),
        4 => TransportError::Timeout(Duration::from_millis(detail.len() as u64)),
        5 => TransportError::ResourceExhausted(detail),
        6 => TransportError::Auth(detail),
        7 => TransportError::Protocol(detail),
        _ => TransportError::Other(detail),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use uplink_protocol::FeedKey;

    proptest! {
        #[test]
        fn generated_keys_are_valid(key in feed_key_strategy()) {
            prop_assert!(FeedKey::new(key).is_ok());
        }

        #[test]
        fn invalid_keys_are_rejected(key in invalid_key_strategy()) {
            prop_assert!(FeedKey::new(key).is_err());
        }

        #[test]
        fn payloads_respect_length(payload in payload_strategy(50)) {
            prop_assert!(payload.chars().count() <= 50);
        }
    }
}
