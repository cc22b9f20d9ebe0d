//! In-memory feed storage and service time.

use crate::error::{ServiceError, ServiceResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use uplink_protocol::{FeedDocument, FeedEnvelope, FeedName, GroupDocument, RemoteTimestamp};

/// Service-controlled wall clock.
///
/// Time only moves when [`advance`](Self::advance) or [`set`](Self::set) is
/// called, so write stamps are deterministic.
#[derive(Debug)]
pub struct ServiceClock {
    millis: AtomicI64,
}

impl ServiceClock {
    /// Creates a clock at `start_millis` (Unix milliseconds).
    pub fn new(start_millis: i64) -> Self {
        Self {
            millis: AtomicI64::new(start_millis),
        }
    }

    /// Current Unix milliseconds.
    pub fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }

    /// Current Unix seconds.
    pub fn now_secs(&self) -> i64 {
        self.now_millis().div_euclid(1000)
    }

    /// Current time as a timestamp.
    pub fn now(&self) -> ServiceResult<RemoteTimestamp> {
        RemoteTimestamp::from_unix_millis(self.now_millis())
            .map_err(|e| ServiceError::Internal(e.to_string()))
    }

    /// Moves time forward.
    pub fn advance(&self, by: Duration) {
        let by = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.millis.fetch_add(by, Ordering::SeqCst);
    }

    /// Jumps to an absolute time.
    pub fn set(&self, millis: i64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Default)]
struct FeedEntry {
    last_value: Option<String>,
    updated_at: Option<RemoteTimestamp>,
    metadata: Option<String>,
}

#[derive(Debug, Default)]
struct Group {
    feeds: BTreeMap<String, FeedEntry>,
}

/// Groups and their feeds.
///
/// Every write is stamped with the service time. Stamps of one feed are
/// strictly increasing: a write landing in the same millisecond as the
/// previous one is moved one millisecond later.
pub struct FeedStore {
    groups: RwLock<BTreeMap<String, Group>>,
    max_feeds_per_group: usize,
}

impl FeedStore {
    /// Creates an empty store.
    pub fn new(max_feeds_per_group: usize) -> Self {
        Self {
            groups: RwLock::new(BTreeMap::new()),
            max_feeds_per_group,
        }
    }

    /// Returns a group with its feeds.
    pub fn group(&self, group: &str) -> ServiceResult<GroupDocument> {
        let groups = self.groups.read();
        let found = groups
            .get(group)
            .ok_or_else(|| ServiceError::NotFound(format!("group {group}")))?;
        Ok(GroupDocument {
            key: group.to_string(),
            feeds: found
                .feeds
                .iter()
                .map(|(key, entry)| document(group, key, entry))
                .collect(),
        })
    }

    /// Creates a group. Creating an existing group is a no-op.
    pub fn create_group(&self, group: &str) -> ServiceResult<GroupDocument> {
        uplink_protocol::validate_key(group)
            .map_err(|e| ServiceError::InvalidRequest(e.to_string()))?;
        self.groups.write().entry(group.to_string()).or_default();
        self.group(group)
    }

    /// Returns true if the group exists.
    pub fn has_group(&self, group: &str) -> bool {
        self.groups.read().contains_key(group)
    }

    /// Creates a feed. Returns true if it did not exist.
    ///
    /// With `create_group` false a missing group is an error.
    pub fn create_feed(&self, name: &FeedName, create_group: bool) -> ServiceResult<bool> {
        let mut groups = self.groups.write();
        if !groups.contains_key(&name.group) {
            if !create_group {
                return Err(ServiceError::NotFound(format!("group {}", name.group)));
            }
            groups.insert(name.group.clone(), Group::default());
        }
        let group = groups
            .get_mut(&name.group)
            .ok_or_else(|| ServiceError::Internal("group vanished".into()))?;
        if group.feeds.contains_key(name.key.as_str()) {
            return Ok(false);
        }
        if group.feeds.len() >= self.max_feeds_per_group {
            return Err(ServiceError::LimitReached(format!(
                "group {} holds {} feeds",
                name.group, self.max_feeds_per_group
            )));
        }
        group
            .feeds
            .insert(name.key.as_str().to_string(), FeedEntry::default());
        Ok(true)
    }

    /// Returns a feed.
    pub fn feed(&self, name: &FeedName) -> ServiceResult<FeedDocument> {
        let groups = self.groups.read();
        groups
            .get(&name.group)
            .and_then(|group| group.feeds.get(name.key.as_str()))
            .map(|entry| document(&name.group, name.key.as_str(), entry))
            .ok_or_else(|| ServiceError::NotFound(format!("feed {name}")))
    }

    /// Returns a feed in push-channel form.
    pub fn envelope(&self, name: &FeedName) -> ServiceResult<FeedEnvelope> {
        let groups = self.groups.read();
        groups
            .get(&name.group)
            .and_then(|group| group.feeds.get(name.key.as_str()))
            .map(|entry| FeedEnvelope {
                value: entry.last_value.clone(),
                created_at: entry.updated_at,
                metadata: entry.metadata.clone(),
            })
            .ok_or_else(|| ServiceError::NotFound(format!("feed {name}")))
    }

    /// Writes a value to an existing feed and returns its stamp.
    pub fn write(
        &self,
        name: &FeedName,
        value: &str,
        metadata: Option<&str>,
        now: RemoteTimestamp,
    ) -> ServiceResult<RemoteTimestamp> {
        let mut groups = self.groups.write();
        let entry = groups
            .get_mut(&name.group)
            .and_then(|group| group.feeds.get_mut(name.key.as_str()))
            .ok_or_else(|| ServiceError::NotFound(format!("feed {name}")))?;

        let stamp = match entry.updated_at {
            Some(last) if last >= now => last.next_millisecond(),
            _ => now,
        };
        entry.last_value = Some(value.to_string());
        entry.updated_at = Some(stamp);
        entry.metadata = metadata.map(str::to_string);
        Ok(stamp)
    }

    /// Newest write across every feed, if any feed was ever written.
    pub fn last_modified(&self) -> Option<RemoteTimestamp> {
        self.groups
            .read()
            .values()
            .flat_map(|group| group.feeds.values())
            .filter_map(|entry| entry.updated_at)
            .max()
    }

    /// Number of feeds across all groups.
    pub fn feed_count(&self) -> usize {
        self.groups.read().values().map(|g| g.feeds.len()).sum()
    }
}

fn document(group: &str, key: &str, entry: &FeedEntry) -> FeedDocument {
    FeedDocument {
        key: format!("{group}.{key}"),
        last_value: entry.last_value.clone(),
        updated_at: entry.updated_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uplink_protocol::FeedKey;

    fn name(k: &str) -> FeedName {
        FeedName::new("garden", FeedKey::new(k).unwrap())
    }

    #[test]
    fn clock_moves_only_when_told() {
        let clock = ServiceClock::new(1_000_000);
        assert_eq!(clock.now_secs(), 1000);
        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now_millis(), 1_001_500);
        clock.set(5_000);
        assert_eq!(clock.now_secs(), 5);
    }

    #[test]
    fn feed_requires_group_unless_asked() {
        let store = FeedStore::new(10);
        assert!(matches!(
            store.create_feed(&name("temp"), false),
            Err(ServiceError::NotFound(_))
        ));
        assert!(store.create_feed(&name("temp"), true).unwrap());
        assert!(!store.create_feed(&name("temp"), false).unwrap());
        assert_eq!(store.group("garden").unwrap().feeds.len(), 1);
    }

    #[test]
    fn new_feed_has_no_value() {
        let store = FeedStore::new(10);
        store.create_feed(&name("temp"), true).unwrap();
        let doc = store.feed(&name("temp")).unwrap();
        assert_eq!(doc.key, "garden.temp");
        assert!(doc.last_value.is_none());
        assert!(doc.updated_at.is_none());
    }

    #[test]
    fn write_stamps_strictly_increase() {
        let store = FeedStore::new(10);
        store.create_feed(&name("temp"), true).unwrap();
        let now = RemoteTimestamp::from_unix(1_700_000_000).unwrap();
        let a = store.write(&name("temp"), "1", None, now).unwrap();
        let b = store.write(&name("temp"), "2", Some("here"), now).unwrap();
        assert_eq!(a, now);
        assert!(b > a);
        let env = store.envelope(&name("temp")).unwrap();
        assert_eq!(env.value.as_deref(), Some("2"));
        assert_eq!(env.metadata.as_deref(), Some("here"));
    }

    #[test]
    fn write_to_missing_feed_fails() {
        let store = FeedStore::new(10);
        let now = RemoteTimestamp::from_unix(0).unwrap();
        assert!(matches!(
            store.write(&name("temp"), "1", None, now),
            Err(ServiceError::NotFound(_))
        ));
    }

    #[test]
    fn feed_cap() {
        let store = FeedStore::new(1);
        store.create_feed(&name("a"), true).unwrap();
        assert!(matches!(
            store.create_feed(&name("b"), true),
            Err(ServiceError::LimitReached(_))
        ));
        assert_eq!(store.feed_count(), 1);
    }
}
