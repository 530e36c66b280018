// Shared key-value store port and an in-process implementation.
//
// Deployments with more than one instance use `postgres::PgKeyValueStore`,
// which offers the same primitives (conditional writes with TTL, hashes,
// sorted sets, counters) against a shared database. `MemoryStore` provides
// the same semantics within one process and is what the test-suite and
// benches run against.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};

use crate::{
    clock::{elapsed_between, Clock},
    error::StoreError,
};

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    // Create `key` only if it does not exist. Returns false when it already does.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    // Overwrite `key` only if it exists, replacing its TTL.
    async fn set_if_present(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    // Remaining TTL, `None` when the key is missing or has no expiry
    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>>;

    async fn delete(&self, key: &str) -> StoreResult<bool>;

    // Delete `key` only while it still holds `expected`
    async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool>;

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;

    async fn hash_set_all(
        &self,
        key: &str,
        fields: &HashMap<String, String>,
        ttl: Option<Duration>,
    ) -> StoreResult<()>;

    // Merge `fields` into an existing live hash. Returns false, writing
    // nothing, when the hash is gone.
    async fn hash_update_if_present(
        &self,
        key: &str,
        fields: &HashMap<String, String>,
        ttl: Option<Duration>,
    ) -> StoreResult<bool>;

    async fn hash_get_all(&self, key: &str) -> StoreResult<Option<HashMap<String, String>>>;

    async fn sorted_add(&self, key: &str, member: &str, score: f64) -> StoreResult<()>;

    // Members with `min <= score <= max`, ascending by score
    async fn sorted_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> StoreResult<Vec<(String, f64)>>;

    async fn sorted_remove(&self, key: &str, member: &str) -> StoreResult<bool>;

    async fn increment_by(&self, key: &str, delta: i64) -> StoreResult<i64>;

    async fn get_counter(&self, key: &str) -> StoreResult<i64>;

    // Physically drop expired keys. Reads already ignore them.
    async fn purge_expired(&self) -> StoreResult<u64>;
}

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Hash(HashMap<String, String>),
    Sorted(HashMap<String, f64>),
    Counter(i64),
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredValue {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
}

fn wrong_type(key: &str, expected: &'static str) -> StoreError {
    StoreError::WrongType {
        key: key.to_string(),
        expected,
    }
}

pub struct MemoryStore {
    data: DashMap<String, StoredValue>,
    clock: Arc<dyn Clock>,
    fail_next_ops: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            data: DashMap::new(),
            clock,
            fail_next_ops: AtomicUsize::new(0),
            unavailable: AtomicBool::new(false),
        }
    }

    // Make the next `count` operations fail with `StoreError::Unavailable`
    pub fn fail_next_ops(&self, count: usize) {
        self.fail_next_ops.store(count, Ordering::SeqCst);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    // Number of live keys
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.data.iter().filter(|e| e.value().is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store marked unavailable".to_string()));
        }
        let injected = self
            .fail_next_ops
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }

    // Drop `key` if its TTL has passed, then run `f` on the live value
    fn with_live<T>(&self, key: &str, f: impl FnOnce(Option<&StoredValue>) -> T) -> T {
        let now = self.clock.now();
        self.data.remove_if(key, |_, v| !v.is_live(now));
        let current = self.data.get(key);
        f(current.as_deref())
    }

    fn live_entry(&self, key: &str) -> Entry<'_, String, StoredValue> {
        let now = self.clock.now();
        self.data.remove_if(key, |_, v| !v.is_live(now));
        self.data.entry(key.to_string())
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.check_available()?;
        let expires_at = expiry(self.clock.now(), ttl);
        match self.live_entry(key) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(StoredValue {
                    value: Value::Text(value.to_string()),
                    expires_at,
                });
                Ok(true)
            }
        }
    }

    async fn set_if_present(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.check_available()?;
        let expires_at = expiry(self.clock.now(), ttl);
        match self.live_entry(key) {
            Entry::Occupied(mut slot) => {
                slot.insert(StoredValue {
                    value: Value::Text(value.to_string()),
                    expires_at,
                });
                Ok(true)
            }
            Entry::Vacant(_) => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_available()?;
        self.with_live(key, |v| match v.map(|v| &v.value) {
            None => Ok(None),
            Some(Value::Text(s)) => Ok(Some(s.clone())),
            Some(Value::Counter(n)) => Ok(Some(n.to_string())),
            Some(_) => Err(wrong_type(key, "string")),
        })
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        self.check_available()?;
        let now = self.clock.now();
        Ok(self.with_live(key, |v| {
            v.and_then(|v| v.expires_at)
                .map(|at| elapsed_between(now, at))
        }))
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.check_available()?;
        let now = self.clock.now();
        Ok(self
            .data
            .remove(key)
            .map_or(false, |(_, v)| v.is_live(now)))
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool> {
        self.check_available()?;
        let now = self.clock.now();
        let removed = self.data.remove_if(key, |_, v| {
            v.is_live(now) && matches!(&v.value, Value::Text(s) if s == expected)
        });
        Ok(removed.is_some())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.check_available()?;
        let now = self.clock.now();
        let mut keys: Vec<String> = self
            .data
            .iter()
            .filter(|e| e.key().starts_with(prefix) && e.value().is_live(now))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn hash_set_all(
        &self,
        key: &str,
        fields: &HashMap<String, String>,
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        self.check_available()?;
        let now = self.clock.now();
        match self.live_entry(key) {
            Entry::Occupied(mut slot) => {
                let stored = slot.get_mut();
                let Value::Hash(existing) = &mut stored.value else {
                    return Err(wrong_type(key, "hash"));
                };
                existing.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
                if let Some(ttl) = ttl {
                    stored.expires_at = expiry(now, ttl);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(StoredValue {
                    value: Value::Hash(fields.clone()),
                    expires_at: ttl.and_then(|ttl| expiry(now, ttl)),
                });
            }
        }
        Ok(())
    }

    async fn hash_update_if_present(
        &self,
        key: &str,
        fields: &HashMap<String, String>,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        self.check_available()?;
        let now = self.clock.now();
        match self.live_entry(key) {
            Entry::Occupied(mut slot) => {
                let stored = slot.get_mut();
                let Value::Hash(existing) = &mut stored.value else {
                    return Err(wrong_type(key, "hash"));
                };
                existing.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
                if let Some(ttl) = ttl {
                    stored.expires_at = expiry(now, ttl);
                }
                Ok(true)
            }
            Entry::Vacant(_) => Ok(false),
        }
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<Option<HashMap<String, String>>> {
        self.check_available()?;
        self.with_live(key, |v| match v.map(|v| &v.value) {
            None => Ok(None),
            Some(Value::Hash(h)) => Ok(Some(h.clone())),
            Some(_) => Err(wrong_type(key, "hash")),
        })
    }

    async fn sorted_add(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        self.check_available()?;
        let mut slot = self
            .live_entry(key)
            .or_insert_with(|| StoredValue {
                value: Value::Sorted(HashMap::new()),
                expires_at: None,
            });
        let Value::Sorted(members) = &mut slot.value else {
            return Err(wrong_type(key, "sorted set"));
        };
        members.insert(member.to_string(), score);
        Ok(())
    }

    async fn sorted_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> StoreResult<Vec<(String, f64)>> {
        self.check_available()?;
        self.with_live(key, |v| match v.map(|v| &v.value) {
            None => Ok(Vec::new()),
            Some(Value::Sorted(members)) => {
                let mut hits: Vec<(String, f64)> = members
                    .iter()
                    .filter(|(_, score)| **score >= min && **score <= max)
                    .map(|(m, s)| (m.clone(), *s))
                    .collect();
                hits.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
                Ok(hits)
            }
            Some(_) => Err(wrong_type(key, "sorted set")),
        })
    }

    async fn sorted_remove(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.check_available()?;
        match self.live_entry(key) {
            Entry::Occupied(mut slot) => {
                let Value::Sorted(members) = &mut slot.get_mut().value else {
                    return Err(wrong_type(key, "sorted set"));
                };
                let removed = members.remove(member).is_some();
                if members.is_empty() {
                    slot.remove();
                }
                Ok(removed)
            }
            Entry::Vacant(_) => Ok(false),
        }
    }

    async fn increment_by(&self, key: &str, delta: i64) -> StoreResult<i64> {
        self.check_available()?;
        let mut slot = self
            .live_entry(key)
            .or_insert_with(|| StoredValue {
                value: Value::Counter(0),
                expires_at: None,
            });
        let current = match &slot.value {
            Value::Counter(n) => *n,
            Value::Text(s) => s
                .parse::<i64>()
                .map_err(|_| StoreError::InvalidCounter(key.to_string()))?,
            _ => return Err(wrong_type(key, "counter")),
        };
        let next = current + delta;
        slot.value = Value::Counter(next);
        Ok(next)
    }

    async fn get_counter(&self, key: &str) -> StoreResult<i64> {
        self.check_available()?;
        self.with_live(key, |v| match v.map(|v| &v.value) {
            None => Ok(0),
            Some(Value::Counter(n)) => Ok(*n),
            Some(Value::Text(s)) => s
                .parse::<i64>()
                .map_err(|_| StoreError::InvalidCounter(key.to_string())),
            Some(_) => Err(wrong_type(key, "counter")),
        })
    }

    async fn purge_expired(&self) -> StoreResult<u64> {
        self.check_available()?;
        let now = self.clock.now();
        let before = self.data.len();
        self.data.retain(|_, v| v.is_live(now));
        Ok(before.saturating_sub(self.data.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use assert_matches::assert_matches;

    fn store() -> (MemoryStore, ManualClock) {
        let clock = ManualClock::default();
        (MemoryStore::new(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_set_if_absent_respects_ttl() {
        let (store, clock) = store();
        let ttl = Duration::from_secs(10);

        assert!(store.set_if_absent("k", "a", ttl).await.unwrap());
        assert!(!store.set_if_absent("k", "b", ttl).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));

        clock.advance(Duration::from_secs(10));
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.set_if_absent("k", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_set_if_present_only_overwrites_live_keys() {
        let (store, clock) = store();
        assert!(!store
            .set_if_present("k", "a", Duration::from_secs(5))
            .await
            .unwrap());

        store
            .set_if_absent("k", "a", Duration::from_secs(5))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(2));
        assert_eq!(
            store.ttl("k").await.unwrap(),
            Some(Duration::from_secs(3))
        );

        assert!(store
            .set_if_present("k", "b", Duration::from_secs(20))
            .await
            .unwrap());
        assert_eq!(
            store.ttl("k").await.unwrap(),
            Some(Duration::from_secs(20))
        );
    }

    #[tokio::test]
    async fn test_delete_if_equals() {
        let (store, _) = store();
        store
            .set_if_absent("guard", "owner-1", Duration::from_secs(5))
            .await
            .unwrap();

        assert!(!store.delete_if_equals("guard", "owner-2").await.unwrap());
        assert!(store.delete_if_equals("guard", "owner-1").await.unwrap());
        assert!(!store.delete("guard").await.unwrap());
    }

    #[tokio::test]
    async fn test_prefix_scan_skips_expired() {
        let (store, clock) = store();
        store
            .set_if_absent("room:1:a", "x", Duration::from_secs(1))
            .await
            .unwrap();
        store
            .set_if_absent("room:1:b", "x", Duration::from_secs(60))
            .await
            .unwrap();
        store
            .set_if_absent("room:10:a", "x", Duration::from_secs(60))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(2));
        let keys = store.keys_with_prefix("room:1:").await.unwrap();
        assert_eq!(keys, vec!["room:1:b".to_string()]);
    }

    #[tokio::test]
    async fn test_hash_update_only_touches_live_hashes() {
        let (store, clock) = store();
        let fields = HashMap::from([("retry_count".to_string(), "1".to_string())]);

        assert!(!store
            .hash_update_if_present("h", &fields, None)
            .await
            .unwrap());
        assert_eq!(store.hash_get_all("h").await.unwrap(), None);

        let initial = HashMap::from([
            ("retry_count".to_string(), "0".to_string()),
            ("error_type".to_string(), "pms_failure".to_string()),
        ]);
        store
            .hash_set_all("h", &initial, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(store
            .hash_update_if_present("h", &fields, Some(Duration::from_secs(5)))
            .await
            .unwrap());
        let stored = store.hash_get_all("h").await.unwrap().unwrap();
        assert_eq!(stored["retry_count"], "1");
        assert_eq!(stored["error_type"], "pms_failure");

        clock.advance(Duration::from_secs(5));
        assert!(!store
            .hash_update_if_present("h", &fields, None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_sorted_set_range_and_remove() {
        let (store, _) = store();
        store.sorted_add("z", "b", 20.0).await.unwrap();
        store.sorted_add("z", "a", 10.0).await.unwrap();
        store.sorted_add("z", "c", 30.0).await.unwrap();
        store.sorted_add("z", "a", 15.0).await.unwrap();

        let hits = store.sorted_range_by_score("z", 0.0, 20.0).await.unwrap();
        assert_eq!(
            hits,
            vec![("a".to_string(), 15.0), ("b".to_string(), 20.0)]
        );

        assert!(store.sorted_remove("z", "a").await.unwrap());
        assert!(!store.sorted_remove("z", "a").await.unwrap());
    }

    #[tokio::test]
    async fn test_counters_and_wrong_type() {
        let (store, _) = store();
        assert_eq!(store.get_counter("size").await.unwrap(), 0);
        assert_eq!(store.increment_by("size", 2).await.unwrap(), 2);
        assert_eq!(store.increment_by("size", -1).await.unwrap(), 1);

        store.sorted_add("z", "a", 1.0).await.unwrap();
        assert_matches!(
            store.increment_by("z", 1).await,
            Err(StoreError::WrongType { .. })
        );
    }

    #[tokio::test]
    async fn test_purge_expired_drops_only_dead_keys() {
        let (store, clock) = store();
        store
            .set_if_absent("short", "x", Duration::from_secs(1))
            .await
            .unwrap();
        store
            .set_if_absent("long", "x", Duration::from_secs(60))
            .await
            .unwrap();
        store.increment_by("size", 1).await.unwrap();

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert_eq!(store.len(), 2);
        assert_eq!(store.purge_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let (store, _) = store();
        store.fail_next_ops(1);
        assert_matches!(store.get("k").await, Err(StoreError::Unavailable(_)));
        assert!(store.get("k").await.is_ok());

        store.set_unavailable(true);
        assert!(store.get_counter("k").await.is_err());
        store.set_unavailable(false);
        assert!(store.get_counter("k").await.is_ok());
    }
}
