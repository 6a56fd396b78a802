//! Two-tier day-bucket cache.
//!
//! Reads hit a bounded in-process tier first, then a durable remote
//! key-value store; durable hits are promoted into the in-process tier.
//! Writes go to both tiers and also persist the recomputed per-day class
//! aggregate under a sibling key. Durable-store failures degrade to cache
//! misses; the bucket is simply rebuilt from source.

use crate::event_schema::{aggregate_rows, dedup_rows, row_ordering, DayEntry};
use crate::metrics::Metrics;
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Durable remote key-value tier. Implementations swallow their own
/// failures: `get` degrades to `None`, `set` to a no-op.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>);
}

/// Redis-backed durable tier.
pub struct RedisStore {
    manager: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let manager = ConnectionManager::new(client).await?;
        debug!("connected durable store at {}", redis_url);
        Ok(Self { manager })
    }
}

#[async_trait]
impl DurableStore for RedisStore {
    async fn get(&self, key: &str) -> Option<String> {
        let mut conn = self.manager.clone();
        match conn.get::<_, Option<String>>(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!("durable GET {} failed, treating as miss: {}", key, e);
                None
            }
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let mut conn = self.manager.clone();
        let result = match ttl {
            Some(ttl) => {
                conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
                    .await
            }
            None => conn.set::<_, _, ()>(key, value).await,
        };
        if let Err(e) = result {
            warn!("durable SET {} failed, write dropped: {}", key, e);
        }
    }
}

/// No-op durable tier used when no store is configured.
pub struct NullStore;

#[async_trait]
impl DurableStore for NullStore {
    async fn get(&self, _key: &str) -> Option<String> {
        None
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) {}
}

/// In-memory durable tier for tests and standalone runs. TTLs are recorded
/// but not enforced.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<HashMap<String, (String, Option<Duration>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry_ttl(&self, key: &str) -> Option<Option<Duration>> {
        self.inner.lock().get(key).map(|(_, ttl)| *ttl)
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().keys().cloned().collect()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get(&self, key: &str) -> Option<String> {
        self.inner.lock().get(key).map(|(value, _)| value.clone())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        self.inner
            .lock()
            .insert(key.to_string(), (value.to_string(), ttl));
    }
}

/// Key namespace derived from one contract generation's address + topic.
#[derive(Debug, Clone)]
pub struct CacheNamespace {
    contract: String,
    topic: String,
}

impl CacheNamespace {
    pub fn new(contract: &str, topic: &str) -> Self {
        Self {
            contract: contract.to_lowercase(),
            topic: topic.to_lowercase(),
        }
    }

    pub fn day_key(&self, day: i64) -> String {
        format!("arena:v2:{}:{}:day:{}", self.contract, self.topic, day)
    }

    pub fn aggregate_key(&self, day: i64) -> String {
        format!("arena:v2:{}:{}:agg:{}", self.contract, self.topic, day)
    }
}

/// Key format written before the cache-schema migration. Only consulted for
/// pre-cutover days, so a stale legacy entry can never mask fresh data.
pub fn legacy_day_key(day: i64) -> String {
    format!("arena:games:day:{}", day)
}

struct MemoryTier {
    entries: HashMap<String, DayEntry>,
    order: VecDeque<String>,
}

pub struct DayCache {
    durable: Arc<dyn DurableStore>,
    memory: Mutex<MemoryTier>,
    capacity: usize,
}

impl DayCache {
    pub fn new(durable: Arc<dyn DurableStore>, capacity: usize) -> Self {
        Self {
            durable,
            memory: Mutex::new(MemoryTier {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    /// Read a day bucket: in-process tier, then durable tier (promoted on
    /// hit). `allow_legacy_key` additionally accepts the pre-migration key
    /// format and must only be set for pre-cutover days.
    pub async fn get(
        &self,
        namespace: &CacheNamespace,
        day: i64,
        allow_legacy_key: bool,
    ) -> Option<DayEntry> {
        let key = namespace.day_key(day);

        if let Some(entry) = self.memory.lock().entries.get(&key).cloned() {
            Metrics::cache_memory_hit();
            return Some(entry);
        }

        if let Some(entry) = self.durable_entry(&key).await {
            Metrics::cache_durable_hit();
            self.insert_memory(key, entry.clone());
            return Some(entry);
        }

        if allow_legacy_key {
            if let Some(entry) = self.durable_entry(&legacy_day_key(day)).await {
                Metrics::cache_durable_hit();
                self.insert_memory(key, entry.clone());
                return Some(entry);
            }
        }

        Metrics::cache_miss();
        None
    }

    /// Write a day bucket to both tiers and persist its recomputed class
    /// aggregate under the sibling key.
    pub async fn put(
        &self,
        namespace: &CacheNamespace,
        day: i64,
        entry: &DayEntry,
        ttl: Option<Duration>,
    ) {
        self.insert_memory(namespace.day_key(day), entry.clone());

        match serde_json::to_string(entry) {
            Ok(json) => {
                self.durable
                    .set(&namespace.day_key(day), &json, ttl)
                    .await;
            }
            Err(e) => warn!("failed to serialize day {} entry: {}", day, e),
        }

        let aggregate = aggregate_rows(&entry.rows);
        match serde_json::to_string(&aggregate) {
            Ok(json) => {
                self.durable
                    .set(&namespace.aggregate_key(day), &json, ttl)
                    .await;
            }
            Err(e) => warn!("failed to serialize day {} aggregate: {}", day, e),
        }
    }

    async fn durable_entry(&self, key: &str) -> Option<DayEntry> {
        let raw = self.durable.get(key).await?;
        match serde_json::from_str(&raw) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("discarding undecodable cache entry {}: {}", key, e);
                None
            }
        }
    }

    /// Bounded FIFO: the oldest inserted key is evicted first. Eviction
    /// never touches the durable tier.
    fn insert_memory(&self, key: String, entry: DayEntry) {
        let mut memory = self.memory.lock();
        if memory.entries.insert(key.clone(), entry).is_none() {
            memory.order.push_back(key);
            while memory.order.len() > self.capacity {
                if let Some(evicted) = memory.order.pop_front() {
                    memory.entries.remove(&evicted);
                }
            }
        }
    }
}

/// Merge two day entries: union of rows deduplicated by stable key, sorted
/// by the result ordering, spanning both block ranges. Commutative and
/// idempotent.
pub fn merge_entries(a: &DayEntry, b: &DayEntry) -> DayEntry {
    let mut rows = a.rows.clone();
    rows.extend(b.rows.iter().cloned());
    let mut rows = dedup_rows(rows);
    rows.sort_by(row_ordering);

    DayEntry {
        from_block: a.from_block.min(b.from_block),
        to_block: a.to_block.max(b.to_block),
        rows,
        last_update: a.last_update.max(b.last_update),
    }
}

/// Merge where either side may be absent.
pub fn merge_optional(a: Option<DayEntry>, b: Option<DayEntry>) -> Option<DayEntry> {
    match (a, b) {
        (Some(a), Some(b)) => Some(merge_entries(&a, &b)),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::sample_row;
    use proptest::prelude::*;

    fn entry(from_block: u64, to_block: u64, rows: Vec<crate::event_schema::GameRow>) -> DayEntry {
        DayEntry {
            from_block,
            to_block,
            rows,
            last_update: 0,
        }
    }

    fn namespace() -> CacheNamespace {
        CacheNamespace::new("0xFEED", "0xT0")
    }

    #[tokio::test]
    async fn test_durable_hit_is_promoted_to_memory() {
        let store = Arc::new(MemoryStore::new());
        let cache = DayCache::new(store.clone(), 8);
        let ns = namespace();
        let stored = entry(10, 20, vec![sample_row("0xa", Some(0), 15)]);
        store
            .set(&ns.day_key(5), &serde_json::to_string(&stored).unwrap(), None)
            .await;

        let first = cache.get(&ns, 5, false).await.unwrap();
        assert_eq!(first, stored);
        // Second read must come from the in-process tier.
        assert!(cache.memory.lock().entries.contains_key(&ns.day_key(5)));
    }

    #[tokio::test]
    async fn test_legacy_key_only_when_allowed() {
        let store = Arc::new(MemoryStore::new());
        let cache = DayCache::new(store.clone(), 8);
        let ns = namespace();
        let stored = entry(10, 20, vec![sample_row("0xa", Some(0), 15)]);
        store
            .set(
                &legacy_day_key(3),
                &serde_json::to_string(&stored).unwrap(),
                None,
            )
            .await;

        assert!(cache.get(&ns, 3, false).await.is_none());
        assert_eq!(cache.get(&ns, 3, true).await.unwrap(), stored);
    }

    #[tokio::test]
    async fn test_put_persists_entry_and_aggregate() {
        let store = Arc::new(MemoryStore::new());
        let cache = DayCache::new(store.clone(), 8);
        let ns = namespace();
        let mut row = sample_row("0xa", Some(0), 15);
        row.winner_class = "warden".to_string();
        row.loser_class = "reaver".to_string();

        cache.put(&ns, 7, &entry(10, 20, vec![row]), None).await;

        assert!(store.entry_ttl(&ns.day_key(7)).is_some());
        let aggregate_json = store.get(&ns.aggregate_key(7)).await.unwrap();
        assert!(aggregate_json.contains("warden"));
    }

    #[tokio::test]
    async fn test_memory_tier_evicts_fifo() {
        let cache = DayCache::new(Arc::new(NullStore), 2);
        let ns = namespace();

        cache.put(&ns, 1, &entry(1, 1, vec![]), None).await;
        cache.put(&ns, 2, &entry(2, 2, vec![]), None).await;
        cache.put(&ns, 3, &entry(3, 3, vec![]), None).await;

        let memory = cache.memory.lock();
        assert!(!memory.entries.contains_key(&ns.day_key(1)));
        assert!(memory.entries.contains_key(&ns.day_key(2)));
        assert!(memory.entries.contains_key(&ns.day_key(3)));
    }

    #[tokio::test]
    async fn test_durable_failure_degrades_to_miss() {
        let cache = DayCache::new(Arc::new(NullStore), 2);
        assert!(cache.get(&namespace(), 1, true).await.is_none());
    }

    #[test]
    fn test_merge_bounds_and_dedup() {
        let shared = sample_row("0xa", Some(0), 15);
        let a = entry(10, 20, vec![shared.clone(), sample_row("0xb", Some(0), 12)]);
        let b = entry(5, 18, vec![shared, sample_row("0xc", Some(0), 17)]);

        let merged = merge_entries(&a, &b);
        assert_eq!(merged.from_block, 5);
        assert_eq!(merged.to_block, 20);
        assert_eq!(merged.rows.len(), 3);
    }

    #[test]
    fn test_merge_optional_passes_through_absent() {
        let a = entry(1, 2, vec![]);
        assert_eq!(merge_optional(Some(a.clone()), None).unwrap(), a);
        assert_eq!(merge_optional(None, Some(a.clone())).unwrap(), a);
        assert!(merge_optional(None, None).is_none());
    }

    fn arb_rows() -> impl Strategy<Value = Vec<crate::event_schema::GameRow>> {
        proptest::collection::vec((0u64..40, 0u64..4), 0..12).prop_map(|keys| {
            keys.into_iter()
                .map(|(tx, index)| {
                    // Key-consistent rows: the same (tx, index) always maps
                    // to identical content, as on a real chain.
                    sample_row(&format!("0x{:x}", tx), Some(index), 100 + tx * 2 + index)
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn prop_merge_commutative(rows_a in arb_rows(), rows_b in arb_rows()) {
            let a = entry(10, 50, rows_a);
            let b = entry(20, 80, rows_b);
            prop_assert_eq!(merge_entries(&a, &b), merge_entries(&b, &a));
        }

        #[test]
        fn prop_merge_idempotent(rows_a in arb_rows(), rows_b in arb_rows()) {
            let a = entry(10, 50, rows_a);
            let b = entry(20, 80, rows_b);
            let merged = merge_entries(&a, &b);
            prop_assert_eq!(merge_entries(&merged, &b), merged.clone());
            prop_assert_eq!(merge_entries(&merged, &merged), merged);
        }
    }
}
