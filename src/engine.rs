pub mod builder;
mod flight;
mod get_or_load;

pub use builder::EngineBuilder;
pub use get_or_load::GetOrLoad;

use std::cmp::Reverse;
use std::future::Future;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use hashbrown::hash_map::{DefaultHashBuilder, HashMap};
use hashbrown::raw::RawTable;
use parking_lot::{Mutex, RwLock};
use priority_queue::PriorityQueue;
use tokio::time::Instant;
use tracing::trace;

use crate::entry::CacheEntry;
use flight::Flight;

/// A sharded, self-populating store of [`CacheEntry`] values.
///
/// Misses are resolved by [`StorageEngine::get_or_load`], which runs at most one load per key at a time.
/// Entries expire `time_to_live` after they were loaded and are pruned lazily when their shard stores a new entry,
/// when a capacity is set the entries closest to expiry are evicted first.
pub struct StorageEngine<K, V, E, S = DefaultHashBuilder> {
    pub(crate) build_hasher: S,
    shards: Box<[Shard<K, V, E>]>,
    pub(crate) time_to_live: Duration,
    max_entries: Option<usize>,
}

pub(crate) struct Shard<K, V, E> {
    pub(crate) flights: Mutex<HashMap<K, Arc<Flight<E>>>>,
    table: RwLock<RawTable<Slot<K, V>>>,
    // lock order is expiry then table
    expiry: Mutex<PriorityQueue<K, Reverse<Instant>>>,
}

struct Slot<K, V> {
    key: K,
    entry: Arc<CacheEntry<V>>,
}

impl<K: Eq + Hash, V, E> StorageEngine<K, V, E> {
    pub fn new(time_to_live: Duration) -> Self {
        EngineBuilder::new(time_to_live).build(Default::default())
    }

    pub fn with_capacity(time_to_live: Duration, max_entries: usize) -> Self {
        EngineBuilder::new(time_to_live)
            .max_entries(max_entries)
            .build(Default::default())
    }
}

impl<K, V, E, S> StorageEngine<K, V, E, S> {
    /// Number of resident entries, including expired ones that have not been pruned yet
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.table.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn time_to_live(&self) -> Duration {
        self.time_to_live
    }
}

impl<K, V, E, S> StorageEngine<K, V, E, S>
where
    K: Eq + Hash + Clone,
    S: BuildHasher,
{
    /// Get the live entry for `key`, or load it with `init`
    ///
    /// If another task is already loading this key, this waits for that load instead and
    /// observes the same entry or the same error. If the loading task is dropped before it
    /// finishes one of the waiters takes over.
    ///
    /// A hit records an access on the entry.
    pub fn get_or_load<F, Fut>(&self, key: K, init: F) -> GetOrLoad<'_, K, V, E, S, F, Fut>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>, E>>,
    {
        GetOrLoad::Lookup {
            engine: self,
            key,
            init: Some(init),
        }
    }

    /// Get the live entry for `key` without recording an access.
    pub fn peek(&self, key: &K) -> Option<Arc<CacheEntry<V>>> {
        let (hash, shard) = self.shard(key);

        shard.get_live(key, hash, Instant::now())
    }

    /// Remove the entry for `key`, returning it if it was present.
    ///
    /// A load in flight for this key is unaffected and will store its result when it lands.
    pub fn remove(&self, key: &K) -> Option<Arc<CacheEntry<V>>> {
        let (hash, shard) = self.shard(key);

        let removed = shard.remove(key, hash);
        if removed.is_some() {
            shard.untrack(key, hash);
        }

        removed
    }

    /// Remove every entry.
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            let mut expiry = shard.expiry.lock();

            shard.table.write().clear();
            expiry.clear();
        }
    }

    /// True if `entry` is still the one stored for `key`
    pub(crate) fn is_current(&self, key: &K, entry: &Arc<CacheEntry<V>>) -> bool {
        let (hash, shard) = self.shard(key);

        shard
            .get(key, hash)
            .is_some_and(|current| Arc::ptr_eq(&current, entry))
    }

    /// Swap `current` for a freshly loaded entry, unless it was replaced or removed in the meantime.
    pub(crate) fn replace(
        &self,
        key: &K,
        current: &Arc<CacheEntry<V>>,
        value: Option<V>,
    ) -> Option<Arc<CacheEntry<V>>> {
        let (hash, shard) = self.shard(key);
        let fresh = Arc::new(CacheEntry::new(value, Instant::now(), self.time_to_live));

        if !shard.replace(key, hash, current, Arc::clone(&fresh)) {
            return None;
        }

        self.track(key.clone(), fresh.expires());

        Some(fresh)
    }

    /// Remove `current`, unless it was replaced or removed in the meantime.
    pub(crate) fn remove_current(&self, key: &K, current: &Arc<CacheEntry<V>>) -> bool {
        let (hash, shard) = self.shard(key);

        let removed = shard
            .remove_if(key, hash, |entry| Arc::ptr_eq(entry, current))
            .is_some();
        if removed {
            shard.untrack(key, hash);
        }

        removed
    }

    pub(crate) fn shard(&self, key: &K) -> (u64, &Shard<K, V, E>) {
        let hash = hash_key(&self.build_hasher, key);

        // shards is a power of two and never empty
        let idx = hash as usize & (self.shards.len() - 1);
        (hash, &self.shards[idx])
    }

    /// Record the expiry of a newly stored entry, then drop whatever has expired in its shard or no longer fits.
    pub(crate) fn track(&self, key: K, expires: Instant) {
        let now = Instant::now();
        let (_, shard) = self.shard(&key);

        {
            let mut expiry = shard.expiry.lock();
            expiry.push(key, Reverse(expires));

            while let Some((_, Reverse(at))) = expiry.peek() {
                if *at > now {
                    break;
                }

                if let Some((key, _)) = expiry.pop() {
                    let hash = hash_key(&self.build_hasher, &key);
                    shard.remove_if(&key, hash, |entry| entry.is_expired(now));
                }
            }
        }

        if let Some(max_entries) = self.max_entries {
            while self.len() > max_entries {
                if !self.evict_one() {
                    break;
                }
            }
        }
    }

    /// Evict the tracked entry closest to expiry across all shards.
    fn evict_one(&self) -> bool {
        let victim = self
            .shards
            .iter()
            .filter_map(|shard| {
                let expiry = shard.expiry.lock();
                let head = expiry.peek().map(|(_, Reverse(at))| (*at, shard));
                head
            })
            .min_by_key(|(at, _)| *at);

        let Some((_, shard)) = victim else {
            return false;
        };

        let mut expiry = shard.expiry.lock();
        match expiry.pop() {
            Some((key, _)) => {
                trace!("evicting entry over capacity");

                let hash = hash_key(&self.build_hasher, &key);
                shard.remove(&key, hash);
                true
            }
            // drained since we looked, let the caller check again
            None => true,
        }
    }
}

impl<K, V, E> Shard<K, V, E>
where
    K: Eq + Hash,
{
    pub(crate) fn get(&self, key: &K, hash: u64) -> Option<Arc<CacheEntry<V>>> {
        let table = self.table.read();

        table
            .get(hash, |s| eq_key(key, &s.key))
            .map(|s| Arc::clone(&s.entry))
    }

    pub(crate) fn get_live(&self, key: &K, hash: u64, now: Instant) -> Option<Arc<CacheEntry<V>>> {
        self.get(key, hash).filter(|entry| !entry.is_expired(now))
    }

    pub(crate) fn insert<S: BuildHasher>(
        &self,
        key: K,
        entry: Arc<CacheEntry<V>>,
        hash: u64,
        build_hasher: &S,
    ) -> Option<Arc<CacheEntry<V>>> {
        let mut table = self.table.write();

        if let Some(slot) = table.get_mut(hash, |s| eq_key(&key, &s.key)) {
            return Some(std::mem::replace(&mut slot.entry, entry));
        }

        table.insert(hash, Slot { key, entry }, |s| hash_key(build_hasher, &s.key));

        None
    }

    fn replace(
        &self,
        key: &K,
        hash: u64,
        current: &Arc<CacheEntry<V>>,
        fresh: Arc<CacheEntry<V>>,
    ) -> bool {
        let mut table = self.table.write();

        match table.get_mut(hash, |s| eq_key(key, &s.key)) {
            Some(slot) if Arc::ptr_eq(&slot.entry, current) => {
                slot.entry = fresh;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn remove(&self, key: &K, hash: u64) -> Option<Arc<CacheEntry<V>>> {
        let mut table = self.table.write();

        table
            .remove_entry(hash, |s| eq_key(key, &s.key))
            .map(|s| s.entry)
    }

    fn remove_if<P>(&self, key: &K, hash: u64, predicate: P) -> Option<Arc<CacheEntry<V>>>
    where
        P: FnOnce(&Arc<CacheEntry<V>>) -> bool,
    {
        let mut table = self.table.write();

        let matches = table
            .get(hash, |s| eq_key(key, &s.key))
            .is_some_and(|s| predicate(&s.entry));

        if matches {
            table
                .remove_entry(hash, |s| eq_key(key, &s.key))
                .map(|s| s.entry)
        } else {
            None
        }
    }

    /// Stop tracking the expiry of a removed entry.
    ///
    /// A load may have stored a fresh entry for `key` since the removal, that one stays tracked.
    fn untrack(&self, key: &K, hash: u64)
    where
        K: Clone,
    {
        let mut expiry = self.expiry.lock();

        match self.get(key, hash) {
            Some(current) => {
                expiry.push(key.clone(), Reverse(current.expires()));
            }
            None => {
                expiry.remove(key);
            }
        }
    }

    /// Retire `flight` if it is still the one registered for `key`
    pub(crate) fn end_flight(&self, key: &K, flight: &Arc<Flight<E>>) {
        let mut flights = self.flights.lock();

        if flights.get(key).is_some_and(|f| Arc::ptr_eq(f, flight)) {
            flights.remove(key);
        }
    }
}

pub(crate) fn eq_key<K: Eq>(a: &K, b: &K) -> bool {
    a.eq(b)
}

pub(crate) fn hash_key<K, S>(build_hasher: &S, key: &K) -> u64
where
    K: std::hash::Hash,
    S: std::hash::BuildHasher,
{
    let mut hasher = build_hasher.build_hasher();
    key.hash(&mut hasher);
    hasher.finish()
}

fn max_parallelism() -> usize {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static AVAILABLE_PARALLELISM: AtomicUsize = AtomicUsize::new(0);
    let mut ap = AVAILABLE_PARALLELISM.load(Ordering::Relaxed);
    if ap == 0 {
        ap = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        AVAILABLE_PARALLELISM.store(ap, Ordering::Relaxed);
    }
    ap
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug)]
    struct Never;

    impl std::fmt::Display for Never {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "never")
        }
    }

    impl std::error::Error for Never {}

    fn seconds(seconds: u64) -> Duration {
        Duration::from_secs(seconds)
    }

    async fn load_n(engine: &StorageEngine<i32, i32, Never>, n: i32) {
        for i in 0..n {
            engine.get_or_load(i, || async move { Ok(Some(i)) }).await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_are_reloaded() {
        let engine = StorageEngine::<i32, i32, Never>::new(seconds(10));

        load_n(&engine, 1).await;
        tokio::time::advance(seconds(10)).await;

        assert!(engine.peek(&0).is_none());

        let entry = engine.get_or_load(0, || async { Ok(Some(42)) }).await.unwrap();
        assert_eq!(entry.value(), Some(&42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_are_pruned_on_insert() {
        let engine: StorageEngine<i32, i32, Never> =
            EngineBuilder::new(seconds(10)).shards(1).build(Default::default());

        load_n(&engine, 5).await;
        tokio::time::advance(seconds(11)).await;
        engine.get_or_load(100, || async { Ok(Some(100)) }).await.unwrap();

        assert_eq!(engine.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_closest_to_expiry() {
        let engine = StorageEngine::<i32, i32, Never>::with_capacity(seconds(10), 3);

        for i in 0..5 {
            load_one(&engine, i).await;
            tokio::time::advance(Duration::from_millis(10)).await;
        }

        assert_eq!(engine.len(), 3);
        assert!(engine.peek(&0).is_none());
        assert!(engine.peek(&1).is_none());
        assert!(engine.peek(&4).is_some());
    }

    async fn load_one(engine: &StorageEngine<i32, i32, Never>, key: i32) {
        engine.get_or_load(key, || async move { Ok(Some(key)) }).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_peek_does_not_record_access() {
        let engine = StorageEngine::<i32, i32, Never>::new(seconds(10));
        load_n(&engine, 1).await;

        tokio::time::advance(seconds(3)).await;
        let entry = engine.peek(&0).unwrap();
        assert_eq!(entry.last_access(), entry.created());

        engine.get_or_load(0, || async { Ok(None) }).await.unwrap();
        assert_eq!(entry.last_access(), entry.created() + seconds(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_is_tracked_by_the_owning_shard() {
        let engine: StorageEngine<i32, i32, Never> =
            EngineBuilder::new(seconds(10)).shards(4).build(Default::default());
        load_n(&engine, 32).await;

        let tracked: usize = engine.shards.iter().map(|s| s.expiry.lock().len()).sum();
        assert_eq!(tracked, 32);

        for i in 0..32 {
            let (_, shard) = engine.shard(&i);
            assert!(shard.expiry.lock().get(&i).is_some());
        }

        engine.remove(&7);
        let (_, shard) = engine.shard(&7);
        assert!(shard.expiry.lock().get(&7).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_during_remove_stays_tracked() {
        let engine = StorageEngine::<i32, i32, Never>::with_capacity(seconds(10), 1);
        load_one(&engine, 0).await;

        // a reload lands between the table removal and the expiry bookkeeping
        let (hash, shard) = engine.shard(&0);
        shard.remove(&0, hash);
        load_one(&engine, 0).await;
        shard.untrack(&0, hash);

        let reloaded = engine.peek(&0).unwrap();
        assert_eq!(
            shard.expiry.lock().get(&0).map(|(_, at)| at.0),
            Some(reloaded.expires())
        );

        // still counted against the capacity
        tokio::time::advance(Duration::from_millis(10)).await;
        load_one(&engine, 1).await;

        assert_eq!(engine.len(), 1);
        assert!(engine.peek(&0).is_none());
        assert!(engine.peek(&1).is_some());
    }

    #[tokio::test]
    async fn test_remove_forces_reload() {
        let engine = StorageEngine::<i32, i32, Never>::new(seconds(10));
        load_n(&engine, 1).await;

        assert!(engine.remove(&0).is_some());
        assert!(engine.remove(&0).is_none());

        let entry = engine.get_or_load(0, || async { Ok(Some(9)) }).await.unwrap();
        assert_eq!(entry.value(), Some(&9));
    }

    #[tokio::test]
    async fn test_replace_and_remove_only_touch_the_current_entry() {
        let engine = StorageEngine::<i32, i32, Never>::new(seconds(10));
        let first = engine.get_or_load(0, || async { Ok(Some(1)) }).await.unwrap();

        let second = engine.replace(&0, &first, Some(2)).unwrap();
        assert!(!engine.is_current(&0, &first));
        assert!(engine.is_current(&0, &second));

        // stale handles cant clobber the newer entry
        assert!(engine.replace(&0, &first, Some(3)).is_none());
        assert!(!engine.remove_current(&0, &first));
        assert_eq!(engine.peek(&0).unwrap().value(), Some(&2));

        assert!(engine.remove_current(&0, &second));
        assert!(engine.is_empty());
    }

    #[tokio::test]
    async fn test_clear() {
        let engine = StorageEngine::<i32, i32, Never>::new(seconds(10));
        load_n(&engine, 10).await;

        engine.clear();

        assert!(engine.is_empty());
    }
}
