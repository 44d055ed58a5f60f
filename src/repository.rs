mod stats;

pub use stats::RepositoryStats;

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Weak};

use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

use crate::config::CacheConfig;
use crate::engine::StorageEngine;
use crate::entry::{CacheEntry, RefreshState, RefreshToken, RefreshTokens};
use crate::error::{BoxError, ConfigError};
use crate::loader::Loader;
use crate::notifier::ValueChangeListener;
use crate::policy::{RefreshPolicy, ThirdQuarter};
use stats::Stats;

/// A read-through cache in front of a [`Loader`] that refreshes entries ahead of their expiry
/// and reacts to change notifications.
///
/// Cloning is cheap, clones share the same entries.
///
/// ```rust,no_run
/// # use refresh_ahead::{CacheConfig, CacheSettings, CacheEntryRepository};
/// # use std::time::Duration;
/// # #[derive(Debug)] struct DbError;
/// # impl std::fmt::Display for DbError { fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "db") } }
/// # impl std::error::Error for DbError {}
/// # async fn fetch_org_name(id: u64) -> Result<Option<String>, DbError> { Ok(None) }
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let config = CacheConfig::new().cache("orgs", CacheSettings::new(Duration::from_secs(600)));
/// let orgs = CacheEntryRepository::new(&config, "orgs", "org", |id: u64| fetch_org_name(id))?;
///
/// let name = orgs.get(42).await?;
/// # Ok(())
/// # }
/// ```
pub struct CacheEntryRepository<K, V, L, P = ThirdQuarter>
where
    L: Loader<K, V>,
{
    inner: Arc<RepositoryInner<K, V, L, P>>,
}

struct RepositoryInner<K, V, L, P>
where
    L: Loader<K, V>,
{
    // handed to background refreshes so they can outlive the call that scheduled them
    me: Weak<Self>,
    name: Arc<str>,
    scope: Arc<str>,
    entries: StorageEngine<K, V, L::Error>,
    loader: L,
    policy: P,
    tokens: RefreshTokens,
    runtime: Handle,
    stats: Stats,
}

impl<K, V, L, P> Clone for CacheEntryRepository<K, V, L, P>
where
    L: Loader<K, V>,
{
    fn clone(&self) -> Self {
        CacheEntryRepository {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V, L> CacheEntryRepository<K, V, L>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    L: Loader<K, V>,
{
    /// Build a repository over the cache named `name` in `config`, refreshing in the third quarter of an entry's lifetime.
    ///
    /// Fails if the cache is not configured, its settings are invalid, or there is no runtime to refresh on.
    pub fn new(
        config: &CacheConfig,
        name: &str,
        scope: impl Into<Arc<str>>,
        loader: L,
    ) -> Result<Self, ConfigError> {
        Self::with_policy(config, name, scope, loader, ThirdQuarter)
    }
}

impl<K, V, L, P> CacheEntryRepository<K, V, L, P>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    L: Loader<K, V>,
    P: RefreshPolicy,
{
    pub fn with_policy(
        config: &CacheConfig,
        name: &str,
        scope: impl Into<Arc<str>>,
        loader: L,
        policy: P,
    ) -> Result<Self, ConfigError> {
        let settings = config.settings(name)?;
        let runtime = config.runtime_handle()?;
        let scope = scope.into();

        debug!(
            cache = name,
            scope = %scope,
            time_to_live = ?settings.time_to_live,
            "cache repository initialized"
        );

        let inner = Arc::new_cyclic(|me| RepositoryInner {
            me: me.clone(),
            name: name.into(),
            scope,
            entries: settings.engine_builder().build(Default::default()),
            loader,
            policy,
            tokens: RefreshTokens::new(),
            runtime,
            stats: Stats::default(),
        });

        Ok(CacheEntryRepository { inner })
    }

    /// Get the value for `key`, loading it on a miss.
    ///
    /// Concurrent misses on the same key share a single load and all see its result.
    /// On a hit inside the refresh window a background reload is scheduled and the current value is returned.
    /// `Ok(None)` means the source has no value for this key.
    pub async fn get(&self, key: K) -> Result<Option<V>, Arc<L::Error>> {
        let inner = &self.inner;
        Stats::record(&inner.stats.gets);

        let load_key = key.clone();
        let entry = inner
            .entries
            .get_or_load(key.clone(), move || inner.load(load_key))
            .await?;

        if inner.refresh_due(&entry) {
            inner.schedule_refresh(key, &entry);
        }

        Ok(entry.value().cloned())
    }

    /// Tell the repository the authoritative value for `key` may have changed.
    ///
    /// If the entry is inside its refresh window it is reloaded in the background,
    /// otherwise it is dropped and the next `get` loads it again.
    pub fn on_value_changed(&self, key: &K) {
        self.inner.on_value_changed(key)
    }

    /// Drop the entry for `key` unconditionally.
    pub fn invalidate(&self, key: &K) -> bool {
        self.inner.entries.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.inner.entries.clear();
    }

    /// Where the cached entry for `key` is in its refresh cycle, `None` if nothing live is cached.
    pub fn refresh_state(&self, key: &K) -> Option<RefreshState> {
        self.inner.entries.peek(key).map(|entry| entry.refresh_state())
    }

    /// A weak handle for registering this repository with a [`crate::RepositoryRegistry`].
    pub fn listener(&self) -> Weak<dyn ValueChangeListener<K>> {
        let weak: Weak<dyn ValueChangeListener<K>> = Arc::downgrade(&self.inner) as _;
        weak
    }
}

impl<K, V, L, P> CacheEntryRepository<K, V, L, P>
where
    L: Loader<K, V>,
{
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn value_scope(&self) -> &str {
        &self.inner.scope
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn stats(&self) -> RepositoryStats {
        self.inner.stats.snapshot()
    }
}

impl<K, V, L, P> RepositoryInner<K, V, L, P>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    L: Loader<K, V>,
    P: RefreshPolicy,
{
    async fn load(&self, key: K) -> Result<Option<V>, L::Error> {
        Stats::record(&self.stats.loads);

        let result = self.loader.load(key).await;
        if let Err(err) = &result {
            Stats::record(&self.stats.load_failures);
            debug!(cache = %self.name, error = %err, "load failed");
        }

        result
    }

    fn refresh_due(&self, entry: &CacheEntry<V>) -> bool {
        self.policy
            .is_due(entry.last_access(), entry.created(), entry.expires())
    }

    fn on_value_changed(&self, key: &K) {
        let Some(entry) = self.entries.peek(key) else {
            trace!(cache = %self.name, "change notification for an entry that is not cached");
            return;
        };

        // peek leaves the access time alone, invalidation traffic must not move the refresh window
        if self.refresh_due(&entry) {
            self.schedule_refresh(key.clone(), &entry);
        } else if self.entries.remove(key).is_some() {
            Stats::record(&self.stats.invalidations);
            debug!(cache = %self.name, "entry removed after change notification");
        }
    }

    fn schedule_refresh(&self, key: K, entry: &Arc<CacheEntry<V>>) {
        let token = self.tokens.next();
        if !entry.try_schedule_refresh(token) {
            trace!(cache = %self.name, "refresh already in flight");
            return;
        }

        // from here on the entry goes back to idle however the task ends, even if it never runs
        let guard = RefreshGuard {
            entry: Arc::clone(entry),
            token,
        };

        let Some(inner) = self.me.upgrade() else {
            return;
        };

        Stats::record(&self.stats.refreshes_scheduled);
        trace!(cache = %self.name, "refresh scheduled");

        self.runtime.spawn(async move {
            inner.refresh(key, guard).await;
        });
    }

    async fn refresh(&self, key: K, guard: RefreshGuard<V>) {
        let entry = &guard.entry;

        // the entry may have been replaced or removed since the refresh was scheduled
        if !self.entries.is_current(&key, entry) || !entry.try_begin_refresh(guard.token) {
            trace!(cache = %self.name, "dropping refresh for a stale entry");
            return;
        }

        match self.loader.load(key.clone()).await {
            Ok(Some(value)) => {
                if self.entries.replace(&key, entry, Some(value)).is_some() {
                    Stats::record(&self.stats.refreshes_completed);
                    debug!(cache = %self.name, "entry refreshed");
                } else {
                    trace!(cache = %self.name, "entry changed while refreshing, dropping the result");
                }
            }
            Ok(None) => {
                if self.entries.remove_current(&key, entry) {
                    Stats::record(&self.stats.refresh_evictions);
                    debug!(cache = %self.name, "entry evicted, source no longer has a value");
                }
            }
            Err(err) => {
                Stats::record(&self.stats.refresh_failures);
                warn!(
                    cache = %self.name,
                    error = %err,
                    "background refresh failed, keeping the current value"
                );
            }
        }

        drop(guard);
    }
}

impl<K, V, L, P> ValueChangeListener<K> for RepositoryInner<K, V, L, P>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    L: Loader<K, V>,
    P: RefreshPolicy,
{
    fn cache_name(&self) -> &str {
        &self.name
    }

    fn value_scope(&self) -> &str {
        &self.scope
    }

    fn on_value_changed(&self, key: &K) -> Result<(), BoxError> {
        RepositoryInner::on_value_changed(self, key);
        Ok(())
    }
}

/// Puts the entry back to idle however the refresh ends, including a panicking loader or a task that never ran.
struct RefreshGuard<V> {
    entry: Arc<CacheEntry<V>>,
    token: RefreshToken,
}

impl<V> Drop for RefreshGuard<V> {
    fn drop(&mut self) {
        self.entry.end_refresh(self.token);
    }
}

impl<K, V, L, P> Debug for CacheEntryRepository<K, V, L, P>
where
    L: Loader<K, V>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntryRepository")
            .field("name", &self.inner.name)
            .field("scope", &self.inner.scope)
            .field("entries", &self.inner.entries.len())
            .finish()
    }
}
