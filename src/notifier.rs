use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, error, warn};

use crate::error::BoxError;
use crate::loader::Loader;
use crate::policy::RefreshPolicy;
use crate::repository::CacheEntryRepository;

/// Something holding cached values that wants to hear when one of them changes upstream.
pub trait ValueChangeListener<K>: Send + Sync {
    fn cache_name(&self) -> &str;

    /// The kind of value held, change events are routed by this.
    fn value_scope(&self) -> &str;

    fn on_value_changed(&self, key: &K) -> Result<(), BoxError>;
}

/// The listeners a process has wired up, held weakly so registration never keeps a repository alive.
pub struct RepositoryRegistry<K> {
    listeners: RwLock<Vec<Weak<dyn ValueChangeListener<K>>>>,
}

impl<K> Default for RepositoryRegistry<K> {
    fn default() -> Self {
        RepositoryRegistry {
            listeners: RwLock::new(Vec::new()),
        }
    }
}

impl<K: 'static> RepositoryRegistry<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T>(&self, listener: &Arc<T>)
    where
        T: ValueChangeListener<K> + 'static,
    {
        let weak: Weak<dyn ValueChangeListener<K>> = Arc::downgrade(listener) as _;
        self.register_weak(weak);
    }

    pub fn register_repository<V, L, P>(&self, repository: &CacheEntryRepository<K, V, L, P>)
    where
        K: Eq + Hash + Clone + Send + Sync,
        V: Clone + Send + Sync + 'static,
        L: Loader<K, V>,
        P: RefreshPolicy,
    {
        debug!(
            cache = repository.name(),
            scope = repository.value_scope(),
            "repository registered for change notifications"
        );

        self.register_weak(repository.listener());
    }

    pub fn register_weak(&self, listener: Weak<dyn ValueChangeListener<K>>) {
        self.listeners.write().push(listener);
    }

    /// Live listeners for `scope`, dropped listeners are purged along the way.
    pub fn matching(&self, scope: &str) -> Vec<Arc<dyn ValueChangeListener<K>>> {
        let mut matching = Vec::new();
        let mut dead = false;

        for weak in self.listeners.read().iter() {
            match weak.upgrade() {
                Some(listener) if listener.value_scope() == scope => matching.push(listener),
                Some(_) => {}
                None => dead = true,
            }
        }

        if dead {
            self.purge();
        }

        matching
    }

    /// Number of registered listeners still alive
    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The distinct scopes of the live listeners.
    pub fn scopes(&self) -> Vec<String> {
        let mut scopes: Vec<String> = self
            .listeners
            .read()
            .iter()
            .filter_map(Weak::upgrade)
            .map(|listener| listener.value_scope().to_string())
            .collect();

        scopes.sort_unstable();
        scopes.dedup();
        scopes
    }

    fn purge(&self) {
        self.listeners.write().retain(|weak| weak.strong_count() > 0);
    }
}

/// Carries change events to other processes.
pub trait RemotePublisher<K>: Send + Sync {
    fn publish(&self, scope: &str, key: &K) -> Result<(), BoxError>;
}

/// Keeps change events inside the process.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalOnly;

impl<K> RemotePublisher<K> for LocalOnly {
    fn publish(&self, _: &str, _: &K) -> Result<(), BoxError> {
        Ok(())
    }
}

impl<K, F> RemotePublisher<K> for F
where
    F: Fn(&str, &K) -> Result<(), BoxError> + Send + Sync,
{
    fn publish(&self, scope: &str, key: &K) -> Result<(), BoxError> {
        self(scope, key)
    }
}

/// Routes "this key changed" events to the registered repositories for a scope.
///
/// Events that start in this process go through [`ChangeNotifier::on_change`] and are also handed
/// to the remote publisher. Events received from a peer go through
/// [`ChangeNotifier::on_notified_by_remote`], which never publishes, so events dont bounce around a cluster.
///
/// A listener that fails or panics is logged and skipped, the others are still notified.
pub struct ChangeNotifier<K, R = LocalOnly> {
    registry: Arc<RepositoryRegistry<K>>,
    remote: R,
}

impl<K: std::fmt::Debug + 'static> ChangeNotifier<K> {
    pub fn new(registry: Arc<RepositoryRegistry<K>>) -> Self {
        Self::with_remote(registry, LocalOnly)
    }
}

impl<K, R> ChangeNotifier<K, R>
where
    K: std::fmt::Debug + 'static,
    R: RemotePublisher<K>,
{
    pub fn with_remote(registry: Arc<RepositoryRegistry<K>>, remote: R) -> Self {
        ChangeNotifier { registry, remote }
    }

    pub fn registry(&self) -> &Arc<RepositoryRegistry<K>> {
        &self.registry
    }

    /// Notify local repositories for `scope`, then publish the event to peers.
    ///
    /// Returns how many repositories were notified successfully.
    pub fn on_change(&self, scope: &str, key: &K) -> usize {
        let notified = self.notify_local(scope, key);

        if let Err(err) = self.remote.publish(scope, key) {
            warn!(scope, ?key, error = %err, "failed to publish change to remote peers");
        }

        notified
    }

    /// Apply an event received from a peer, local repositories only.
    pub fn on_notified_by_remote(&self, scope: &str, key: &K) -> usize {
        self.notify_local(scope, key)
    }

    fn notify_local(&self, scope: &str, key: &K) -> usize {
        let mut notified = 0;

        for listener in self.registry.matching(scope) {
            match catch_unwind(AssertUnwindSafe(|| listener.on_value_changed(key))) {
                Ok(Ok(())) => notified += 1,
                Ok(Err(err)) => warn!(
                    cache = listener.cache_name(),
                    scope,
                    ?key,
                    error = %err,
                    "listener failed to handle change"
                ),
                Err(_) => error!(
                    cache = listener.cache_name(),
                    scope,
                    ?key,
                    "listener panicked while handling change"
                ),
            }
        }

        debug!(scope, ?key, notified, "change delivered");

        notified
    }
}

impl<K, R> std::fmt::Debug for ChangeNotifier<K, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("listeners", &self.registry.listeners.read().len())
            .finish()
    }
}
