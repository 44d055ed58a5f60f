use std::future::Future;

/// A `Loader` maps a key to its authoritative value asynchronously.
///
/// `Ok(None)` means the source has no value for the key, this is cached like any other result.
pub trait Loader<K, V>: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    fn load(&self, key: K) -> impl Future<Output = Result<Option<V>, Self::Error>> + Send;
}

impl<K, V, F, Fut, E> Loader<K, V> for F
where
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<V>, E>> + Send,
    E: std::error::Error + Send + Sync + 'static,
{
    type Error = E;

    fn load(&self, key: K) -> impl Future<Output = Result<Option<V>, E>> + Send {
        self(key)
    }
}
