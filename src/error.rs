/// Error type returned by listeners and remote publishers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while building a repository from a [`crate::CacheConfig`].
///
/// These are fatal to construction, nothing at runtime recovers from them.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no cache named '{0}' is configured")]
    UnknownCache(String),

    #[error("cache '{0}': time to live must be greater than zero")]
    ZeroTimeToLive(String),

    #[error("cache '{0}': time to live is too large to compute an expiry from")]
    TimeToLiveTooLarge(String),

    #[error("cache '{0}': max entries must be greater than zero")]
    ZeroCapacity(String),

    #[error("cache '{0}': shard count must be greater than zero")]
    ZeroShards(String),

    #[error("no tokio runtime available to run background refreshes")]
    NoRuntime,
}
