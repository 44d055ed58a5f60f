use std::collections::HashMap;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::Instant;

use crate::engine::EngineBuilder;
use crate::error::ConfigError;

/// Storage settings for one named cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    /// How long an entry lives after it was loaded.
    pub time_to_live: Duration,

    /// Upper bound on resident entries, entries closest to expiry go first.
    pub max_entries: Option<usize>,

    /// Number of shards, rounded up to a power of two.
    /// Defaults to four times the available parallelism.
    pub shards: Option<usize>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            time_to_live: Duration::from_secs(300),
            max_entries: None,
            shards: None,
        }
    }
}

impl CacheSettings {
    pub fn new(time_to_live: Duration) -> Self {
        CacheSettings {
            time_to_live,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    #[must_use]
    pub fn shards(mut self, shards: usize) -> Self {
        self.shards = Some(shards);
        self
    }

    pub(crate) fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.time_to_live.is_zero() {
            return Err(ConfigError::ZeroTimeToLive(name.to_string()));
        }

        if Instant::now().checked_add(self.time_to_live).is_none() {
            return Err(ConfigError::TimeToLiveTooLarge(name.to_string()));
        }

        if self.max_entries == Some(0) {
            return Err(ConfigError::ZeroCapacity(name.to_string()));
        }

        if self.shards == Some(0) {
            return Err(ConfigError::ZeroShards(name.to_string()));
        }

        Ok(())
    }

    pub(crate) fn engine_builder(&self) -> EngineBuilder {
        let mut builder = EngineBuilder::new(self.time_to_live);

        if let Some(shards) = self.shards {
            builder = builder.shards(shards);
        }

        if let Some(max_entries) = self.max_entries {
            builder = builder.max_entries(max_entries);
        }

        builder
    }
}

/// The set of named caches a process knows about, plus the runtime
/// background refreshes are spawned on.
///
/// ```rust
/// # use refresh_ahead::{CacheConfig, CacheSettings};
/// # use std::time::Duration;
/// let config = CacheConfig::new()
///     .cache("organisations", CacheSettings::new(Duration::from_secs(600)))
///     .cache("users", CacheSettings::new(Duration::from_secs(60)).max_entries(10_000));
///
/// assert!(config.settings("users").is_ok());
/// assert!(config.settings("groups").is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CacheConfig {
    caches: HashMap<String, CacheSettings>,
    runtime: Option<Handle>,
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or overwrite) the settings for a named cache.
    #[must_use]
    pub fn cache(mut self, name: impl Into<String>, settings: CacheSettings) -> Self {
        self.caches.insert(name.into(), settings);
        self
    }

    /// Spawn background refreshes on this runtime instead of the one current at construction.
    #[must_use]
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Look up and validate the settings for `name`.
    pub fn settings(&self, name: &str) -> Result<&CacheSettings, ConfigError> {
        let settings = self
            .caches
            .get(name)
            .ok_or_else(|| ConfigError::UnknownCache(name.to_string()))?;

        settings.validate(name)?;

        Ok(settings)
    }

    pub(crate) fn runtime_handle(&self) -> Result<Handle, ConfigError> {
        match &self.runtime {
            Some(handle) => Ok(handle.clone()),
            None => Handle::try_current().map_err(|_| ConfigError::NoRuntime),
        }
    }

    pub fn cache_names(&self) -> impl Iterator<Item = &str> {
        self.caches.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_unknown_cache_is_rejected() {
        let config = CacheConfig::new().cache("users", CacheSettings::default());

        assert_eq!(
            config.settings("groups"),
            Err(ConfigError::UnknownCache("groups".to_string()))
        );
    }

    #[test]
    fn test_misconfigured_settings_are_rejected() {
        let config = CacheConfig::new()
            .cache("no_ttl", CacheSettings::new(Duration::ZERO))
            .cache("no_room", CacheSettings::default().max_entries(0))
            .cache("no_shards", CacheSettings::default().shards(0));

        assert_eq!(
            config.settings("no_ttl"),
            Err(ConfigError::ZeroTimeToLive("no_ttl".to_string()))
        );
        assert_eq!(
            config.settings("no_room"),
            Err(ConfigError::ZeroCapacity("no_room".to_string()))
        );
        assert_eq!(
            config.settings("no_shards"),
            Err(ConfigError::ZeroShards("no_shards".to_string()))
        );
    }

    #[test]
    fn test_unbounded_time_to_live_is_rejected() {
        let config = CacheConfig::new()
            .cache("forever", CacheSettings::new(Duration::MAX))
            .cache("a_year", CacheSettings::new(Duration::from_secs(365 * 24 * 60 * 60)));

        assert_eq!(
            config.settings("forever"),
            Err(ConfigError::TimeToLiveTooLarge("forever".to_string()))
        );
        assert!(config.settings("a_year").is_ok());
    }

    #[test]
    fn test_runtime_required_outside_tokio() {
        let config = CacheConfig::new();

        assert_eq!(config.runtime_handle().unwrap_err(), ConfigError::NoRuntime);
    }

    #[tokio::test]
    async fn test_runtime_falls_back_to_current() {
        let config = CacheConfig::new();

        assert!(config.runtime_handle().is_ok());
    }
}
