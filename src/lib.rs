//! A read-through cache that refreshes entries ahead of expiry and reacts to upstream changes.
//!
//! # Quick Start
//! Describe your caches in a [`CacheConfig`], wrap each source of truth in a [`CacheEntryRepository`]
//! and register the repositories with a [`RepositoryRegistry`] so a [`ChangeNotifier`] can route
//! "this key changed" events to them.

/// Named cache settings and the runtime background work runs on.
pub mod config;
#[doc(inline)]
pub use config::{CacheConfig, CacheSettings};

/// The sharded store underneath every repository. Concurrent misses on a key share a single load.
pub mod engine;
#[doc(inline)]
pub use engine::StorageEngine;

pub mod entry;
#[doc(inline)]
pub use entry::{CacheEntry, RefreshState};

pub mod error;
#[doc(inline)]
pub use error::{BoxError, ConfigError};

pub mod loader;
#[doc(inline)]
pub use loader::Loader;

/// Fan out of change events to local repositories and remote peers.
pub mod notifier;
#[doc(inline)]
pub use notifier::{ChangeNotifier, LocalOnly, RemotePublisher, RepositoryRegistry, ValueChangeListener};

/// A policy decides when an entry is due for a refresh ahead of its expiry.
pub mod policy;
#[doc(inline)]
pub use policy::{NeverRefresh, RefreshPolicy, ThirdQuarter};

pub mod repository;
#[doc(inline)]
pub use repository::{CacheEntryRepository, RepositoryStats};

#[doc(hidden)]
pub mod constants_for_benchmarking;
