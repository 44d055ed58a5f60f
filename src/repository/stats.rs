use std::sync::atomic::{AtomicU64, Ordering};

/// A point in time snapshot of a repository's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepositoryStats {
    /// Calls to `get`
    pub gets: u64,
    /// Synchronous loads on a miss, a shared load counts once
    pub loads: u64,
    pub load_failures: u64,
    pub refreshes_scheduled: u64,
    pub refreshes_completed: u64,
    pub refresh_failures: u64,
    /// Entries dropped because a refresh found them absent upstream
    pub refresh_evictions: u64,
    /// Entries removed by a change notification
    pub invalidations: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Stats {
    pub(crate) gets: AtomicU64,
    pub(crate) loads: AtomicU64,
    pub(crate) load_failures: AtomicU64,
    pub(crate) refreshes_scheduled: AtomicU64,
    pub(crate) refreshes_completed: AtomicU64,
    pub(crate) refresh_failures: AtomicU64,
    pub(crate) refresh_evictions: AtomicU64,
    pub(crate) invalidations: AtomicU64,
}

impl Stats {
    #[inline]
    pub(crate) fn record(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> RepositoryStats {
        RepositoryStats {
            gets: self.gets.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            refreshes_scheduled: self.refreshes_scheduled.load(Ordering::Relaxed),
            refreshes_completed: self.refreshes_completed.load(Ordering::Relaxed),
            refresh_failures: self.refresh_failures.load(Ordering::Relaxed),
            refresh_evictions: self.refresh_evictions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}
