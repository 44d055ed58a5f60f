use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

// the refresh word packs a token in the upper bits and the state in the low two
const STATE_BITS: u32 = 2;
const STATE_MASK: u64 = (1 << STATE_BITS) - 1;
const TOKEN_MASK: u64 = u64::MAX >> STATE_BITS;

const IDLE: u64 = 0;
const SCHEDULED: u64 = 1;
const RUNNING: u64 = 2;

/// Where an entry is in its background refresh cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Idle,
    Scheduled,
    Running,
}

/// Identifies one attempt to refresh an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RefreshToken(u64);

impl RefreshToken {
    fn with_state(self, state: u64) -> u64 {
        (self.0 << STATE_BITS) | state
    }
}

/// Hands out refresh tokens, never zero and never reused until the counter wraps.
#[derive(Debug)]
pub(crate) struct RefreshTokens(AtomicU64);

impl RefreshTokens {
    pub(crate) fn new() -> Self {
        RefreshTokens(AtomicU64::new(1))
    }

    pub(crate) fn next(&self) -> RefreshToken {
        loop {
            let id = self.0.fetch_add(1, Ordering::Relaxed) & TOKEN_MASK;
            if id != 0 {
                return RefreshToken(id);
            }
        }
    }
}

/// A loaded value and its recency metadata.
///
/// Entries are never mutated after they are stored, apart from the access time and the refresh word.
/// A refresh replaces the whole entry.
pub struct CacheEntry<V> {
    value: Option<V>,
    created: Instant,
    expires: Instant,
    // nanos since `created`
    last_access: AtomicU64,
    refresh: AtomicU64,
}

impl<V> CacheEntry<V> {
    pub(crate) fn new(value: Option<V>, created: Instant, time_to_live: Duration) -> Self {
        debug_assert!(!time_to_live.is_zero(), "entries must expire after they are created");

        CacheEntry {
            value,
            created,
            expires: created + time_to_live,
            last_access: AtomicU64::new(0),
            refresh: AtomicU64::new(IDLE),
        }
    }

    /// The loaded value, `None` if the source reported it absent.
    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn expires(&self) -> Instant {
        self.expires
    }

    pub fn last_access(&self) -> Instant {
        self.created + Duration::from_nanos(self.last_access.load(Ordering::Acquire))
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires
    }

    /// Record an access, the access time never moves backwards.
    pub(crate) fn touch(&self, now: Instant) {
        let since = now.saturating_duration_since(self.created).as_nanos();
        let since = u64::try_from(since).unwrap_or(u64::MAX);

        self.last_access.fetch_max(since, Ordering::AcqRel);
    }

    pub fn refresh_state(&self) -> RefreshState {
        match self.refresh.load(Ordering::Acquire) & STATE_MASK {
            SCHEDULED => RefreshState::Scheduled,
            RUNNING => RefreshState::Running,
            _ => RefreshState::Idle,
        }
    }

    /// Idle -> Scheduled, only one caller can win this per refresh cycle.
    pub(crate) fn try_schedule_refresh(&self, token: RefreshToken) -> bool {
        self.refresh
            .compare_exchange(
                IDLE,
                token.with_state(SCHEDULED),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Scheduled -> Running, fails if the token no longer owns the entry.
    pub(crate) fn try_begin_refresh(&self, token: RefreshToken) -> bool {
        self.refresh
            .compare_exchange(
                token.with_state(SCHEDULED),
                token.with_state(RUNNING),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Back to idle from either scheduled or running, as long as `token` still owns the entry.
    pub(crate) fn end_refresh(&self, token: RefreshToken) {
        for state in [RUNNING, SCHEDULED] {
            if self
                .refresh
                .compare_exchange(token.with_state(state), IDLE, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }
}

impl<V: Debug> Debug for CacheEntry<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("value", &self.value)
            .field("created", &self.created)
            .field("expires", &self.expires)
            .field("last_access", &self.last_access())
            .field("refresh_state", &self.refresh_state())
            .finish()
    }
}
