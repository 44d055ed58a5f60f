use tokio::time::Instant;

/// Decides whether an entry should be reloaded in the background ahead of its expiry.
pub trait RefreshPolicy: Send + Sync + 'static {
    fn is_due(&self, access: Instant, created: Instant, expires: Instant) -> bool;
}

/// Refresh entries accessed during the third quarter of their lifetime.
///
/// Earlier than that the reload would be wasted work, later than that it is unlikely to land before the entry expires.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThirdQuarter;

impl RefreshPolicy for ThirdQuarter {
    #[inline]
    fn is_due(&self, access: Instant, created: Instant, expires: Instant) -> bool {
        refresh_due(access, created, expires)
    }
}

#[derive(Clone, Copy, Debug, Default)]
/// A policy that never refreshes, entries only change through invalidation or expiry.
pub struct NeverRefresh;

impl RefreshPolicy for NeverRefresh {
    #[inline]
    fn is_due(&self, _: Instant, _: Instant, _: Instant) -> bool {
        false
    }
}

/// True iff `access` falls strictly inside `(created + w/2, expires - w/4)` where `w` is the lifetime of the entry.
pub fn refresh_due(access: Instant, created: Instant, expires: Instant) -> bool {
    let window = expires.saturating_duration_since(created);

    let opens = created + window / 2;
    let closes = created + (window - window / 4);

    access > opens && access < closes
}
