use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

/// Duration readable and writable from any thread.
///
/// Stored as whole nanoseconds; durations beyond `u64::MAX` nanoseconds
/// (about 584 years) are clamped.
#[repr(transparent)]
pub(crate) struct AtomicDuration(AtomicU64);

impl AtomicDuration {
    pub(crate) const fn zero() -> Self {
        Self(AtomicU64::new(0))
    }

    pub(crate) fn store(&self, duration: Duration, order: Ordering) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.0.store(nanos, order);
    }

    pub(crate) fn load(&self, order: Ordering) -> Duration {
        Duration::from_nanos(self.0.load(order))
    }
}
