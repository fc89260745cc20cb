use std::sync::atomic::{AtomicU64, Ordering};

use crate::flow::UNBOUNDED;

/// Outstanding demand of a consumer.
///
/// Additions saturate at [`UNBOUNDED`], which is sticky: neither further
/// requests nor consumption move the counter away from it.
#[repr(transparent)]
#[derive(Debug, Default)]
pub struct DemandTracker(AtomicU64);

impl DemandTracker {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Adds `n` to the demand and returns the demand before the addition.
    pub fn request(&self, n: u64) -> u64 {
        let prev = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                (v != UNBOUNDED).then(|| v.saturating_add(n))
            });
        // `Err` carries the current value, which is only returned for UNBOUNDED.
        prev.unwrap_or_else(|v| v)
    }

    /// Atomically reads the demand and resets it to zero.
    pub fn take_and_reset(&self) -> u64 {
        self.0.swap(0, Ordering::AcqRel)
    }

    /// Consumes one unit of demand if any is outstanding.
    ///
    /// Returns `false` when there is no demand. Unbounded demand is never
    /// decremented.
    pub fn try_produce(&self) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| match v {
                0 => None,
                UNBOUNDED => Some(UNBOUNDED),
                v => Some(v - 1),
            })
            .is_ok()
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn is_unbounded(&self) -> bool {
        self.get() == UNBOUNDED
    }
}
