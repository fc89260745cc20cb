use std::sync::atomic::{AtomicU8, Ordering};

pub(super) mod ringbuf;
pub(crate) mod rx;
pub(crate) mod tx;

/// Lifecycle flags of a bridge. Flags are only ever added, never cleared.
#[repr(transparent)]
pub(crate) struct Status(AtomicU8);

pub(crate) mod status {
    /// A consumer claimed the bridge.
    pub(crate) const SUBSCRIBING: u8 = 1 << 0;
    /// The consumer is installed and may be signalled.
    pub(crate) const SUBSCRIBED: u8 = 1 << 1;
    /// A terminal signal has been recorded.
    pub(crate) const TERMINATED: u8 = 1 << 2;
    /// The consumer cancelled.
    pub(crate) const CANCELLED: u8 = 1 << 3;
    /// The consumer failed while handling an item.
    pub(crate) const FAILED: u8 = 1 << 4;
    /// Teardown finished. Nothing is signalled anymore.
    pub(crate) const DONE: u8 = 1 << 5;

    pub(crate) const fn any(v: u8, f: u8) -> bool {
        v & f != 0
    }
}

impl Status {
    pub(crate) const fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    /// Sets `f` and returns the flags before the update.
    pub(crate) fn set(&self, f: u8) -> u8 {
        self.0.fetch_or(f, Ordering::AcqRel)
    }

    pub(crate) fn get(&self) -> u8 {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn any(&self, f: u8) -> bool {
        status::any(self.get(), f)
    }
}
