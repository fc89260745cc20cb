use std::{
    cell::UnsafeCell,
    mem::{self, MaybeUninit},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use crossbeam_utils::CachePadded;

/// Shared storage of a single-producer single-consumer ring.
///
/// Cursors grow monotonically and wrap on overflow; a slot is addressed by
/// masking the cursor with `capacity - 1`. A slot is initialized exactly when
/// it lies between the read cursor (inclusive) and the write cursor
/// (exclusive).
pub(super) struct RingBuffer<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    idx_r: CachePadded<AtomicUsize>,
    idx_w: CachePadded<AtomicUsize>,
}

// SAFETY: a slot is only touched by the single writer before it is published
// through `idx_w` and by the single reader after it observed that publication.
unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Send> Sync for RingBuffer<T> {}

impl<T> RingBuffer<T> {
    pub(super) fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "Capacity must be a power of 2");

        RingBuffer {
            slots: (0..capacity).map(|_| UnsafeCell::new(MaybeUninit::uninit())).collect(),
            mask: capacity - 1,
            idx_r: CachePadded::new(AtomicUsize::new(0)),
            idx_w: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    #[inline]
    pub(super) fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of initialized slots. Exact when neither side is active.
    #[inline]
    pub(super) fn len(&self) -> usize {
        let r = self.idx_r.load(Ordering::Acquire);
        let w = self.idx_w.load(Ordering::Acquire);
        w.wrapping_sub(r)
    }

    #[inline]
    fn slot(&self, idx: usize) -> *mut MaybeUninit<T> {
        // SAFETY: the mask keeps the position inside the slice.
        unsafe { self.slots.get_unchecked(idx & self.mask) }.get()
    }
}

impl<T> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        let mut r = *self.idx_r.get_mut();
        let w = *self.idx_w.get_mut();
        while r != w {
            // SAFETY: slots between the two cursors are initialized and no
            // handle is left to observe them.
            unsafe { self.slots[r & self.mask].get_mut().assume_init_drop() };
            r = r.wrapping_add(1);
        }
    }
}

/// Producer handle.
pub(super) struct RingBufferWriter<T> {
    inner: Arc<RingBuffer<T>>,
    cached_idx_r: usize,
    local_idx_w: usize,
}

impl<T> RingBufferWriter<T> {
    pub(super) fn new(inner: Arc<RingBuffer<T>>) -> Self {
        Self {
            inner,
            cached_idx_r: 0,
            local_idx_w: 0,
        }
    }

    #[inline]
    fn is_full(&mut self) -> bool {
        let c = self.inner.capacity();
        if self.local_idx_w.wrapping_sub(self.cached_idx_r) < c {
            return false;
        }
        self.cached_idx_r = self.inner.idx_r.load(Ordering::Acquire);
        self.local_idx_w.wrapping_sub(self.cached_idx_r) == c
    }

    /// Appends `t`, or gives it back when every slot is taken.
    #[inline]
    pub(super) fn push(&mut self, t: T) -> Result<(), T> {
        if self.is_full() {
            return Err(t);
        }

        // SAFETY: the slot is free (not full) and only the writer fills slots.
        unsafe { (*self.inner.slot(self.local_idx_w)).write(t) };

        self.local_idx_w = self.local_idx_w.wrapping_add(1);
        self.inner.idx_w.store(self.local_idx_w, Ordering::Release);
        Ok(())
    }
}

/// Consumer handle.
pub(super) struct RingBufferReader<T> {
    inner: Arc<RingBuffer<T>>,
    local_idx_r: usize,
    cached_idx_w: usize,
}

impl<T> RingBufferReader<T> {
    pub(super) fn new(inner: Arc<RingBuffer<T>>) -> Self {
        Self {
            inner,
            local_idx_r: 0,
            cached_idx_w: 0,
        }
    }

    #[inline]
    fn is_empty(&mut self) -> bool {
        if self.local_idx_r != self.cached_idx_w {
            return false;
        }
        self.cached_idx_w = self.inner.idx_w.load(Ordering::Acquire);
        self.local_idx_r == self.cached_idx_w
    }

    /// Removes the oldest element. The slot is released before returning.
    #[inline]
    pub(super) fn pull(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }

        // SAFETY: the slot was published by the writer and is moved out
        // exactly once, leaving it logically uninitialized.
        let t = unsafe { mem::replace(&mut *self.inner.slot(self.local_idx_r), MaybeUninit::uninit()).assume_init() };

        self.local_idx_r = self.local_idx_r.wrapping_add(1);
        self.inner.idx_r.store(self.local_idx_r, Ordering::Release);
        Some(t)
    }

    #[inline]
    pub(super) fn is_drained(&mut self) -> bool {
        self.is_empty()
    }
}
