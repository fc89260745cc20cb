//! Inbound flow control.
//!
//! A [`ReadBridge`] sits between a push-style transport and a pull-style
//! consumer. The transport hands every item it reads to the bridge; the bridge
//! forwards items to the consumer only against outstanding demand and parks
//! the rest in a bounded single-producer single-consumer queue.
//!
//! All consumer-facing work runs inside a single-flight drain: whichever
//! thread moves the `running` counter away from zero owns the consumer and
//! the queue reader until it brings the counter back to zero. Threads that
//! find the drain busy only bump the counter, and the owner loops once more
//! for each of them. No locks are taken on either side.
//!
//! ```text
//!   transport                 ReadBridge                      consumer
//!   ─────────                 ──────────                      ────────
//!   on_item ──┬─ fast path (demand, empty queue) ───────────▶ on_item
//!             └─ queue [■■■□□□□□] ── drain (demand) ────────▶ on_item
//!   on_complete / on_error ── recorded, delivered after the queue drains
//!   ◀── set_read_enabled(demand > 0 || pending < capacity / 2)
//! ```
#[cfg(feature = "stats")]
use std::sync::atomic::AtomicUsize as StatCounter;
use std::{
    cell::UnsafeCell,
    fmt,
    num::NonZeroU32,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use super::{
    Status,
    ringbuf::{Occupancy, RingBufferReaderSPSC, RingBufferWriterSPSC, ringbuffer_spsc},
    status::{self, CANCELLED, DONE, FAILED, SUBSCRIBED, SUBSCRIBING, TERMINATED},
};
use crate::{
    api::ReadControl,
    error::{BoxError, FlowError},
    flow::{Publisher, Subscriber, Subscription, UNBOUNDED},
    sync::DemandTracker,
};

/// Smallest delivery queue a bridge allocates.
pub const MIN_PREFETCH: usize = 32;
/// Largest delivery queue a bridge allocates.
pub const MAX_PREFETCH: usize = 128;

/// Delivery queue size for a requested prefetch.
///
/// The prefetch is clamped to `[MIN_PREFETCH, MAX_PREFETCH]` and rounded up to
/// a power of two so ring positions can be masked.
pub(crate) fn queue_capacity(prefetch: usize) -> usize {
    prefetch.clamp(MIN_PREFETCH, MAX_PREFETCH).next_power_of_two()
}

/// Push-to-pull adapter with a bounded delivery queue.
///
/// Cloning yields another handle to the same bridge. Transport callbacks
/// ([`on_item`](Self::on_item), [`on_complete`](Self::on_complete),
/// [`on_error`](Self::on_error)) must not be invoked concurrently with each
/// other; they may run concurrently with consumer requests and cancellation.
pub struct ReadBridge<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for ReadBridge<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<T> {
    capacity: usize,
    demand: DemandTracker,
    /// Drain ownership plus the number of passes still owed.
    running: AtomicUsize,
    status: Status,
    /// Terminal error recorded by the transport side.
    error: OnceLock<FlowError>,
    /// Failure raised by the consumer itself.
    failure: OnceLock<FlowError>,
    /// Last read interest handed to `control`. Drain owner only.
    reading: AtomicBool,
    control: Arc<dyn ReadControl>,
    occupancy: Occupancy<T>,
    /// Transport side only.
    producer: UnsafeCell<RingBufferWriterSPSC<T>>,
    /// Drain owner only.
    reader: UnsafeCell<RingBufferReaderSPSC<T>>,
    /// Written once by `subscribe` before `SUBSCRIBED` is published, then
    /// drain owner only.
    consumer: UnsafeCell<Option<Box<dyn Subscriber<T>>>>,
    #[cfg(feature = "stats")]
    stats: Counters,
}

// SAFETY: the cells are partitioned between the transport thread and the
// drain owner as documented on each field; `running` and `status` carry the
// happens-before edges between successive owners.
unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

#[cfg(feature = "stats")]
#[derive(Default)]
struct Counters {
    delivered: StatCounter,
    buffered: StatCounter,
    discarded: StatCounter,
}

/// Snapshot of a bridge's counters.
#[cfg(feature = "stats")]
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadStats {
    /// Items handed to the consumer.
    pub delivered: usize,
    /// Items that went through the delivery queue instead of the fast path.
    pub buffered: usize,
    /// Items dropped by cancellation, failure or a contract breach.
    pub discarded: usize,
}

impl<T: Send + 'static> ReadBridge<T> {
    /// Creates a bridge whose queue holds `queue_capacity(prefetch)` items.
    ///
    /// Read interest is first reported on [`refresh`](Self::refresh) or on
    /// the first signal, whichever comes first.
    pub fn new(prefetch: usize, control: Arc<dyn ReadControl>) -> Self {
        let capacity = queue_capacity(prefetch);
        let (producer, reader, occupancy) = ringbuffer_spsc(capacity);

        let inner = Inner {
            capacity,
            demand: DemandTracker::new(),
            running: AtomicUsize::new(0),
            status: Status::new(),
            error: OnceLock::new(),
            failure: OnceLock::new(),
            reading: AtomicBool::new(false),
            control,
            occupancy,
            producer: UnsafeCell::new(producer),
            reader: UnsafeCell::new(reader),
            consumer: UnsafeCell::new(None),
            #[cfg(feature = "stats")]
            stats: Counters::default(),
        };

        Self { inner: Arc::new(inner) }
    }

    /// Hands one item read by the transport to the bridge.
    ///
    /// The item goes straight to the consumer when it has demand and nothing
    /// is queued ahead of it, otherwise it is queued. Items offered after
    /// cancellation or after a terminal signal are dropped on the spot.
    pub fn on_item(&self, item: T) -> Result<(), FlowError> {
        let inner = &*self.inner;

        let s = inner.status.get();
        if status::any(s, CANCELLED | FAILED | DONE | TERMINATED) {
            if !status::any(s, CANCELLED | FAILED | DONE) {
                tracing::debug!("Item received after the stream terminated, dropping it");
            }
            #[cfg(feature = "stats")]
            inner.stats.discarded.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        if inner.running.compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed).is_ok() {
            // SAFETY: we own the drain.
            if let Some(item) = unsafe { inner.try_emit(item) } {
                inner.enqueue(item);
            }
            inner.drain_loop(1);
        } else {
            inner.enqueue(item);
            inner.drain();
        }
        Ok(())
    }

    /// Records normal completion of the transport.
    ///
    /// Completion is delivered after every queued item has been consumed.
    /// When the stream already terminated (including by cancellation) the
    /// call is refused with [`FlowError::Cancelled`].
    pub fn on_complete(&self) -> Result<(), FlowError> {
        let inner = &*self.inner;
        if status::any(inner.status.set(TERMINATED), TERMINATED) {
            tracing::trace!("Completion lost the terminal race");
            return Err(FlowError::Cancelled);
        }
        inner.drain();
        Ok(())
    }

    /// Records a transport failure.
    ///
    /// The error is delivered after the queued items, and takes precedence
    /// over a completion recorded earlier but not yet delivered. Errors
    /// arriving after the consumer cancelled are only logged. An error after
    /// another terminal signal is a contract breach reported back as
    /// [`FlowError::Terminated`].
    pub fn on_error(&self, error: FlowError) -> Result<(), FlowError> {
        let inner = &*self.inner;
        if inner.status.any(CANCELLED) {
            tracing::debug!(%error, "Transport error after cancellation, ignoring it");
            return Ok(());
        }

        let _ = inner.error.set(error.clone());
        let prev = inner.status.set(TERMINATED);
        inner.drain();

        if status::any(prev, TERMINATED) {
            return Err(FlowError::Terminated(Arc::new(error)));
        }
        Ok(())
    }

    /// Re-evaluates the read interest and reports it to the transport.
    pub fn refresh(&self) {
        self.inner.drain();
    }

    /// Number of queued items.
    pub fn pending(&self) -> usize {
        self.inner.occupancy.get()
    }

    /// Outstanding demand.
    pub fn requested(&self) -> u64 {
        self.inner.demand.get()
    }

    /// Delivery queue capacity.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.status.any(CANCELLED)
    }

    /// Whether a terminal signal has been recorded, delivered or not.
    pub fn is_terminated(&self) -> bool {
        self.inner.status.any(TERMINATED | FAILED | DONE)
    }

    #[cfg(feature = "stats")]
    pub fn stats(&self) -> ReadStats {
        let c = &self.inner.stats;
        ReadStats {
            delivered: c.delivered.load(Ordering::Relaxed),
            buffered: c.buffered.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
        }
    }
}

impl<T> fmt::Debug for ReadBridge<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadBridge")
            .field("capacity", &self.inner.capacity)
            .field("pending", &self.inner.occupancy.get())
            .field("requested", &self.inner.demand.get())
            .field("status", &self.inner.status.get())
            .finish()
    }
}

impl<T: Send + 'static> Publisher<T> for ReadBridge<T> {
    type Subscription = BridgeSubscription<T>;

    fn subscribe<S>(&self, subscriber: S) -> Result<Self::Subscription, FlowError>
    where
        S: Subscriber<T>,
    {
        let inner = &*self.inner;
        if status::any(inner.status.set(SUBSCRIBING), SUBSCRIBING) {
            return Err(FlowError::AlreadySubscribed);
        }

        // SAFETY: `SUBSCRIBING` makes us the only writer, and no drain owner
        // reads the cell before `SUBSCRIBED` is published below.
        unsafe { *inner.consumer.get() = Some(Box::new(subscriber)) };
        inner.status.set(SUBSCRIBED);

        // A terminal may already be waiting on an empty queue.
        inner.drain();

        Ok(BridgeSubscription {
            inner: self.inner.clone(),
        })
    }

    fn capacity(&self) -> Option<NonZeroU32> {
        u32::try_from(self.inner.capacity).ok().and_then(NonZeroU32::new)
    }
}

/// Consumer handle of a [`ReadBridge`].
pub struct BridgeSubscription<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for BridgeSubscription<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Subscription for BridgeSubscription<T> {
    fn request(&self, n: u64) -> Result<(), FlowError> {
        if n == 0 {
            return Err(FlowError::InvalidRequest);
        }

        let inner = &*self.inner;
        if inner.status.any(CANCELLED | FAILED | DONE) {
            return Ok(());
        }

        let prev = inner.demand.request(n);
        if n == UNBOUNDED && prev == 0 {
            tracing::trace!("Unbounded demand, switching the transport to free-running reads");
        }
        inner.drain();
        Ok(())
    }

    fn cancel(&self) {
        let inner = &*self.inner;
        if status::any(inner.status.set(CANCELLED | TERMINATED), CANCELLED) {
            return;
        }
        tracing::debug!("Consumer cancelled, discarding queued items");
        inner.drain();
    }
}

impl<T: Send + 'static> Inner<T> {
    fn drain(&self) {
        if self.running.fetch_add(1, Ordering::AcqRel) == 0 {
            self.drain_loop(1);
        }
    }

    /// Runs passes until every increment of `running` has been served.
    fn drain_loop(&self, mut missed: usize) {
        loop {
            // SAFETY: `running` is non-zero and we brought it there.
            unsafe { self.pass() };

            missed = self.running.fetch_sub(missed, Ordering::AcqRel) - missed;
            if missed == 0 {
                break;
            }
        }
    }

    /// Delivers `item` without queueing it if that preserves ordering and
    /// demand allows it. Gives the item back otherwise.
    ///
    /// # Safety
    /// Caller must own the drain.
    unsafe fn try_emit(&self, item: T) -> Option<T> {
        if !self.status.any(SUBSCRIBED) || self.status.any(CANCELLED | FAILED) {
            return Some(item);
        }
        // SAFETY: drain owner.
        let reader = unsafe { &mut *self.reader.get() };
        if !reader.is_empty() || !self.demand.try_produce() {
            return Some(item);
        }

        // SAFETY: drain owner, and `SUBSCRIBED` was observed.
        if let Some(consumer) = unsafe { (*self.consumer.get()).as_mut() } {
            self.deliver(consumer.as_mut(), item);
        }
        None
    }

    fn enqueue(&self, item: T) {
        // SAFETY: transport callbacks are serialized, so this is the only producer.
        let producer = unsafe { &mut *self.producer.get() };
        match producer.push(item) {
            Ok(()) => {
                #[cfg(feature = "stats")]
                self.stats.buffered.fetch_add(1, Ordering::Relaxed);
            }
            Err(item) => {
                drop(item);
                #[cfg(feature = "stats")]
                self.stats.discarded.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(capacity = self.capacity, "Transport kept reading while paused, queue overflow");
                let _ = self.error.set(FlowError::Overflow {
                    capacity: self.capacity,
                });
                self.status.set(TERMINATED);
            }
        }
    }

    fn deliver(&self, consumer: &mut dyn Subscriber<T>, item: T) {
        match consumer.on_item(item) {
            Ok(()) => {
                #[cfg(feature = "stats")]
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => self.fail(e),
        }
    }

    fn fail(&self, e: BoxError) {
        tracing::debug!(error = %e, "Consumer failed, cancelling the stream");
        let _ = self.failure.set(FlowError::consumer(e));
        self.status.set(FAILED);
    }

    /// One round of delivery and state reconciliation.
    ///
    /// # Safety
    /// Caller must own the drain.
    unsafe fn pass(&self) {
        let s = self.status.get();
        if status::any(s, DONE) {
            // An item may still land after teardown emptied the queue
            // SAFETY: drain owner.
            let _late = unsafe { &mut *self.reader.get() }.clear();
            #[cfg(feature = "stats")]
            self.stats.discarded.fetch_add(_late, Ordering::Relaxed);
            return;
        }
        if status::any(s, CANCELLED) {
            // SAFETY: drain owner.
            unsafe { self.teardown() };
            return;
        }
        if !status::any(s, SUBSCRIBED) {
            self.update_reading();
            return;
        }

        // SAFETY: drain owner, and `SUBSCRIBED` was observed.
        let reader = unsafe { &mut *self.reader.get() };
        let Some(consumer) = (unsafe { (*self.consumer.get()).as_mut() }) else {
            return;
        };

        if !status::any(s, FAILED) {
            let demand = self.demand.take_and_reset();
            if demand > 0 {
                let unbounded = demand == UNBOUNDED;
                let mut emitted = 0;
                while unbounded || emitted < demand {
                    if self.status.any(CANCELLED | FAILED) {
                        break;
                    }
                    let Some(item) = reader.pull() else {
                        break;
                    };
                    emitted += 1;
                    self.deliver(consumer.as_mut(), item);
                }

                let left = if unbounded { UNBOUNDED } else { demand - emitted };
                if left > 0 {
                    self.demand.request(left);
                }
            }
        }

        let s = self.status.get();
        if status::any(s, CANCELLED | FAILED) || (status::any(s, TERMINATED) && reader.is_empty()) {
            // SAFETY: drain owner.
            unsafe { self.teardown() };
            return;
        }

        self.update_reading();
    }

    /// Discards the queue, stops reads and delivers the terminal signal, if
    /// one is owed.
    ///
    /// # Safety
    /// Caller must own the drain.
    unsafe fn teardown(&self) {
        let s = self.status.set(DONE);

        // SAFETY: drain owner.
        let _discarded = unsafe { &mut *self.reader.get() }.clear();
        #[cfg(feature = "stats")]
        self.stats.discarded.fetch_add(_discarded, Ordering::Relaxed);

        self.demand.take_and_reset();
        self.reading.store(false, Ordering::Release);
        self.control.set_read_enabled(false);

        if !status::any(s, SUBSCRIBED) {
            return;
        }
        // SAFETY: drain owner, and `SUBSCRIBED` was observed.
        let Some(mut consumer) = (unsafe { (*self.consumer.get()).take() }) else {
            return;
        };

        if status::any(s, CANCELLED) {
            // No signal after cancellation.
        } else if status::any(s, FAILED) {
            let e = self.failure.get().cloned().unwrap_or(FlowError::Cancelled);
            consumer.on_error(e);
        } else if let Some(e) = self.error.get() {
            consumer.on_error(e.clone());
        } else {
            consumer.on_complete();
        }
    }

    /// Reports read interest to the transport when it changed.
    fn update_reading(&self) {
        let want = !self.status.any(TERMINATED | DONE)
            && (self.demand.get() > 0 || self.occupancy.get() < self.capacity / 2);
        if self.reading.swap(want, Ordering::AcqRel) != want {
            tracing::trace!(reading = want, pending = self.occupancy.get(), "Read interest changed");
            self.control.set_read_enabled(want);
        }
    }
}
