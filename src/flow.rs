//! Demand-driven signalling contracts shared by every bridge.
//!
//! A [`Publisher`] hands items to exactly one [`Subscriber`], never more than
//! the subscriber asked for through its [`Subscription`]. A sequence ends with
//! at most one terminal signal, either [`Subscriber::on_error`] or
//! [`Subscriber::on_complete`], and nothing is signalled after it.
use std::num::NonZeroU32;

use crate::error::{BoxError, FlowError};

/// Demand value meaning "no limit". Once reached it is sticky.
pub const UNBOUNDED: u64 = u64::MAX;

/// Receiving end of a demand-driven sequence.
///
/// Signals are serialized: two methods are never invoked concurrently on the
/// same subscriber, which is why they take `&mut self`.
pub trait Subscriber<T>: Send + 'static {
    /// Handles one item.
    ///
    /// Returning an error cancels the upstream, discards anything still
    /// buffered for this subscriber, and delivers the error back through
    /// [`on_error`](Self::on_error) as the terminal signal.
    fn on_item(&mut self, item: T) -> Result<(), BoxError>;

    /// Terminal failure.
    fn on_error(&mut self, error: FlowError);

    /// Terminal success.
    fn on_complete(&mut self);
}

/// Handle a subscriber uses to pull items and to detach.
pub trait Subscription: Send + Sync + 'static {
    /// Adds `n` to the outstanding demand, saturating at [`UNBOUNDED`].
    ///
    /// `n == 0` is rejected with [`FlowError::InvalidRequest`]. Requests made
    /// after the sequence ended are ignored.
    fn request(&self, n: u64) -> Result<(), FlowError>;

    /// Stops the sequence. Idempotent. No signal follows a cancellation.
    fn cancel(&self);
}

impl<S: Subscription + ?Sized> Subscription for Box<S> {
    fn request(&self, n: u64) -> Result<(), FlowError> {
        (**self).request(n)
    }

    fn cancel(&self) {
        (**self).cancel()
    }
}

/// Source of a demand-driven sequence.
pub trait Publisher<T> {
    type Subscription: Subscription;

    /// Attaches `subscriber`. Fails with [`FlowError::AlreadySubscribed`] on
    /// single-consumer sources that already have one.
    fn subscribe<S>(&self, subscriber: S) -> Result<Self::Subscription, FlowError>
    where
        S: Subscriber<T>;

    /// Finite number of items this source keeps in flight, if any.
    ///
    /// Writers use it as the size of their request window.
    fn capacity(&self) -> Option<NonZeroU32> {
        None
    }
}
