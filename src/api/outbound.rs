//! Async push adapter producing a demand-driven [`Publisher`].
//!
//! The sending half waits whenever the consumer is not keeping up, so a
//! producer written as a plain `send().await` loop is paced by the demand of
//! whatever drains the publisher, typically a write sequence.
use std::{
    num::NonZeroU32,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use super::ReadControl;
use crate::{
    error::FlowError,
    flow::{Publisher, Subscriber},
    pipeline::rx::{BridgeSubscription, ReadBridge},
    sync::{Notifier, Waiter, event},
};

/// Creates a sender and the publisher it feeds.
///
/// `capacity` sizes the internal queue like a connection prefetch; the
/// publisher reports it as its capacity hint, so writing it to a connection
/// flushes once per window.
pub fn outbound<T: Send + 'static>(capacity: usize) -> (Outbound<T>, OutboundPublisher<T>) {
    let (notifier, waiter) = event::new();
    let gate = Arc::new(Gate {
        open: AtomicBool::new(false),
        notifier,
    });

    let bridge = ReadBridge::new(capacity, gate.clone());
    bridge.refresh();

    let sender = Outbound {
        bridge: bridge.clone(),
        gate,
        waiter,
    };
    (sender, OutboundPublisher(bridge))
}

struct Gate {
    open: AtomicBool,
    notifier: Notifier,
}

impl ReadControl for Gate {
    fn set_read_enabled(&self, enabled: bool) {
        self.open.store(enabled, Ordering::Release);
        // Also wake on close so a parked sender observes cancellation.
        let _ = self.notifier.notify();
    }
}

/// Sending half created by [`outbound`]. Dropping it completes the sequence.
pub struct Outbound<T: Send + 'static> {
    bridge: ReadBridge<T>,
    gate: Arc<Gate>,
    waiter: Waiter,
}

impl<T: Send + 'static> Outbound<T> {
    /// Queues `item`, waiting while the consumer has paused the sender.
    ///
    /// Fails with [`FlowError::Cancelled`] once the consumer is gone.
    pub async fn send(&mut self, item: T) -> Result<(), FlowError> {
        let bridge = &self.bridge;
        let gate = &self.gate;
        self.waiter
            .wait_until(|| gate.open.load(Ordering::Acquire) || bridge.is_terminated())
            .await
            .map_err(|_| FlowError::Cancelled)?;

        if bridge.is_terminated() {
            return Err(FlowError::Cancelled);
        }
        bridge.on_item(item)
    }

    /// Whether the consumer is currently accepting items without waiting.
    pub fn is_ready(&self) -> bool {
        self.gate.open.load(Ordering::Acquire)
    }

    /// Completes the sequence after the queued items.
    pub fn close(self) {
        // Completion happens on drop.
    }

    /// Terminates the sequence with `error` after the queued items.
    pub fn fail(self, error: FlowError) {
        let _ = self.bridge.on_error(error);
    }
}

impl<T: Send + 'static> Drop for Outbound<T> {
    fn drop(&mut self) {
        if !self.bridge.is_terminated() {
            let _ = self.bridge.on_complete();
        }
    }
}

/// Consuming half created by [`outbound`].
pub struct OutboundPublisher<T>(ReadBridge<T>);

impl<T: Send + 'static> Publisher<T> for OutboundPublisher<T> {
    type Subscription = BridgeSubscription<T>;

    fn subscribe<S>(&self, subscriber: S) -> Result<Self::Subscription, FlowError>
    where
        S: Subscriber<T>,
    {
        self.0.subscribe(subscriber)
    }

    fn capacity(&self) -> Option<NonZeroU32> {
        Publisher::capacity(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::api::inbound;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn paced_by_consumer() {
        const N: u32 = 5_000;

        let (mut tx, publisher) = outbound::<u32>(32);
        assert_eq!(publisher.capacity().map(NonZeroU32::get), Some(32));

        let producer = tokio::spawn(async move {
            for i in 0..N {
                tx.send(i).await.unwrap();
            }
            tx.close();
        });

        let mut rx = inbound(&publisher, 8).unwrap();
        for expected in 0..N {
            let got = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
            assert_eq!(got.unwrap(), Some(expected));
        }
        assert_eq!(rx.recv().await.unwrap(), None);
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn sender_stops_once_consumer_is_gone() {
        let (mut tx, publisher) = outbound::<u32>(32);
        let rx = inbound(&publisher, 4).unwrap();
        tx.send(1).await.unwrap();
        drop(rx);

        let r = tokio::time::timeout(Duration::from_secs(1), tx.send(2)).await.unwrap();
        assert!(matches!(r, Err(FlowError::Cancelled)));
    }

    #[tokio::test]
    async fn sender_parks_at_half_capacity() {
        let (mut tx, _publisher) = outbound::<u32>(32);
        for i in 0..16 {
            tx.send(i).await.unwrap();
        }
        assert!(!tx.is_ready());
        assert!(
            tokio::time::timeout(Duration::from_millis(50), tx.send(16)).await.is_err(),
            "Nobody is consuming, the sender must wait"
        );
    }
}
