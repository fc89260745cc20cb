//! Async pull adapter over any [`Publisher`].
use std::sync::{Arc, OnceLock};

use crate::{
    error::{BoxError, FlowError},
    flow::{Publisher, Subscriber, Subscription},
    pipeline::ringbuf::{RingBufferReaderSPSC, RingBufferWriterSPSC, ringbuffer_spsc},
    sync::{Notifier, Waiter, event},
};

/// Subscribes to `source` and returns a handle yielding its items one `recv`
/// at a time.
///
/// `batch` items are requested upfront (rounded up to a power of two), and
/// demand is topped up by half a batch whenever half a batch has been
/// received, so the source never has more than `batch` items in flight.
pub fn inbound<T, P>(source: &P, batch: usize) -> Result<Inbound<T, P::Subscription>, FlowError>
where
    T: Send + 'static,
    P: Publisher<T>,
{
    let capacity = batch.max(2).next_power_of_two();
    let (writer, reader, _) = ringbuffer_spsc(capacity);
    let (notifier, waiter) = event::new();
    let terminal = Arc::new(OnceLock::new());

    let subscription = source.subscribe(Forward {
        writer,
        capacity,
        notifier,
        terminal: terminal.clone(),
    })?;
    subscription.request(capacity as u64)?;

    Ok(Inbound {
        reader,
        waiter,
        terminal,
        subscription,
        refill: capacity / 2,
        received: 0,
    })
}

/// Receiving half created by [`inbound`].
///
/// Dropping it cancels the subscription.
pub struct Inbound<T, S: Subscription> {
    reader: RingBufferReaderSPSC<T>,
    waiter: Waiter,
    terminal: Arc<OnceLock<Result<(), FlowError>>>,
    subscription: S,
    refill: usize,
    received: usize,
}

impl<T, S: Subscription> Inbound<T, S> {
    /// Receives the next item.
    ///
    /// Returns `Ok(None)` once the source completed and every item has been
    /// received, or the source's error once the items before it have been
    /// received.
    pub async fn recv(&mut self) -> Result<Option<T>, FlowError> {
        loop {
            if let Some(t) = self.try_recv()? {
                return Ok(Some(t));
            }
            if let Some(r) = self.terminal.get().cloned() {
                // Items may have been queued right before the terminal
                if let Some(t) = self.try_recv()? {
                    return Ok(Some(t));
                }
                return r.map(|_| None);
            }
            if self.waiter.wait().await.is_err() && self.terminal.get().is_none() {
                if let Some(t) = self.try_recv()? {
                    return Ok(Some(t));
                }
                return Err(FlowError::Cancelled);
            }
        }
    }

    fn try_recv(&mut self) -> Result<Option<T>, FlowError> {
        let Some(t) = self.reader.pull() else {
            return Ok(None);
        };
        self.received += 1;
        if self.received == self.refill {
            self.received = 0;
            self.subscription.request(self.refill as u64)?;
        }
        Ok(Some(t))
    }
}

impl<T, S: Subscription> Drop for Inbound<T, S> {
    fn drop(&mut self) {
        if self.terminal.get().is_none() {
            self.subscription.cancel();
        }
    }
}

/// Subscriber side: moves items into the ring and wakes the receiver.
struct Forward<T> {
    writer: RingBufferWriterSPSC<T>,
    capacity: usize,
    notifier: Notifier,
    terminal: Arc<OnceLock<Result<(), FlowError>>>,
}

impl<T: Send + 'static> Subscriber<T> for Forward<T> {
    fn on_item(&mut self, item: T) -> Result<(), BoxError> {
        // Demand never exceeds the free slots, so a full ring is a source bug.
        if self.writer.push(item).is_err() {
            return Err(FlowError::Overflow {
                capacity: self.capacity,
            }
            .into());
        }
        let _ = self.notifier.notify();
        Ok(())
    }

    fn on_error(&mut self, error: FlowError) {
        let _ = self.terminal.set(Err(error));
        let _ = self.notifier.notify();
    }

    fn on_complete(&mut self) {
        let _ = self.terminal.set(Ok(()));
        let _ = self.notifier.notify();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{api::ReadControl, pipeline::rx::ReadBridge};

    struct Always;

    impl ReadControl for Always {
        fn set_read_enabled(&self, _: bool) {}
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn receives_in_order_then_completes() {
        const N: u32 = 10_000;

        let bridge = ReadBridge::new(32, Arc::new(Always));
        let mut rx = inbound(&bridge, 16).unwrap();

        let producer = {
            let bridge = bridge.clone();
            std::thread::spawn(move || {
                let mut i = 0;
                while i < N {
                    // Stay below the pause threshold of the queue
                    if bridge.pending() < 8 {
                        bridge.on_item(i).unwrap();
                        i += 1;
                    } else {
                        std::thread::yield_now();
                    }
                }
                bridge.on_complete().unwrap();
            })
        };

        for expected in 0..N {
            let got = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
            assert_eq!(got.unwrap(), Some(expected));
        }
        assert_eq!(rx.recv().await.unwrap(), None);
        producer.join().unwrap();
    }

    #[tokio::test]
    async fn error_after_items() {
        let bridge = ReadBridge::new(32, Arc::new(Always));
        bridge.on_item(1u8).unwrap();
        bridge.on_error(FlowError::InvalidRequest).unwrap();

        let mut rx = inbound(&bridge, 4).unwrap();
        assert_eq!(rx.recv().await.unwrap(), Some(1));
        assert!(matches!(rx.recv().await, Err(FlowError::InvalidRequest)));
    }

    #[tokio::test]
    async fn drop_cancels_source() {
        let bridge = ReadBridge::new(32, Arc::new(Always));
        bridge.on_item(1u8).unwrap();
        let rx = inbound(&bridge, 4).unwrap();
        drop(rx);
        assert!(bridge.is_cancelled());
    }
}
