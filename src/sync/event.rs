//! One-to-one wake-up signal between a synchronous producer and an async task.
//!
//! A notification raised while nobody waits is remembered, so a waiter never
//! misses the edge it was about to sleep on. Dropping either side closes the
//! signal for the other one.
use std::sync::{
    Arc,
    atomic::{AtomicU8, Ordering},
};

use event_listener::{Event, IntoNotification};
use thiserror::Error;

/// The other side of the signal has been dropped.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("The signal peer has been dropped")]
pub(crate) struct Closed;

const PENDING: u8 = 1 << 0;
const CLOSED: u8 = 1 << 1;

struct Signal {
    event: Event,
    state: AtomicU8,
}

impl Signal {
    fn close(&self) {
        self.state.fetch_or(CLOSED, Ordering::AcqRel);
        self.event.notify(usize::MAX);
    }

    /// Consumes a pending notification.
    fn take(&self) -> Result<bool, Closed> {
        let s = self.state.fetch_and(!PENDING, Ordering::AcqRel);
        if s & PENDING != 0 {
            return Ok(true);
        }
        if s & CLOSED != 0 {
            return Err(Closed);
        }
        Ok(false)
    }
}

pub(crate) fn new() -> (Notifier, Waiter) {
    let signal = Arc::new(Signal {
        event: Event::new(),
        state: AtomicU8::new(0),
    });
    (Notifier(signal.clone()), Waiter(signal))
}

#[repr(transparent)]
pub(crate) struct Notifier(Arc<Signal>);

impl Notifier {
    #[inline]
    pub(crate) fn notify(&self) -> Result<(), Closed> {
        let s = self.0.state.fetch_or(PENDING, Ordering::AcqRel);
        if s & CLOSED != 0 {
            return Err(Closed);
        }
        if s & PENDING == 0 {
            self.0.event.notify(1.additional().relaxed());
        }
        Ok(())
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.0.close();
    }
}

#[repr(transparent)]
pub(crate) struct Waiter(Arc<Signal>);

impl Waiter {
    /// Waits for the next notification.
    ///
    /// A notification raised before the peer was dropped is still returned
    /// once before [`Closed`].
    pub(crate) async fn wait(&self) -> Result<(), Closed> {
        loop {
            if self.0.take()? {
                return Ok(());
            }

            let listener = self.0.event.listen();

            if self.0.take()? {
                return Ok(());
            }

            listener.await;
        }
    }

    /// Waits until `ready` holds, re-evaluating it after every notification.
    pub(crate) async fn wait_until(&self, ready: impl Fn() -> bool) -> Result<(), Closed> {
        while !ready() {
            self.wait().await?;
        }
        Ok(())
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.0.close();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    };

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn wakes_a_sleeping_waiter() {
        let (notifier, waiter) = new();

        let task = tokio::spawn(async move { waiter.wait().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        notifier.notify().unwrap();

        assert_eq!(task.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn remembers_early_notification_once() {
        let (notifier, waiter) = new();

        notifier.notify().unwrap();
        notifier.notify().unwrap();

        assert_eq!(timeout(Duration::from_millis(100), waiter.wait()).await, Ok(Ok(())));
        // Both notifications collapsed into one
        assert!(timeout(Duration::from_millis(20), waiter.wait()).await.is_err());
    }

    #[tokio::test]
    async fn pending_notification_survives_notifier_drop() {
        let (notifier, waiter) = new();

        notifier.notify().unwrap();
        drop(notifier);

        assert_eq!(waiter.wait().await, Ok(()));
        assert_eq!(waiter.wait().await, Err(Closed));
    }

    #[tokio::test]
    async fn dropping_waiter_closes_notifier() {
        let (notifier, waiter) = new();
        drop(waiter);
        assert_eq!(notifier.notify(), Err(Closed));
    }

    #[tokio::test]
    async fn wait_until_rechecks_condition() {
        let (notifier, waiter) = new();
        let flag = Arc::new(AtomicBool::new(false));

        let f = flag.clone();
        let task = tokio::spawn(async move { waiter.wait_until(|| f.load(Ordering::Acquire)).await });

        // Spurious notification without the condition holding
        notifier.notify().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!task.is_finished());

        flag.store(true, Ordering::Release);
        notifier.notify().unwrap();
        assert_eq!(task.await.unwrap(), Ok(()));
    }
}
