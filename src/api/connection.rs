//! Per-connection wiring of the inbound and outbound flow controllers.
//!
//! A [`ConnectionBridge`] owns the [`ReadBridge`] that buffers what the
//! transport reads, and starts write sequences against the same transport.
//! The transport drives it through the `on_*` callbacks; the application
//! consumes [`inbound`](ConnectionBridge::inbound) and produces through
//! [`send`](ConnectionBridge::send).
use std::{future::Future, sync::Arc, time::Duration};

use tokio::{sync::Notify, task::JoinHandle};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use super::{ReadControl, Transport};
#[cfg(feature = "stats")]
use crate::pipeline::rx::ReadStats;
use crate::{
    error::{FlowError, TransportError},
    flow::Publisher,
    pipeline::{
        rx::{MAX_PREFETCH, ReadBridge},
        tx::{self, WriteContext, WriteSequence},
    },
};

/// Creates a [`ConnectionBuilder`] over `transport`.
pub fn connection<Tr: Transport>(transport: Arc<Tr>) -> ConnectionBuilder<Tr> {
    ConnectionBuilder {
        transport,
        prefetch: MAX_PREFETCH,
    }
}

/// Builder for a [`ConnectionBridge`].
pub struct ConnectionBuilder<Tr> {
    transport: Arc<Tr>,
    prefetch: usize,
}

impl<Tr: Transport> ConnectionBuilder<Tr> {
    /// Number of inbound items buffered ahead of demand.
    ///
    /// Clamped to `[32, 128]` and rounded up to a power of two. Reads pause
    /// once half of it is in use and no demand is outstanding.
    ///
    /// Default: 128
    #[must_use]
    pub fn prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn build(self) -> Arc<ConnectionBridge<Tr>> {
        let control: Arc<dyn ReadControl> = self.transport.clone();
        let inbound = ReadBridge::new(self.prefetch, control);
        let writes = WriteContext {
            transport: self.transport.clone(),
            closed: CancellationToken::new(),
            writable: Arc::new(Notify::new()),
        };

        Arc::new(ConnectionBridge {
            transport: self.transport,
            inbound,
            writes,
            opened: quanta::Instant::now(),
        })
    }
}

/// Application logic run once per established connection.
///
/// When the returned future resolves the connection is flushed and closed.
/// Closures `Fn(Arc<ConnectionBridge<Tr>>) -> impl Future` implement it.
pub trait ConnectionHandler<Tr: Transport>: Send + Sync + 'static {
    fn handle(&self, connection: Arc<ConnectionBridge<Tr>>) -> impl Future<Output = Result<(), FlowError>> + Send;
}

impl<Tr, F, Fut> ConnectionHandler<Tr> for F
where
    Tr: Transport,
    F: Fn(Arc<ConnectionBridge<Tr>>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), FlowError>> + Send,
{
    fn handle(&self, connection: Arc<ConnectionBridge<Tr>>) -> impl Future<Output = Result<(), FlowError>> + Send {
        self(connection)
    }
}

/// Flow control for one connection.
pub struct ConnectionBridge<Tr: Transport> {
    transport: Arc<Tr>,
    inbound: ReadBridge<Tr::Item>,
    writes: WriteContext<Tr>,
    opened: quanta::Instant,
}

impl<Tr: Transport> ConnectionBridge<Tr> {
    /// Inbound items, as a single-consumer [`Publisher`].
    pub fn inbound(&self) -> &ReadBridge<Tr::Item> {
        &self.inbound
    }

    pub fn transport(&self) -> &Arc<Tr> {
        &self.transport
    }

    /// Writes everything `source` produces.
    ///
    /// Sources with a capacity hint are written one window at a time with a
    /// flush per window; other sources are requested in full and flushed once
    /// when they terminate. Must be called within a Tokio runtime.
    pub fn send<P>(&self, source: &P) -> Result<WriteSequence, FlowError>
    where
        P: Publisher<Tr::Item>,
    {
        tx::write(&self.writes, source, source.capacity())
    }

    /// Runs `handler` for this connection on the Tokio runtime, then flushes
    /// and closes the connection.
    pub fn serve<H>(self: &Arc<Self>, handler: Arc<H>) -> JoinHandle<()>
    where
        H: ConnectionHandler<Tr>,
    {
        self.on_connect();

        let connection = self.clone();
        tokio::spawn(async move {
            match handler.handle(connection.clone()).await {
                Ok(()) => {}
                Err(e) if e.is_disconnect() => {
                    tracing::debug!(error = %e, "Connection closed remotely");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Error processing connection. Closing the connection.");
                }
            }
            if connection.transport.is_open() {
                connection.transport.flush();
            }
            connection.close();
        })
    }

    /// Closes the transport. Pending write sequences resolve as cancelled.
    pub fn close(&self) {
        self.transport.close();
        self.writes.closed.cancel();
    }

    /// Resolves once the connection is closed, from either side.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.writes.closed.cancelled()
    }

    pub fn is_closed(&self) -> bool {
        self.writes.closed.is_cancelled()
    }

    /// Time since the bridge was created.
    pub fn uptime(&self) -> Duration {
        quanta::Instant::now().duration_since(self.opened)
    }

    #[cfg(feature = "stats")]
    pub fn stats(&self) -> ReadStats {
        self.inbound.stats()
    }

    // -- transport callbacks

    /// The transport is ready: reports the initial read interest.
    pub fn on_connect(&self) {
        tracing::trace!("Connection established");
        self.inbound.refresh();
    }

    /// One item read from the transport.
    pub fn on_item(&self, item: Tr::Item) {
        if let Err(e) = self.inbound.on_item(item) {
            tracing::error!(error = %e, "Inbound item rejected");
        }
    }

    /// The transport drained its write backlog below the low-water mark.
    pub fn on_writable(&self) {
        self.writes.writable.notify_waiters();
    }

    /// The peer finished sending. Completes the inbound stream; writes stay
    /// possible until the connection is closed.
    pub fn on_read_closed(&self) {
        if let Err(e) = self.inbound.on_complete() {
            tracing::trace!(error = %e, "Inbound already terminated");
        }
    }

    /// The transport is closed. Completes the inbound stream.
    pub fn on_close(&self) {
        tracing::debug!(uptime = ?self.uptime(), "Connection closed");
        self.writes.closed.cancel();
        if let Err(e) = self.inbound.on_complete() {
            tracing::trace!(error = %e, "Inbound already terminated");
        }
    }

    /// The transport failed.
    ///
    /// Errors after the inbound stream ended, or once the connection was
    /// closed from this side, are logged and dropped. Anything else, peer
    /// resets included, terminates the inbound stream.
    pub fn on_error(&self, error: TransportError) {
        if self.inbound.is_terminated() || self.is_closed() {
            tracing::debug!(%error, "Transport error during teardown, ignoring it");
            return;
        }
        if let Err(e) = self.inbound.on_error(error.into()) {
            tracing::warn!(error = %e, "Transport signalled an error after termination");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    };

    use super::*;
    use crate::api::{WriteFuture, inbound};

    #[derive(Default)]
    struct Loopback {
        closed: AtomicBool,
    }

    impl ReadControl for Loopback {
        fn set_read_enabled(&self, _: bool) {}
    }

    impl Transport for Loopback {
        type Item = u32;

        fn write(&self, _: u32) -> WriteFuture {
            Box::pin(async { Ok(()) })
        }

        fn flush(&self) {}

        fn close(&self) {
            self.closed.store(true, Ordering::Release);
        }

        fn is_open(&self) -> bool {
            !self.closed.load(Ordering::Acquire)
        }
    }

    fn reset() -> TransportError {
        io::Error::from(io::ErrorKind::ConnectionReset).into()
    }

    #[tokio::test]
    async fn peer_reset_reaches_the_consumer() {
        let bridge = connection(Arc::new(Loopback::default())).build();
        let mut rx = inbound(bridge.inbound(), 4).unwrap();

        bridge.on_item(1);
        bridge.on_error(reset());
        bridge.on_close();

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(first.unwrap(), Some(1));
        match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap() {
            Err(FlowError::Transport(e)) => assert!(e.is_broken_pipe()),
            other => panic!("Expected the reset, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn errors_after_local_close_are_dropped() {
        let bridge = connection(Arc::new(Loopback::default())).build();
        let mut rx = inbound(bridge.inbound(), 4).unwrap();

        bridge.on_item(1);
        bridge.close();
        bridge.on_error(reset());
        bridge.on_close();

        assert_eq!(rx.recv().await.unwrap(), Some(1));
        assert_eq!(rx.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn errors_after_completion_are_dropped() {
        let bridge = connection(Arc::new(Loopback::default())).build();
        let mut rx = inbound(bridge.inbound(), 4).unwrap();

        bridge.on_read_closed();
        bridge.on_error(io::Error::other("late").into());

        assert_eq!(rx.recv().await.unwrap(), None);
    }
}
