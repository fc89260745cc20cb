//! Retry loop keeping a logical connection alive.
//!
//! The engine connects, serves the connection with a [`ConnectionHandler`]
//! until it closes, then asks its [`Reconnect`] policy what to do next. The
//! attempt counter is incremented before every decision and is shared by the
//! whole retry sequence: a successful connection does not reset it.
use std::{
    fmt,
    future::Future,
    net::SocketAddr,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU8, AtomicU32, Ordering},
    },
    time::Duration,
};

use tokio::{net::TcpStream, select, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use super::policy::{Decision, Reconnect};
use crate::{
    api::{ConnectionBridge, ConnectionHandler, StreamTransport, Transport, stream},
    error::{FlowError, TransportError},
    pipeline::rx::MAX_PREFETCH,
    sync::AtomicDuration,
};

/// Opens connections to addresses of type `A`.
pub trait Connector<A>: Send + Sync + 'static {
    type Transport: Transport;

    fn connect(
        &self,
        address: &A,
    ) -> impl Future<Output = Result<Arc<ConnectionBridge<Self::Transport>>, TransportError>> + Send;
}

/// [`Connector`] opening TCP connections driven by a [`StreamTransport`].
#[derive(Debug, Clone)]
pub struct TcpConnector {
    prefetch: usize,
    chunk_size: usize,
    half_close: bool,
}

impl TcpConnector {
    pub fn new() -> Self {
        Self {
            prefetch: MAX_PREFETCH,
            chunk_size: 8 * 1024,
            half_close: false,
        }
    }

    /// See [`StreamBuilder::prefetch`](crate::StreamBuilder::prefetch).
    #[must_use]
    pub fn prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// See [`StreamBuilder::chunk_size`](crate::StreamBuilder::chunk_size).
    #[must_use]
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// See [`StreamBuilder::half_close`](crate::StreamBuilder::half_close).
    #[must_use]
    pub fn half_close(mut self, enabled: bool) -> Self {
        self.half_close = enabled;
        self
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector<SocketAddr> for TcpConnector {
    type Transport = StreamTransport;

    async fn connect(&self, address: &SocketAddr) -> Result<Arc<ConnectionBridge<StreamTransport>>, TransportError> {
        let socket = TcpStream::connect(address).await?;
        socket.set_nodelay(true)?;
        let (reader, writer) = socket.into_split();

        // The stream tasks end with the connection
        let (connection, _task) = stream(reader, writer)
            .prefetch(self.prefetch)
            .chunk_size(self.chunk_size)
            .half_close(self.half_close)
            .build();
        Ok(connection)
    }
}

/// Lifecycle of a [`ReconnectEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    Connecting = 0,
    Connected = 1,
    /// The last connect failed.
    Failed = 2,
    /// The last connection closed.
    Closed = 3,
    /// Waiting for the retry delay to elapse.
    Reconnecting = 4,
    /// The policy gave up. Terminal.
    GivenUp = 5,
    /// Stopped through [`ReconnectHandle::stop`]. Terminal.
    Stopped = 6,
}

impl EngineState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Connecting,
            1 => Self::Connected,
            2 => Self::Failed,
            3 => Self::Closed,
            4 => Self::Reconnecting,
            5 => Self::GivenUp,
            _ => Self::Stopped,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::GivenUp | Self::Stopped)
    }
}

/// Keeps a logical connection to `A` alive by reconnecting under a policy.
///
/// ```no_run
/// use std::{net::SocketAddr, sync::Arc, time::Duration};
///
/// use backflow::{ConnectionBridge, ReconnectEngine, ReconnectPolicy, StreamTransport, TcpConnector};
///
/// # async fn example() -> Result<(), backflow::FlowError> {
/// let policy = ReconnectPolicy::builder()
///     .interval(Duration::from_millis(500))
///     .max_attempts(10)
///     .build();
/// let handler = |connection: Arc<ConnectionBridge<StreamTransport>>| async move {
///     connection.send(connection.inbound())?.await
/// };
///
/// let addr: SocketAddr = "127.0.0.1:7000".parse().unwrap();
/// let handle = ReconnectEngine::new(addr, policy).start(TcpConnector::new(), handler);
/// handle.join().await
/// # }
/// ```
pub struct ReconnectEngine<A, R> {
    initial: A,
    policy: R,
}

impl<A, R> ReconnectEngine<A, R>
where
    A: Clone + fmt::Display + Send + Sync + 'static,
    R: Reconnect<A>,
{
    pub fn new(initial: A, policy: R) -> Self {
        Self { initial, policy }
    }

    /// Spawns the retry loop on the Tokio runtime.
    pub fn start<C, H>(self, connector: C, handler: H) -> ReconnectHandle<A>
    where
        C: Connector<A>,
        H: ConnectionHandler<C::Transport>,
    {
        let shared = Arc::new(Shared {
            state: AtomicU8::new(EngineState::Connecting as u8),
            attempts: AtomicU32::new(0),
            address: Mutex::new(self.initial.clone()),
            next_delay: AtomicDuration::zero(),
        });
        let token = CancellationToken::new();

        let task = tokio::spawn(run(
            self,
            connector,
            Arc::new(handler),
            shared.clone(),
            token.clone(),
        ));

        ReconnectHandle { shared, token, task }
    }
}

struct Shared<A> {
    state: AtomicU8,
    attempts: AtomicU32,
    address: Mutex<A>,
    next_delay: AtomicDuration,
}

impl<A> Shared<A> {
    fn set_state(&self, state: EngineState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn set_address(&self, address: A) {
        *self.address.lock().unwrap_or_else(PoisonError::into_inner) = address;
    }
}

/// Handle to a running [`ReconnectEngine`].
pub struct ReconnectHandle<A> {
    shared: Arc<Shared<A>>,
    token: CancellationToken,
    task: JoinHandle<Result<(), FlowError>>,
}

impl<A: Clone> ReconnectHandle<A> {
    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Attempts made so far, across every address.
    pub fn attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::Acquire)
    }

    /// Address of the current or next connection.
    pub fn address(&self) -> A {
        self.shared
            .address
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Delay of the last scheduled retry.
    pub fn next_delay(&self) -> Duration {
        self.shared.next_delay.load(Ordering::Relaxed)
    }

    /// Closes the current connection, if any, and ends the retry loop.
    pub async fn stop(self) -> Result<(), FlowError> {
        self.token.cancel();
        self.join().await
    }

    /// Waits for the retry loop to end.
    ///
    /// Resolves with [`FlowError::GaveUp`] when the policy gave up after a
    /// failed connect, and `Ok` when it gave up after a closed connection or
    /// the engine was stopped.
    pub async fn join(self) -> Result<(), FlowError> {
        match self.task.await {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(error = %e, "Reconnect task failed");
                Err(FlowError::Cancelled)
            }
        }
    }
}

async fn run<A, R, C, H>(
    engine: ReconnectEngine<A, R>,
    connector: C,
    handler: Arc<H>,
    shared: Arc<Shared<A>>,
    token: CancellationToken,
) -> Result<(), FlowError>
where
    A: Clone + fmt::Display + Send + Sync + 'static,
    R: Reconnect<A>,
    C: Connector<A>,
    H: ConnectionHandler<C::Transport>,
{
    let ReconnectEngine { initial, policy } = engine;
    let mut address = initial;
    let mut attempts = 0u32;

    loop {
        shared.set_state(EngineState::Connecting);
        let connected = select! {
            r = connector.connect(&address) => r,
            _ = token.cancelled() => break,
        };

        let failure = match connected {
            Ok(connection) => {
                shared.set_state(EngineState::Connected);
                tracing::info!(%address, "Connected");

                let _served = connection.serve(handler.clone());
                select! {
                    _ = connection.closed() => {}
                    _ = token.cancelled() => {
                        connection.close();
                        break;
                    }
                }

                shared.set_state(EngineState::Closed);
                tracing::debug!(%address, uptime = ?connection.uptime(), "Connection closed");
                None
            }
            Err(e) => {
                shared.set_state(EngineState::Failed);
                Some(e)
            }
        };

        attempts = attempts.saturating_add(1);
        shared.attempts.store(attempts, Ordering::Release);

        let (next, delay) = match policy.reconnect(&address, attempts) {
            Decision::Retry { address, delay } => (address, delay),
            Decision::GiveUp => {
                shared.set_state(EngineState::GivenUp);
                return match failure {
                    Some(source) => {
                        tracing::error!(%address, attempts, error = %source, "Giving up");
                        Err(FlowError::GaveUp { attempts, source })
                    }
                    None => {
                        tracing::info!(%address, attempts, "Giving up");
                        Ok(())
                    }
                };
            }
        };

        match &failure {
            Some(e) => tracing::warn!(
                error = %e,
                "Failed to connect to {}. Attempting reconnect in {}ms.",
                address,
                delay.as_millis()
            ),
            None => tracing::info!("Attempting to reconnect to {} in {}ms.", next, delay.as_millis()),
        }

        shared.next_delay.store(delay, Ordering::Relaxed);
        shared.set_address(next.clone());
        shared.set_state(EngineState::Reconnecting);
        address = next;

        select! {
            _ = tokio::time::sleep(delay) => {}
            _ = token.cancelled() => break,
        }
    }

    shared.set_state(EngineState::Stopped);
    tracing::debug!(attempts, "Reconnect loop stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::atomic::{AtomicBool, AtomicUsize},
    };

    use super::*;
    use crate::{
        api::{ReadControl, WriteFuture, connection},
        reconnect::ReconnectPolicy,
    };

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

    /// Records every address it is asked for.
    #[derive(Clone, Default)]
    struct Recording {
        calls: Arc<Mutex<Vec<&'static str>>>,
        refuse: bool,
    }

    impl Connector<&'static str> for Recording {
        type Transport = Loopback;

        async fn connect(&self, address: &&'static str) -> Result<Arc<ConnectionBridge<Loopback>>, TransportError> {
            self.calls.lock().unwrap().push(*address);
            if self.refuse {
                return Err(io::Error::from(io::ErrorKind::ConnectionRefused).into());
            }
            Ok(connection(Arc::new(Loopback::default())).build())
        }
    }

    fn fast() -> crate::reconnect::ReconnectBuilder<&'static str> {
        ReconnectPolicy::builder().interval(Duration::from_millis(1))
    }

    async fn done(c: Arc<ConnectionBridge<Loopback>>) -> Result<(), FlowError> {
        let _ = c;
        Ok(())
    }

    #[tokio::test]
    async fn gives_up_with_error_when_never_connected() {
        let connector = Recording {
            refuse: true,
            ..Default::default()
        };
        let calls = connector.calls.clone();

        let handle = ReconnectEngine::new("a", fast().max_attempts(3).build()).start(connector, done);
        let r = tokio::time::timeout(Duration::from_secs(5), handle.join()).await.unwrap();

        match r {
            Err(FlowError::GaveUp { attempts, source }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(source, TransportError::Io(_)));
            }
            other => panic!("Expected a give up error, got {other:?}"),
        }
        assert_eq!(calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn gives_up_quietly_after_a_close() {
        let connector = Recording::default();
        let calls = connector.calls.clone();
        let served = Arc::new(AtomicUsize::new(0));

        let counter = served.clone();
        let handler = move |c: Arc<ConnectionBridge<Loopback>>| {
            counter.fetch_add(1, Ordering::SeqCst);
            done(c)
        };

        let handle = ReconnectEngine::new("a", fast().max_attempts(2).build()).start(connector, handler);
        let r = tokio::time::timeout(Duration::from_secs(5), handle.join()).await.unwrap();

        assert!(r.is_ok());
        assert_eq!(calls.lock().unwrap().len(), 2);
        assert_eq!(served.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rotates_through_pool() {
        let connector = Recording {
            refuse: true,
            ..Default::default()
        };
        let calls = connector.calls.clone();

        let policy = fast().addresses(["a", "b", "c"]).max_attempts(5).build();
        let handle = ReconnectEngine::new("a", policy).start(connector, done);
        let _ = tokio::time::timeout(Duration::from_secs(5), handle.join()).await.unwrap();

        assert_eq!(*calls.lock().unwrap(), ["a", "b", "c", "a", "b"]);
    }

    #[tokio::test]
    async fn stop_while_waiting() {
        let policy = ReconnectPolicy::builder().interval(Duration::from_secs(60)).build();
        let connector = Recording {
            refuse: true,
            ..Default::default()
        };

        let handle = ReconnectEngine::new("a", policy).start(connector, done);
        while handle.state() != EngineState::Reconnecting {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(handle.attempts(), 1);
        assert_eq!(handle.address(), "a");
        assert_eq!(handle.next_delay(), Duration::from_secs(60));

        let r = tokio::time::timeout(Duration::from_secs(5), handle.stop()).await.unwrap();
        assert!(r.is_ok());
    }

    #[tokio::test]
    async fn stop_closes_live_connection() {
        let connector = Recording::default();
        let handler = |c: Arc<ConnectionBridge<Loopback>>| async move {
            c.closed().await;
            Ok(())
        };

        let handle = ReconnectEngine::new("a", fast().build()).start(connector, handler);
        while handle.state() != EngineState::Connected {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let r = tokio::time::timeout(Duration::from_secs(5), handle.stop()).await.unwrap();
        assert!(r.is_ok());
    }
}
