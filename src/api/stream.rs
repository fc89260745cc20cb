//! [`Transport`] over a Tokio byte stream.
//!
//! The reader half is drained by a background task that honours the read
//! interest of the [`ConnectionBridge`]: while reads are paused the task parks
//! on a wake-up signal instead of reading. The writer half is owned by a
//! second task fed through a command queue; write completions resolve when
//! the flush that follows them succeeds.
//!
//! ```no_run
//! use tokio::net::TcpStream;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let stream = TcpStream::connect("127.0.0.1:8080").await?;
//! let (reader, writer) = stream.into_split();
//!
//! let (connection, task) = backflow::stream(reader, writer)
//!     .prefetch(64)
//!     .half_close(true)
//!     .build();
//!
//! // Echo everything back, one window of 64 chunks at a time. Half-close keeps
//! // the connection open until the last window is written.
//! let echo = connection.send(connection.inbound())?;
//! echo.await?;
//! task.stop().await;
//! # Ok(())
//! # }
//! ```
use std::{
    future::Future,
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter},
    select,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use super::{ConnectionBridge, ReadControl, Transport, WriteFuture, connection::connection};
use crate::{
    error::TransportError,
    pipeline::rx::MAX_PREFETCH,
    sync::{AtomicDuration, Notifier, Waiter, event},
};

type Completion = oneshot::Sender<Result<(), TransportError>>;

enum Command {
    Write(Vec<u8>, Completion),
    Flush,
    Shutdown,
}

/// Byte stream transport. Items are the chunks read from or written to the
/// stream.
pub struct StreamTransport {
    commands: mpsc::UnboundedSender<Command>,
    /// Writes submitted but not yet handed to the stream.
    queued: AtomicUsize,
    high_water: usize,
    reading: AtomicBool,
    read_gate: Notifier,
    token: CancellationToken,
}

impl StreamTransport {
    /// Flushes pending writes and shuts the write half down, leaving the
    /// read half open until the peer closes. Later writes fail with
    /// [`TransportError::Closed`].
    pub fn shutdown_write(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

impl ReadControl for StreamTransport {
    fn set_read_enabled(&self, enabled: bool) {
        self.reading.store(enabled, Ordering::Release);
        if enabled {
            let _ = self.read_gate.notify();
        }
    }
}

impl Transport for StreamTransport {
    type Item = Vec<u8>;

    fn write(&self, item: Vec<u8>) -> WriteFuture {
        let (done, outcome) = oneshot::channel();
        self.queued.fetch_add(1, Ordering::AcqRel);
        if self.token.is_cancelled() || self.commands.send(Command::Write(item, done)).is_err() {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            return Box::pin(async { Err(TransportError::Closed) });
        }
        Box::pin(async move { outcome.await.unwrap_or(Err(TransportError::Closed)) })
    }

    fn flush(&self) {
        let _ = self.commands.send(Command::Flush);
    }

    fn close(&self) {
        self.token.cancel();
    }

    fn is_open(&self) -> bool {
        !self.token.is_cancelled()
    }

    fn is_writable(&self) -> bool {
        self.queued.load(Ordering::Acquire) < self.high_water
    }
}

/// Background tasks driving a [`StreamTransport`].
pub struct StreamTask {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    token: CancellationToken,
    write_timeout: Arc<AtomicDuration>,
}

impl StreamTask {
    /// Sets how long a single write may block before failing the connection.
    ///
    /// Default: 10 seconds
    pub fn set_write_timeout(&self, timeout: Duration) {
        self.write_timeout.store(timeout, Ordering::Relaxed);
    }

    /// Waits for both tasks to finish on their own.
    pub async fn join(self) {
        let _ = self.reader.await;
        let _ = self.writer.await;
    }

    /// Closes the stream: pending writes are flushed, then both halves stop.
    pub async fn stop(self) {
        self.token.cancel();
        self.join().await;
    }
}

/// Creates a [`StreamBuilder`] over the two halves of a byte stream.
pub fn stream<R, W>(reader: R, writer: W) -> StreamBuilder<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    StreamBuilder {
        reader,
        writer,
        chunk_size: 8 * 1024,
        prefetch: MAX_PREFETCH,
        high_water: 64,
        low_water: 32,
        half_close: false,
    }
}

/// Builder for a stream-backed [`ConnectionBridge`].
pub struct StreamBuilder<R, W> {
    reader: R,
    writer: W,
    chunk_size: usize,
    prefetch: usize,
    high_water: usize,
    low_water: usize,
    half_close: bool,
}

impl<R, W> StreamBuilder<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Largest chunk handed to the inbound stream per read.
    ///
    /// Default: 8 KiB
    #[must_use]
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "Chunk size must be positive");
        self.chunk_size = chunk_size;
        self
    }

    /// Inbound chunks buffered ahead of demand. See
    /// [`ConnectionBuilder::prefetch`](super::ConnectionBuilder::prefetch).
    ///
    /// Default: 128
    #[must_use]
    pub fn prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Queued writes at which the transport reports itself unwritable.
    ///
    /// Default: 64
    #[must_use]
    pub fn write_high_water(mut self, high_water: usize) -> Self {
        self.high_water = high_water;
        self
    }

    /// Queued writes under which the transport reports itself writable again.
    ///
    /// Default: 32
    #[must_use]
    pub fn write_low_water(mut self, low_water: usize) -> Self {
        self.low_water = low_water;
        self
    }

    /// Keeps the connection open after the peer stops sending. The inbound
    /// stream completes but writes stay possible until the sequence being
    /// sent terminates. When disabled, end of input closes the connection.
    ///
    /// Default: false
    #[must_use]
    pub fn half_close(mut self, enabled: bool) -> Self {
        self.half_close = enabled;
        self
    }

    /// Spawns the reader and writer tasks. Must be called within a Tokio
    /// runtime.
    #[must_use]
    pub fn build(self) -> (Arc<ConnectionBridge<StreamTransport>>, StreamTask) {
        let Self {
            reader,
            writer,
            chunk_size,
            prefetch,
            high_water,
            low_water,
            half_close,
        } = self;
        assert!(low_water < high_water, "Low water mark must be below the high water mark");

        let (commands, queue) = mpsc::unbounded_channel();
        let (read_gate, gate) = event::new();
        let token = CancellationToken::new();

        let transport = Arc::new(StreamTransport {
            commands,
            queued: AtomicUsize::new(0),
            high_water,
            reading: AtomicBool::new(false),
            read_gate,
            token: token.clone(),
        });
        let bridge = connection(transport).prefetch(prefetch).build();
        bridge.on_connect();

        let write_timeout = Arc::new(AtomicDuration::zero());
        write_timeout.store(Duration::from_secs(10), Ordering::Relaxed);

        let reader = tokio::spawn(read_task(
            reader,
            bridge.clone(),
            gate,
            chunk_size,
            half_close,
            token.clone(),
        ));
        let writer = tokio::spawn(write_task(
            writer,
            queue,
            bridge.clone(),
            low_water,
            write_timeout.clone(),
            token.clone(),
        ));

        let task = StreamTask {
            reader,
            writer,
            token,
            write_timeout,
        };
        (bridge, task)
    }
}

async fn read_task<R>(
    mut reader: R,
    bridge: Arc<ConnectionBridge<StreamTransport>>,
    gate: Waiter,
    chunk_size: usize,
    half_close: bool,
    token: CancellationToken,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let transport = bridge.transport().clone();
    let mut buf = vec![0u8; chunk_size];

    loop {
        // Park while the bridge has paused reads
        select! {
            r = gate.wait_until(|| transport.reading.load(Ordering::Acquire)) => {
                if r.is_err() {
                    break;
                }
            }
            _ = token.cancelled() => break,
        }

        let n = select! {
            r = reader.read(&mut buf) => r,
            _ = token.cancelled() => break,
        };

        match n {
            Ok(0) => {
                tracing::trace!(half_close, "Peer finished sending");
                bridge.on_read_closed();
                if !half_close {
                    // The writer task drains its queue and closes the bridge
                    token.cancel();
                }
                break;
            }
            Ok(n) => bridge.on_item(buf[..n].to_vec()),
            Err(e) => {
                bridge.on_error(e.into());
                token.cancel();
                break;
            }
        }
    }
}

async fn write_task<W>(
    writer: W,
    mut queue: mpsc::UnboundedReceiver<Command>,
    bridge: Arc<ConnectionBridge<StreamTransport>>,
    low_water: usize,
    write_timeout: Arc<AtomicDuration>,
    token: CancellationToken,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let transport = bridge.transport().clone();
    let mut writer = BufWriter::new(writer);
    // Completions of writes buffered since the last flush
    let mut unflushed: Vec<Completion> = Vec::new();
    let mut shut = false;

    let failure = loop {
        let command = select! {
            biased;
            c = queue.recv() => c,
            _ = token.cancelled() => None,
        };

        let timeout = write_timeout.load(Ordering::Relaxed);
        match command {
            Some(Command::Write(_, done)) if shut => {
                if transport.queued.fetch_sub(1, Ordering::AcqRel) == low_water + 1 {
                    bridge.on_writable();
                }
                let _ = done.send(Err(TransportError::Closed));
            }
            Some(Command::Write(buf, done)) => {
                let r = io_timeout(timeout, writer.write_all(&buf)).await;
                if transport.queued.fetch_sub(1, Ordering::AcqRel) == low_water + 1 {
                    bridge.on_writable();
                }
                match r {
                    Ok(()) => unflushed.push(done),
                    Err(e) => {
                        let e = TransportError::from(e);
                        let _ = done.send(Err(e.clone()));
                        break Some(e);
                    }
                }
            }
            Some(Command::Flush) if shut => {}
            Some(Command::Flush) => {
                if let Err(e) = io_timeout(timeout, writer.flush()).await {
                    break Some(TransportError::from(e));
                }
                for done in unflushed.drain(..) {
                    let _ = done.send(Ok(()));
                }
            }
            Some(Command::Shutdown) if shut => {}
            Some(Command::Shutdown) => {
                shut = true;
                let r = io_timeout(timeout, writer.shutdown()).await.map_err(TransportError::from);
                for done in unflushed.drain(..) {
                    let _ = done.send(r.clone());
                }
                if let Err(e) = r {
                    break Some(e);
                }
                tracing::trace!("Write half shut down");
            }
            None => break None,
        }
    };

    let flushed = match &failure {
        Some(e) => Err(e.clone()),
        None if shut => Ok(()),
        None => writer.shutdown().await.map_err(TransportError::from),
    };
    for done in unflushed.drain(..) {
        let _ = done.send(flushed.clone());
    }

    queue.close();
    while let Ok(command) = queue.try_recv() {
        if let Command::Write(_, done) = command {
            let _ = done.send(Err(TransportError::Closed));
        }
    }

    token.cancel();
    if let Some(e) = failure {
        bridge.on_error(e);
    }
    bridge.on_close();
}

async fn io_timeout<F>(timeout: Duration, f: F) -> io::Result<()>
where
    F: Future<Output = io::Result<()>>,
{
    match tokio::time::timeout(timeout, f).await {
        Ok(r) => r,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out")),
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    use super::*;
    use crate::api::inbound;

    #[tokio::test]
    async fn shutdown_write_keeps_reading() {
        let (local, mut remote) = duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(local);
        let (connection, task) = stream(reader, writer).half_close(true).build();
        let transport = connection.transport();

        let first = transport.write(b"ping".to_vec());
        transport.shutdown_write();
        first.await.unwrap();
        assert!(matches!(transport.write(b"late".to_vec()).await, Err(TransportError::Closed)));

        let mut got = Vec::new();
        remote.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"ping");

        let mut rx = inbound(connection.inbound(), 4).unwrap();
        remote.write_all(b"pong").await.unwrap();
        drop(remote);

        let mut echoed = Vec::new();
        while let Some(chunk) = rx.recv().await.unwrap() {
            echoed.extend_from_slice(&chunk);
        }
        assert_eq!(echoed, b"pong");
        assert!(!connection.is_closed());

        task.stop().await;
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn end_of_input_closes_the_connection() {
        let (local, mut remote) = duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(local);
        let (connection, task) = stream(reader, writer).build();

        let mut rx = inbound(connection.inbound(), 4).unwrap();
        remote.write_all(b"last").await.unwrap();
        drop(remote);

        // Bytes read before the end are still delivered
        let mut got = Vec::new();
        while let Some(chunk) = rx.recv().await.unwrap() {
            got.extend_from_slice(&chunk);
        }
        assert_eq!(got, b"last");

        tokio::time::timeout(Duration::from_secs(1), connection.closed())
            .await
            .unwrap();
        assert!(connection.is_closed());
        task.join().await;
    }

    #[tokio::test]
    async fn writability_follows_water_marks() {
        let (local, _remote) = duplex(16);
        let (reader, writer) = tokio::io::split(local);
        let (connection, task) = stream(reader, writer)
            .write_high_water(2)
            .write_low_water(1)
            .build();
        task.set_write_timeout(Duration::from_millis(50));
        let transport = connection.transport();
        assert!(transport.is_writable());

        // The peer never reads, so the writer stalls on the first large write
        let a = transport.write(vec![0u8; 64 * 1024]);
        let _b = transport.write(vec![0u8; 64 * 1024]);
        let _c = transport.write(vec![0u8; 64 * 1024]);
        assert!(!transport.is_writable());

        assert!(a.await.is_err());

        task.stop().await;
    }
}
