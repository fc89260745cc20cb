use std::{error::Error, io, sync::Arc};

use thiserror::Error;

/// Boxed error returned by a consumer that fails to accept an item.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Error reported by a transport for a write or for the connection as a whole.
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    /// The transport is closed and cannot accept the operation.
    #[error("The transport is closed")]
    Closed,

    /// The underlying I/O resource failed.
    #[error(transparent)]
    Io(#[from] Arc<io::Error>),
}

impl TransportError {
    /// Returns `true` when the error is the peer going away mid-write.
    ///
    /// These errors are expected while a connection is being torn down and
    /// are logged at debug level instead of being surfaced.
    pub fn is_broken_pipe(&self) -> bool {
        match self {
            Self::Closed => false,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
            ),
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

/// Error delivered as the terminal signal of a sequence, or returned to the
/// caller of a flow-control operation that breaks the protocol.
#[derive(Debug, Error, Clone)]
pub enum FlowError {
    /// A second consumer tried to subscribe to a single-consumer bridge.
    ///
    /// Every bridge serves exactly one consumer for its whole lifetime. The
    /// second subscription is rejected and the first one is not affected.
    #[error("Only one consumer can subscribe to a bridge")]
    AlreadySubscribed,

    /// A demand request of zero items.
    ///
    /// Requests must be strictly positive. The request is rejected
    /// synchronously and the outstanding demand is left untouched.
    #[error("Requested demand must be strictly positive")]
    InvalidRequest,

    /// The sequence was cancelled before it could terminate normally.
    ///
    /// Returned to a transport that signals completion after the stream has
    /// already been terminated, and used to resolve write sequences whose
    /// transport closed before they finished.
    #[error("The sequence has been cancelled")]
    Cancelled,

    /// A terminal signal arrived after another terminal signal.
    ///
    /// This is a contract breach from the signalling side. The payload is
    /// the error that could not be delivered.
    #[error("Stream already terminated, dropping error: {0}")]
    Terminated(Arc<FlowError>),

    /// An item was offered to a write sequence that already terminated.
    #[error("Write attempted after the write sequence terminated")]
    WriteAfterTerminal,

    /// The transport delivered an item into a full delivery queue.
    ///
    /// The bridge pauses reads before its queue fills up, so this only
    /// happens when the transport ignores the pause. The item is dropped and
    /// the stream terminates with this error.
    #[error("Delivery queue overflow: capacity {capacity} exceeded")]
    Overflow { capacity: usize },

    /// The consumer failed while handling an item.
    #[error("Consumer failed: {0}")]
    Consumer(Arc<dyn Error + Send + Sync + 'static>),

    /// The transport reported an error.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The reconnect policy gave up before a connection could be established.
    #[error("Reconnection gave up after {attempts} attempts: {source}")]
    GaveUp { attempts: u32, source: TransportError },
}

impl FlowError {
    pub(crate) fn consumer(e: BoxError) -> Self {
        Self::Consumer(Arc::from(e))
    }

    /// Returns `true` when the error only reflects a connection being torn down.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Transport(e) => e.is_broken_pipe(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broken_pipe_is_a_disconnect() {
        let e = TransportError::from(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(e.is_broken_pipe());
        assert!(FlowError::from(e).is_disconnect());

        let e = TransportError::from(io::Error::other("boom"));
        assert!(!e.is_broken_pipe());
        assert!(!FlowError::from(e).is_disconnect());
        assert!(!FlowError::InvalidRequest.is_disconnect());
    }

    #[test]
    fn errors_are_cloneable_with_shared_sources() {
        let e = FlowError::consumer("bad item".into());
        let c = e.clone();
        assert_eq!(e.to_string(), c.to_string());
        assert_eq!(c.to_string(), "Consumer failed: bad item");
    }
}
