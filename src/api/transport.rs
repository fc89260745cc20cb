use std::{future::Future, pin::Pin};

use crate::error::TransportError;

/// Completion of one submitted write.
///
/// The write itself is submitted when [`Transport::write`] returns; awaiting
/// the future only observes its outcome.
pub type WriteFuture = Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'static>>;

/// Read interest toggle of a push-style source.
pub trait ReadControl: Send + Sync + 'static {
    /// Enables or pauses reading. Pausing is advisory: a source may deliver
    /// a few more items already in flight.
    fn set_read_enabled(&self, enabled: bool);
}

/// Outbound half of a connection, as seen by the bridges.
///
/// Inbound signals flow the other way, from the transport into the
/// [`ConnectionBridge`](crate::ConnectionBridge) callbacks.
pub trait Transport: ReadControl {
    type Item: Send + 'static;

    /// Submits `item` and returns its completion.
    fn write(&self, item: Self::Item) -> WriteFuture;

    /// Pushes submitted writes to the wire.
    fn flush(&self);

    /// Starts closing the connection. Idempotent.
    fn close(&self);

    fn is_open(&self) -> bool;

    /// Whether the transport can take more writes without growing its
    /// backlog past its high-water mark.
    fn is_writable(&self) -> bool {
        true
    }
}
