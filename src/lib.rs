//! Backflow: demand-driven flow control between push-style network transports
//! and pull-style consumers.
//!
//! A transport pushes whatever it reads as fast as the network delivers it,
//! while a consumer wants to say how many items it is ready for. Backflow sits
//! in between, in both directions:
//!
//! - on the read side a [`ReadBridge`] buffers a bounded number of items,
//!   delivers them against the consumer's demand and pauses the transport's
//!   reads before its queue can overflow;
//! - on the write side a write sequence requests items from a [`Publisher`]
//!   and writes them either all at once with a single flush at the end, or in
//!   windows of `capacity` items with one flush per window;
//! - a [`ReconnectEngine`] keeps a logical connection alive by reconnecting
//!   under a [`ReconnectPolicy`].
//!
//! # Overview
//!
//! ```text
//!                 read enabled / paused
//!            ┌──────────────────────────────┐
//!            │                              │
//!  ┌─────────┴──┐ on_item ┌──────────────┐  │ request(n) ┌──────────┐
//!  │ Transport  ├────────►│  ReadBridge  │◄─┴────────────┤ Consumer │
//!  │            │         │ [ queue 32.. │──────────────►│          │
//!  │            │         │        ..128]│  on_item      └────┬─────┘
//!  │            │         └──────────────┘                    │
//!  │            │  write  ┌──────────────┐  request(window)   │
//!  │            │◄────────┤ WriteSequence├───────────────►Publisher
//!  │            │  flush  │              │◄─────────────── items
//!  └─────┬──────┘         └──────────────┘
//!        │ closed / failed
//!        ▼
//!  ReconnectEngine ──► ReconnectPolicy ──► retry after delay | give up
//! ```
//!
//! The queue of a [`ReadBridge`] holds between [`MIN_PREFETCH`] and
//! [`MAX_PREFETCH`] items. Reads stay enabled while the consumer has
//! outstanding demand or while the queue is less than half full, so memory
//! stays bounded no matter how slow the consumer is.
//!
//! # Features
//!
//! - **Single-flight drain**: delivery runs on whichever thread signals first,
//!   without locks, and never blocks the transport
//! - **Ordered terminals**: completion and errors are delivered after every
//!   buffered item; a cancelled consumer receives nothing further
//! - **Windowed writes**: bounded sources are written and flushed one window at
//!   a time, unbounded ones are flushed once when they terminate
//! - **Reconnection**: incremental backoff over a round-robin pool of addresses
//! - **Statistics**: delivered / buffered / discarded counters behind the
//!   `stats` feature
//!
//! # Quick Start
//!
//! ```no_run
//! use tokio::net::TcpStream;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let stream = TcpStream::connect("127.0.0.1:8080").await?;
//!     let (reader, writer) = stream.into_split();
//!     let (connection, task) = backflow::stream(reader, writer).build();
//!
//!     // Produce: every send waits while the connection is not keeping up
//!     let (mut tx, outgoing) = backflow::outbound::<Vec<u8>>(64);
//!     let written = connection.send(&outgoing)?;
//!     tx.send(b"hello".to_vec()).await?;
//!     tx.close();
//!     written.await?;
//!
//!     // Consume: pull at our own pace, the transport pauses when we fall behind
//!     let mut rx = backflow::inbound(connection.inbound(), 32)?;
//!     while let Some(chunk) = rx.recv().await? {
//!         println!("Received {} bytes", chunk.len());
//!     }
//!
//!     task.stop().await;
//!     Ok(())
//! }
//! ```
mod api;
mod error;
mod flow;
mod pipeline;
mod reconnect;
mod sync;

pub use api::*;
pub use error::{BoxError, FlowError, TransportError};
pub use flow::{Publisher, Subscriber, Subscription, UNBOUNDED};
#[cfg(feature = "stats")]
pub use pipeline::rx::ReadStats;
pub use pipeline::{
    rx::{BridgeSubscription, MAX_PREFETCH, MIN_PREFETCH, ReadBridge},
    tx::{MAX_WINDOW, WriteSequence},
};
pub use reconnect::*;
pub use sync::DemandTracker;
