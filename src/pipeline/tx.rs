//! Outbound flow control.
//!
//! A write sequence pulls items from a [`Publisher`] and submits them to a
//! [`Transport`]. Two pacing strategies exist:
//!
//! - **flush on terminate**: the source has no capacity hint, so everything is
//!   requested upfront and the transport is flushed once, when the source
//!   terminates. The sequence resolves with the outcome of the last write.
//! - **flush on capacity**: the source declares a window of `capacity` items.
//!   One window is requested at a time; the transport is flushed when a
//!   window is fully submitted (or after every write for a window of one) and
//!   the next window is requested only once every write of the current one
//!   completed.
//!
//! Either way the sequence resolves exactly once, and a closing transport
//! cancels the source.
use std::{
    future::{Future, IntoFuture},
    num::NonZeroU32,
    pin::Pin,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::{select, sync::Notify};
use tokio_util::sync::CancellationToken;

use crate::{
    api::{Transport, WriteFuture},
    error::{BoxError, FlowError, TransportError},
    flow::{Publisher, Subscriber, Subscription, UNBOUNDED},
    sync::{Notifier, Waiter, event},
};

/// Largest request window. Larger capacity hints are clamped.
pub const MAX_WINDOW: u32 = (1 << 31) - 1;

/// Connection-wide collaborators of every write sequence.
pub(crate) struct WriteContext<Tr> {
    pub(crate) transport: Arc<Tr>,
    /// Cancelled when the transport closes.
    pub(crate) closed: CancellationToken,
    /// Notified when the transport becomes writable again.
    pub(crate) writable: Arc<Notify>,
}

impl<Tr> Clone for WriteContext<Tr> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            closed: self.closed.clone(),
            writable: self.writable.clone(),
        }
    }
}

/// Pending outcome of a write sequence.
///
/// Resolves `Ok(())` once every item has been written and flushed. A
/// sequence whose transport closed first resolves
/// `Err(FlowError::Cancelled)`.
#[must_use = "a write sequence reports its outcome only when awaited"]
pub struct WriteSequence {
    core: Arc<dyn Outcome>,
    waiter: Waiter,
}

trait Outcome: Send + Sync {
    fn get(&self) -> Option<Result<(), FlowError>>;
}

impl WriteSequence {
    /// Outcome, if already known.
    pub fn try_result(&self) -> Option<Result<(), FlowError>> {
        self.core.get()
    }
}

impl IntoFuture for WriteSequence {
    type Output = Result<(), FlowError>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move {
            loop {
                if let Some(r) = self.core.get() {
                    return r;
                }
                if self.waiter.wait().await.is_err() {
                    // The controller went away without an outcome.
                    return self.core.get().unwrap_or(Err(FlowError::Cancelled));
                }
            }
        })
    }
}

/// State shared by a controller, its write watchers and its close watcher.
struct Core<Tr: Transport> {
    transport: Arc<Tr>,
    writable: Arc<Notify>,
    subscription: OnceLock<Box<dyn Subscription>>,
    result: OnceLock<Result<(), FlowError>>,
    resolved: Notifier,
    finished: CancellationToken,
}

impl<Tr: Transport> Outcome for Core<Tr> {
    fn get(&self) -> Option<Result<(), FlowError>> {
        self.result.get().cloned()
    }
}

impl<Tr: Transport> Core<Tr> {
    fn new(ctx: &WriteContext<Tr>) -> (Arc<Self>, Waiter) {
        let (resolved, waiter) = event::new();
        let core = Arc::new(Self {
            transport: ctx.transport.clone(),
            writable: ctx.writable.clone(),
            subscription: OnceLock::new(),
            result: OnceLock::new(),
            resolved,
            finished: CancellationToken::new(),
        });
        (core, waiter)
    }

    /// Records the outcome. Only the first call has an effect.
    fn resolve(&self, r: Result<(), FlowError>) -> bool {
        if self.result.set(r).is_err() {
            return false;
        }
        let _ = self.resolved.notify();
        self.finished.cancel();
        true
    }

    fn is_resolved(&self) -> bool {
        self.result.get().is_some()
    }

    fn request(&self, n: u64) {
        if let Some(s) = self.subscription.get() {
            if let Err(e) = s.request(n) {
                self.resolve(Err(e));
            }
        }
    }

    fn cancel_upstream(&self) {
        if let Some(s) = self.subscription.get() {
            s.cancel();
        }
    }

    fn fail_write(&self, e: TransportError) {
        if e.is_broken_pipe() {
            tracing::debug!(error = %e, "Write failed, connection closed remotely");
        } else {
            tracing::error!(error = %e, "Write error");
        }
        if self.resolve(Err(e.into())) {
            self.cancel_upstream();
        }
    }

    fn start(self: &Arc<Self>, subscription: Box<dyn Subscription>, closed: CancellationToken, initial: u64) {
        let _ = self.subscription.set(subscription);

        let core = self.clone();
        tokio::spawn(async move {
            select! {
                _ = closed.cancelled() => {
                    if core.resolve(Err(FlowError::Cancelled)) {
                        tracing::debug!("Transport closed, cancelling the write sequence");
                        core.cancel_upstream();
                    }
                }
                _ = core.finished.cancelled() => {}
            }
        });

        self.request(initial);
    }
}

/// Starts writing `source` to the transport.
///
/// `window` selects flush-on-capacity pacing; `None` selects
/// flush-on-terminate. Must be called within a Tokio runtime.
pub(crate) fn write<Tr, P>(ctx: &WriteContext<Tr>, source: &P, window: Option<NonZeroU32>) -> Result<WriteSequence, FlowError>
where
    Tr: Transport,
    P: Publisher<Tr::Item>,
{
    let (core, waiter) = Core::new(ctx);

    let initial = match window {
        None => {
            let subscriber = FlushOnTerminate {
                core: core.clone(),
                last: None,
            };
            let subscription = source.subscribe(subscriber)?;
            core.start(Box::new(subscription), ctx.closed.clone(), UNBOUNDED);
            return Ok(WriteSequence { core, waiter });
        }
        Some(w) => w.get().min(MAX_WINDOW),
    };

    let subscriber = FlushOnCapacity {
        core: core.clone(),
        window: Arc::new(Window::new(initial)),
    };
    let subscription = source.subscribe(subscriber)?;
    core.start(Box::new(subscription), ctx.closed.clone(), u64::from(initial));
    Ok(WriteSequence { core, waiter })
}

/// Unbounded pacing.
struct FlushOnTerminate<Tr: Transport> {
    core: Arc<Core<Tr>>,
    last: Option<WriteFuture>,
}

impl<Tr: Transport> FlushOnTerminate<Tr> {
    fn finish(&mut self, error: Option<FlowError>) {
        let core = self.core.clone();
        let last = self.last.take();

        if !core.transport.is_open() {
            core.resolve(error.map_or(Ok(()), Err));
            return;
        }

        core.transport.flush();
        tokio::spawn(async move {
            let written = match last {
                Some(w) => w.await,
                None => Ok(()),
            };
            match (error, written) {
                (Some(e), _) => {
                    core.resolve(Err(e));
                }
                (None, Err(e)) => core.fail_write(e),
                (None, Ok(())) => {
                    core.resolve(Ok(()));
                }
            }
        });
    }
}

impl<Tr: Transport> Subscriber<Tr::Item> for FlushOnTerminate<Tr> {
    fn on_item(&mut self, item: Tr::Item) -> Result<(), BoxError> {
        if self.core.is_resolved() {
            return Err(FlowError::WriteAfterTerminal.into());
        }
        let written = self.core.transport.write(item);
        // Only the last write is awaited on termination, earlier ones are watched here
        if let Some(earlier) = self.last.replace(written) {
            let core = self.core.clone();
            tokio::spawn(async move {
                if let Err(e) = earlier.await {
                    core.fail_write(e);
                }
            });
        }
        Ok(())
    }

    fn on_error(&mut self, error: FlowError) {
        self.finish(Some(error));
    }

    fn on_complete(&mut self) {
        self.finish(None);
    }
}

/// Window accounting packed in a single word.
///
/// ```text
///   63  62       31..61       0..30
///  [ - |done| acknowledged | submitted ]
/// ```
struct Window {
    state: AtomicU64,
    capacity: u32,
}

const FIELD_BITS: u32 = 31;
const FIELD_MASK: u64 = (1 << FIELD_BITS) - 1;
const DONE: u64 = 1 << (2 * FIELD_BITS);

const fn submitted(s: u64) -> u64 {
    s & FIELD_MASK
}

const fn acknowledged(s: u64) -> u64 {
    (s >> FIELD_BITS) & FIELD_MASK
}

#[derive(Debug, PartialEq, Eq)]
enum Step {
    Wait,
    NextWindow,
    Resolve,
}

impl Window {
    fn new(capacity: u32) -> Self {
        Self {
            state: AtomicU64::new(0),
            capacity,
        }
    }

    /// Counts one more submitted write and returns the window's fill level.
    fn submit(&self) -> u64 {
        submitted(self.state.fetch_add(1, Ordering::AcqRel)) + 1
    }

    /// Counts one completed write.
    fn ack(&self) -> Step {
        let capacity = u64::from(self.capacity);
        let mut step = Step::Wait;
        let _ = self.state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
            let done = s & DONE;
            let sub = submitted(s);
            let ack = acknowledged(s) + 1;
            if sub == capacity && ack == capacity {
                step = if done != 0 { Step::Resolve } else { Step::NextWindow };
                Some(done)
            } else {
                step = if done != 0 && ack == sub { Step::Resolve } else { Step::Wait };
                Some(done | (ack << FIELD_BITS) | sub)
            }
        });
        step
    }

    /// Marks the source as done. No slot of the current window is filled
    /// anymore.
    fn complete(&self) -> Step {
        let s = self.state.fetch_or(DONE, Ordering::AcqRel);
        if acknowledged(s) == submitted(s) {
            Step::Resolve
        } else {
            Step::Wait
        }
    }
}

/// Windowed pacing.
struct FlushOnCapacity<Tr: Transport> {
    core: Arc<Core<Tr>>,
    window: Arc<Window>,
}

impl<Tr: Transport> FlushOnCapacity<Tr> {
    fn on_written(core: &Arc<Core<Tr>>, window: &Window, r: Result<(), TransportError>) {
        if let Err(e) = r {
            core.fail_write(e);
            return;
        }
        match window.ack() {
            Step::Wait => {}
            Step::Resolve => {
                core.resolve(Ok(()));
            }
            Step::NextWindow => Self::next_window(core, window.capacity),
        }
    }

    fn next_window(core: &Arc<Core<Tr>>, capacity: u32) {
        if core.is_resolved() {
            return;
        }
        if core.transport.is_writable() {
            core.request(u64::from(capacity));
            return;
        }

        tracing::trace!("Transport not writable, parking the next window");
        let core = core.clone();
        tokio::spawn(async move {
            loop {
                let notified = core.writable.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if core.transport.is_writable() {
                    break;
                }
                select! {
                    _ = notified => {}
                    _ = core.finished.cancelled() => return,
                }
            }
            core.request(u64::from(capacity));
        });
    }
}

impl<Tr: Transport> Subscriber<Tr::Item> for FlushOnCapacity<Tr> {
    fn on_item(&mut self, item: Tr::Item) -> Result<(), BoxError> {
        if self.core.is_resolved() {
            return Err(FlowError::WriteAfterTerminal.into());
        }

        let capacity = self.window.capacity;
        let filled = self.window.submit();
        if filled > u64::from(capacity) {
            return Err(FlowError::Overflow {
                capacity: capacity as usize,
            }
            .into());
        }

        let written = self.core.transport.write(item);
        if capacity == 1 || filled == u64::from(capacity) {
            self.core.transport.flush();
        }

        let core = self.core.clone();
        let window = self.window.clone();
        tokio::spawn(async move {
            let r = written.await;
            Self::on_written(&core, &window, r);
        });
        Ok(())
    }

    fn on_error(&mut self, error: FlowError) {
        // Items of the partial window still reach the peer
        self.core.transport.flush();
        self.core.resolve(Err(error));
    }

    fn on_complete(&mut self) {
        self.core.transport.flush();
        if self.window.complete() == Step::Resolve {
            self.core.resolve(Ok(()));
        }
    }
}
