mod demand;
pub(crate) mod event;
mod time;

pub use demand::DemandTracker;
pub(crate) use event::{Notifier, Waiter};
pub(crate) use time::AtomicDuration;
