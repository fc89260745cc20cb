//! Reconnect decisions.
//!
//! A [`Reconnect`] implementation decides, after every failed connect or
//! closed connection, whether to try again, where, and after how long.
//! [`ReconnectPolicy`] is the incremental backoff implementation over an
//! optional pool of addresses.
use std::time::Duration;

/// Outcome of a reconnect decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision<A> {
    /// Connect to `address` once `delay` has elapsed.
    Retry { address: A, delay: Duration },
    /// Stop reconnecting.
    GiveUp,
}

/// Decides how to reconnect.
///
/// `attempt` counts every failed connect and every closed connection of the
/// retry sequence, starting at 1 for the first decision. It is never reset by
/// a successful connection.
pub trait Reconnect<A>: Send + Sync + 'static {
    fn reconnect(&self, current: &A, attempt: u32) -> Decision<A>;
}

/// Incremental backoff over an optional round-robin pool of addresses.
///
/// With an empty pool the current address is retried.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy<A> {
    interval: Duration,
    multiplier: f64,
    max_interval: Duration,
    max_attempts: Option<u32>,
    addresses: Vec<A>,
}

impl<A> ReconnectPolicy<A> {
    /// Creates a [`ReconnectBuilder`] with the default settings.
    pub fn builder() -> ReconnectBuilder<A> {
        ReconnectBuilder::default()
    }

    /// Delay before the given attempt.
    ///
    /// The base interval with a multiplier of at most 1, otherwise the
    /// interval times the attempt, capped at the maximum interval.
    pub fn delay(&self, attempt: u32) -> Duration {
        if self.multiplier <= 1.0 {
            return self.interval;
        }
        self.interval.saturating_mul(attempt).min(self.max_interval)
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    pub fn addresses(&self) -> &[A] {
        &self.addresses
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }
}

impl<A> Default for ReconnectPolicy<A> {
    fn default() -> Self {
        ReconnectBuilder::default().build()
    }
}

impl<A> Reconnect<A> for ReconnectPolicy<A>
where
    A: Clone + Send + Sync + 'static,
{
    fn reconnect(&self, current: &A, attempt: u32) -> Decision<A> {
        if self.exhausted(attempt) {
            return Decision::GiveUp;
        }

        let address = if self.addresses.is_empty() {
            current.clone()
        } else {
            self.addresses[attempt as usize % self.addresses.len()].clone()
        };
        Decision::Retry {
            address,
            delay: self.delay(attempt),
        }
    }
}

/// Builder for a [`ReconnectPolicy`].
#[derive(Debug, Clone)]
pub struct ReconnectBuilder<A> {
    interval: Duration,
    multiplier: f64,
    max_interval: Option<Duration>,
    max_attempts: Option<u32>,
    addresses: Vec<A>,
}

impl<A> Default for ReconnectBuilder<A> {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(5000),
            multiplier: 1.0,
            max_interval: None,
            max_attempts: None,
            addresses: Vec::new(),
        }
    }
}

impl<A> ReconnectBuilder<A> {
    /// Base delay between attempts.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Any value above 1 makes the delay grow linearly with the attempt.
    ///
    /// Default: 1
    #[must_use]
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Upper bound of the growing delay.
    ///
    /// Default: unbounded
    #[must_use]
    pub fn max_interval(mut self, max_interval: Duration) -> Self {
        self.max_interval = Some(max_interval);
        self
    }

    /// Gives up once this many attempts have been made.
    ///
    /// Default: unbounded
    #[must_use]
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Adds an address to the round-robin pool.
    #[must_use]
    pub fn address(mut self, address: A) -> Self {
        self.addresses.push(address);
        self
    }

    #[must_use]
    pub fn addresses(mut self, addresses: impl IntoIterator<Item = A>) -> Self {
        self.addresses.extend(addresses);
        self
    }

    pub fn build(self) -> ReconnectPolicy<A> {
        let Self {
            interval,
            multiplier,
            max_interval,
            max_attempts,
            addresses,
        } = self;

        ReconnectPolicy {
            interval,
            multiplier,
            max_interval: max_interval.unwrap_or(Duration::MAX),
            max_attempts,
            addresses,
        }
    }
}

/// Reconnect settings in plain units, deserializable with the `serde`
/// feature.
///
/// ```
/// # use backflow::{ReconnectConfig, ReconnectPolicy};
/// let config = ReconnectConfig::<String> {
///     interval_ms: 250,
///     max_attempts: Some(10),
///     ..Default::default()
/// };
/// let policy: ReconnectPolicy<String> = config.into();
/// assert_eq!(policy.delay(3).as_millis(), 250);
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ReconnectConfig<A> {
    pub interval_ms: u64,
    pub multiplier: f64,
    pub max_interval_ms: Option<u64>,
    pub max_attempts: Option<u32>,
    pub addresses: Vec<A>,
}

impl<A> Default for ReconnectConfig<A> {
    fn default() -> Self {
        Self {
            interval_ms: 5000,
            multiplier: 1.0,
            max_interval_ms: None,
            max_attempts: None,
            addresses: Vec::new(),
        }
    }
}

impl<A> From<ReconnectConfig<A>> for ReconnectBuilder<A> {
    fn from(config: ReconnectConfig<A>) -> Self {
        let mut builder = ReconnectBuilder::default()
            .interval(Duration::from_millis(config.interval_ms))
            .multiplier(config.multiplier)
            .addresses(config.addresses);
        if let Some(ms) = config.max_interval_ms {
            builder = builder.max_interval(Duration::from_millis(ms));
        }
        if let Some(max) = config.max_attempts {
            builder = builder.max_attempts(max);
        }
        builder
    }
}

impl<A> From<ReconnectConfig<A>> for ReconnectPolicy<A> {
    fn from(config: ReconnectConfig<A>) -> Self {
        ReconnectBuilder::from(config).build()
    }
}
