use std::num::NonZeroU64;
use std::ops::ControlFlow;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use quanta::Clock;

use super::Acquire;
use super::AcquireError;
use super::Admission;
use super::ConfigError;
use super::Outcome;
use super::PRECISION;
use super::Reason;
use super::Strategy;
use super::WaitQueue;
use crate::clock::Ticker;
use crate::clock::nanos_until;
use crate::clock::rate_to_fixed;
use crate::clock::units_for;
use crate::token_bucket::positive_rate;
use crate::wait_queue::within;

/// A leaky bucket: admissions pour water in, which drains at a steady rate.
///
/// The bucket starts empty and rejects any admission that would overflow
/// `capacity`. Water is kept in fixed-point micro-units.
#[derive(Debug)]
pub struct LeakyBucket {
    /// Drain rate in micro-units per second
    rate: AtomicU64,
    capacity: AtomicU64,
    /// Current micro-units of water
    water: AtomicU64,
    /// Nanos (from anchor) up to which elapsed time has been drained
    last_leak: AtomicU64,
    ticker: Ticker,
    waiters: WaitQueue,
}

impl LeakyBucket {
    /// Creates an empty bucket draining `rate` units per second.
    pub fn new(rate: f64, capacity: NonZeroU64) -> Result<Self, ConfigError> {
        Self::with_clock(rate, capacity, Clock::new())
    }

    pub fn with_clock(rate: f64, capacity: NonZeroU64, clock: Clock) -> Result<Self, ConfigError> {
        Ok(Self {
            rate: AtomicU64::new(positive_rate(rate)?),
            capacity: AtomicU64::new(capacity.get()),
            water: AtomicU64::new(0),
            last_leak: AtomicU64::new(0),
            ticker: Ticker::new(clock),
            waiters: WaitQueue::new(),
        })
    }

    /// Pours in `amount` if it fits right now.
    pub fn try_acquire(&self, amount: u64) -> bool {
        self.process(amount).is_continue()
    }

    /// Waits until `amount` fits in the bucket.
    pub fn acquire(&self, amount: u64) -> Acquire<&Self> {
        Acquire::new(self, amount)
    }

    /// Waits at most `timeout` for `amount` to fit.
    pub async fn acquire_timeout(
        &self,
        amount: u64,
        timeout: Duration,
    ) -> Result<Outcome, AcquireError> {
        within(timeout, self.acquire(amount)).await
    }

    /// Water currently in the bucket, including fractions.
    pub fn current_level(&self) -> f64 {
        self.replenish();
        self.water.load(Ordering::Acquire) as f64 / PRECISION as f64
    }

    /// Drain rate in units per second.
    pub fn rate(&self) -> f64 {
        self.rate.load(Ordering::Acquire) as f64 / PRECISION as f64
    }

    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Acquire)
    }

    /// Number of parked acquires.
    pub fn waiting(&self) -> usize {
        self.waiters.len()
    }

    /// Changes the drain rate. A rate of zero stops draining altogether.
    pub fn set_rate(&self, rate: f64) -> Result<(), ConfigError> {
        if !rate.is_finite() || rate < 0.0 {
            return Err(ConfigError::InvalidRate(rate));
        }
        self.leak();
        self.last_leak.store(self.ticker.now_ns(), Ordering::Release);
        self.rate.store(rate_to_fixed(rate), Ordering::Release);
        tracing::debug!(rate, "leaky bucket rate changed");
        self.waiters.drain(self);
        Ok(())
    }

    /// Changes the capacity. Water above a smaller capacity spills out at once.
    pub fn set_capacity(&self, capacity: NonZeroU64) {
        let capacity = capacity.get();
        self.capacity.store(capacity, Ordering::Release);
        let ceiling = capacity.saturating_mul(PRECISION);
        let _ = self
            .water
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |water| {
                (water > ceiling).then_some(ceiling)
            });
        tracing::debug!(capacity, "leaky bucket capacity changed");
        self.waiters.drain(self);
    }

    /// Fails all parked and future suspending acquires.
    pub fn close(&self) {
        self.waiters.close();
    }

    fn replenish(&self) {
        if self.leak() {
            self.waiters.drain(self);
        }
    }

    /// Drains water for the elapsed time. Returns `true` if this call removed any.
    fn leak(&self) -> bool {
        let now = self.ticker.now_ns();
        let rate = self.rate.load(Ordering::Acquire);
        let last = self.last_leak.load(Ordering::Acquire);

        let elapsed = now.saturating_sub(last);
        let leaked = units_for(elapsed, rate);
        if leaked == 0 {
            return false;
        }

        let consumed = nanos_until(leaked, rate).map_or(elapsed, |ns| ns.min(elapsed));
        if self
            .last_leak
            .compare_exchange(last, last + consumed, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }

        // The timestamp moves even when empty, so idle time is never banked
        self.water
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |water| {
                (water > 0).then(|| water.saturating_sub(leaked))
            })
            .is_ok()
    }

    fn pour(&self, amount: u64) -> ControlFlow<Reason> {
        let capacity = self.capacity.load(Ordering::Acquire);
        if amount > capacity {
            return ControlFlow::Break(Reason::Oversized {
                requested: amount,
                limit: capacity,
            });
        }

        let ceiling = capacity.saturating_mul(PRECISION);
        let added = amount.saturating_mul(PRECISION);
        match self
            .water
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |water| {
                let next = water.saturating_add(added);
                (next <= ceiling).then_some(next)
            }) {
            Ok(_) => ControlFlow::Continue(()),
            Err(water) => {
                let excess = water.saturating_add(added) - ceiling;
                match nanos_until(excess, self.rate.load(Ordering::Acquire)) {
                    Some(wait) => ControlFlow::Break(Reason::Overloaded {
                        retry_after: Duration::from_nanos(wait),
                    }),
                    None => ControlFlow::Break(Reason::Exhausted),
                }
            }
        }
    }
}

impl Strategy for LeakyBucket {
    fn process(&self, amount: u64) -> ControlFlow<Reason> {
        self.replenish();
        self.pour(amount)
    }
}

impl Admission for LeakyBucket {
    fn waiters(&self) -> &WaitQueue {
        &self.waiters
    }

    fn admit(&self, amount: u64) -> ControlFlow<Reason> {
        self.leak();
        self.pour(amount)
    }

    fn restore(&self, amount: u64) {
        let _ = self
            .water
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |water| {
                Some(water.saturating_sub(amount.saturating_mul(PRECISION)))
            });
    }

    fn limit(&self) -> Option<u64> {
        Some(self.capacity.load(Ordering::Acquire))
    }

    fn retry_after(&self, amount: u64) -> Option<Duration> {
        let rate = self.rate.load(Ordering::Acquire);
        let pending = units_for(
            self.ticker
                .now_ns()
                .saturating_sub(self.last_leak.load(Ordering::Acquire)),
            rate,
        );
        let water = self.water.load(Ordering::Acquire).saturating_sub(pending);
        let ceiling = self.capacity.load(Ordering::Acquire).saturating_mul(PRECISION);
        let excess = water
            .saturating_add(amount.saturating_mul(PRECISION))
            .saturating_sub(ceiling);
        nanos_until(excess, rate).map(Duration::from_nanos)
    }
}
