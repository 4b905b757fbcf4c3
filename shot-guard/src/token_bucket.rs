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
use crate::wait_queue::within;

/// A continuously refilling token bucket.
///
/// Tokens are stored as fixed-point micro-tokens (see [`PRECISION`]) so that
/// fractional refills from many threads add up exactly. The bucket starts
/// full.
#[derive(Debug)]
pub struct TokenBucket {
    /// Refill rate in micro-tokens per second
    rate: AtomicU64,
    /// Maximum whole tokens
    capacity: AtomicU64,
    /// Current micro-tokens
    tokens: AtomicU64,
    /// Nanos (from anchor) up to which elapsed time has been turned into tokens
    last_refill: AtomicU64,
    ticker: Ticker,
    waiters: WaitQueue,
}

impl TokenBucket {
    /// Creates a full bucket refilling at `rate` tokens per second.
    pub fn new(rate: f64, capacity: NonZeroU64) -> Result<Self, ConfigError> {
        Self::with_clock(rate, capacity, Clock::new())
    }

    pub fn with_clock(rate: f64, capacity: NonZeroU64, clock: Clock) -> Result<Self, ConfigError> {
        let rate_fp = positive_rate(rate)?;
        let capacity = capacity.get();
        Ok(Self {
            rate: AtomicU64::new(rate_fp),
            capacity: AtomicU64::new(capacity),
            tokens: AtomicU64::new(capacity.saturating_mul(PRECISION)),
            last_refill: AtomicU64::new(0),
            ticker: Ticker::new(clock),
            waiters: WaitQueue::new(),
        })
    }

    /// Takes `tokens` tokens if they are available right now.
    pub fn try_acquire(&self, tokens: u64) -> bool {
        self.process(tokens).is_continue()
    }

    /// Waits until `tokens` tokens can be taken.
    pub fn acquire(&self, tokens: u64) -> Acquire<&Self> {
        Acquire::new(self, tokens)
    }

    /// Waits at most `timeout` for `tokens` tokens.
    pub async fn acquire_timeout(
        &self,
        tokens: u64,
        timeout: Duration,
    ) -> Result<Outcome, AcquireError> {
        within(timeout, self.acquire(tokens)).await
    }

    /// Tokens currently in the bucket, including fractions.
    pub fn available_tokens(&self) -> f64 {
        self.replenish();
        self.tokens.load(Ordering::Acquire) as f64 / PRECISION as f64
    }

    /// Refill rate in tokens per second.
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

    /// Changes the refill rate. A rate of zero stops refilling altogether.
    ///
    /// Time elapsed before the call is credited at the old rate.
    pub fn set_rate(&self, rate: f64) -> Result<(), ConfigError> {
        if !rate.is_finite() || rate < 0.0 {
            return Err(ConfigError::InvalidRate(rate));
        }
        self.refill();
        self.last_refill
            .store(self.ticker.now_ns(), Ordering::Release);
        self.rate.store(rate_to_fixed(rate), Ordering::Release);
        tracing::debug!(rate, "token bucket rate changed");
        self.waiters.drain(self);
        Ok(())
    }

    /// Changes the capacity, discarding tokens above a smaller capacity at once.
    pub fn set_capacity(&self, capacity: NonZeroU64) {
        let capacity = capacity.get();
        self.capacity.store(capacity, Ordering::Release);
        let ceiling = capacity.saturating_mul(PRECISION);
        let _ = self
            .tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |tokens| {
                (tokens > ceiling).then_some(ceiling)
            });
        tracing::debug!(capacity, "token bucket capacity changed");
        self.waiters.drain(self);
    }

    /// Fails all parked and future suspending acquires.
    pub fn close(&self) {
        self.waiters.close();
    }

    fn replenish(&self) {
        if self.refill() {
            self.waiters.drain(self);
        }
    }

    /// Turns elapsed time into tokens. Returns `true` if this call added any.
    fn refill(&self) -> bool {
        let now = self.ticker.now_ns();
        let rate = self.rate.load(Ordering::Acquire);
        let last = self.last_refill.load(Ordering::Acquire);

        let elapsed = now.saturating_sub(last);
        let added = units_for(elapsed, rate);
        if added == 0 {
            // Keep the remainder for the next call
            return false;
        }

        // Advance by the time actually converted, never past `now`
        let consumed = nanos_until(added, rate).map_or(elapsed, |ns| ns.min(elapsed));

        // Only the thread that moves the timestamp applies the delta
        if self
            .last_refill
            .compare_exchange(last, last + consumed, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }

        let ceiling = self.capacity.load(Ordering::Acquire).saturating_mul(PRECISION);
        let _ = self
            .tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |tokens| {
                Some(tokens.saturating_add(added).min(ceiling))
            });
        true
    }

    fn take(&self, amount: u64) -> ControlFlow<Reason> {
        let capacity = self.capacity.load(Ordering::Acquire);
        if amount > capacity {
            return ControlFlow::Break(Reason::Oversized {
                requested: amount,
                limit: capacity,
            });
        }

        let needed = amount.saturating_mul(PRECISION);
        match self
            .tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |tokens| {
                tokens.checked_sub(needed)
            }) {
            Ok(_) => ControlFlow::Continue(()),
            Err(tokens) => {
                let rate = self.rate.load(Ordering::Acquire);
                match nanos_until(needed - tokens, rate) {
                    Some(wait) => ControlFlow::Break(Reason::Overloaded {
                        retry_after: Duration::from_nanos(wait),
                    }),
                    None => ControlFlow::Break(Reason::Exhausted),
                }
            }
        }
    }
}

impl Strategy for TokenBucket {
    fn process(&self, amount: u64) -> ControlFlow<Reason> {
        // Parked callers get the new tokens first
        self.replenish();
        self.take(amount)
    }
}

impl Admission for TokenBucket {
    fn waiters(&self) -> &WaitQueue {
        &self.waiters
    }

    fn admit(&self, amount: u64) -> ControlFlow<Reason> {
        self.refill();
        self.take(amount)
    }

    fn restore(&self, amount: u64) {
        let ceiling = self.capacity.load(Ordering::Acquire).saturating_mul(PRECISION);
        let _ = self
            .tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |tokens| {
                Some(tokens.saturating_add(amount.saturating_mul(PRECISION)).min(ceiling))
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
                .saturating_sub(self.last_refill.load(Ordering::Acquire)),
            rate,
        );
        let have = self.tokens.load(Ordering::Acquire).saturating_add(pending);
        let missing = amount.saturating_mul(PRECISION).saturating_sub(have);
        nanos_until(missing, rate).map(Duration::from_nanos)
    }
}

/// Validates a construction rate and converts it to fixed point.
pub(crate) fn positive_rate(rate: f64) -> Result<u64, ConfigError> {
    if !rate.is_finite() || rate <= 0.0 {
        return Err(ConfigError::InvalidRate(rate));
    }
    match rate_to_fixed(rate) {
        0 => Err(ConfigError::InvalidRate(rate)),
        rate_fp => Ok(rate_fp),
    }
}
