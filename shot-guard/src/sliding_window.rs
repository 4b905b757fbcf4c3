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
use super::Reason;
use super::Strategy;
use super::WaitQueue;
use crate::clock::Ticker;
use crate::wait_queue::within;

/// Set while the winner of a roll publishes the new window start.
const ROLLING: u64 = 1 << 63;
const GEN_SHIFT: u32 = 32;
const GEN_MASK: u64 = !ROLLING & !COUNT_MASK;
const COUNT_MASK: u64 = u32::MAX as u64;

#[inline]
fn count_of(state: u64) -> u64 {
    state & COUNT_MASK
}

#[inline]
fn with_count(state: u64, count: u64) -> u64 {
    (state & !COUNT_MASK) | count
}

/// A fresh window: next generation, zero count, start not yet published.
#[inline]
fn next_window(state: u64) -> u64 {
    ((state & GEN_MASK).wrapping_add(1 << GEN_SHIFT) & GEN_MASK) | ROLLING
}

/// A window-based request counter.
///
/// Admits up to `max_requests` per window. The window restarts at the first
/// request that arrives after it has run its full length, so boundaries are
/// hard cutoffs rather than a rolling log: up to `2 * max_requests`
/// admissions can land in any `window`-long interval that straddles a
/// boundary.
///
/// The count shares one word with a window generation and a rolling flag, so
/// a single CAS both starts a new window and zeroes its count.
#[derive(Debug)]
pub struct SlidingWindow {
    max_requests: u64,
    window_ns: u64,
    /// Timestamp (nanos from anchor) for the start of the current window
    window_start: AtomicU64,
    /// `ROLLING | generation | count`
    state: AtomicU64,
    ticker: Ticker,
    waiters: WaitQueue,
}

impl SlidingWindow {
    pub fn new(max_requests: NonZeroU64, window: Duration) -> Result<Self, ConfigError> {
        Self::with_clock(max_requests, window, Clock::new())
    }

    pub fn with_clock(
        max_requests: NonZeroU64,
        window: Duration,
        clock: Clock,
    ) -> Result<Self, ConfigError> {
        let window_ns = window.as_nanos().min(u64::MAX as u128) as u64;
        if window_ns == 0 {
            return Err(ConfigError::Zero("window"));
        }
        if max_requests.get() > COUNT_MASK {
            return Err(ConfigError::TooLarge {
                name: "max_requests",
                max: COUNT_MASK,
            });
        }
        Ok(Self {
            max_requests: max_requests.get(),
            window_ns,
            window_start: AtomicU64::new(0),
            state: AtomicU64::new(0),
            ticker: Ticker::new(clock),
            waiters: WaitQueue::new(),
        })
    }

    /// Admits one request if the current window has room.
    pub fn try_acquire(&self) -> bool {
        self.process(1).is_continue()
    }

    /// Waits until the request fits in a window.
    pub fn acquire(&self) -> Acquire<&Self> {
        Acquire::new(self, 1)
    }

    /// Waits at most `timeout` for room in a window.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<Outcome, AcquireError> {
        within(timeout, self.acquire()).await
    }

    /// Requests admitted in the current window.
    pub fn current_count(&self) -> u64 {
        let state = self.state.load(Ordering::Acquire);
        if state & ROLLING == 0 && self.expired(self.window_start.load(Ordering::Acquire)) {
            0
        } else {
            count_of(state)
        }
    }

    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        Duration::from_nanos(self.window_ns)
    }

    /// Number of parked acquires.
    pub fn waiting(&self) -> usize {
        self.waiters.len()
    }

    /// Starts a fresh window now, regardless of how much of the current one is left.
    pub fn reset(&self) {
        // A roll already in flight starts a fresh window of its own
        if self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                (state & ROLLING == 0).then(|| next_window(state))
            })
            .is_ok()
        {
            self.publish(self.ticker.now_ns());
            tracing::debug!("sliding window reset");
        }
        self.waiters.drain(self);
    }

    /// Fails all parked and future suspending acquires.
    pub fn close(&self) {
        self.waiters.close();
    }

    fn expired(&self, start: u64) -> bool {
        self.ticker.now_ns().saturating_sub(start) >= self.window_ns
    }

    /// Starts a new window if the current one has expired. Returns `true` only
    /// for the single caller that actually moved the window.
    fn roll(&self) -> bool {
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            if state & ROLLING != 0 {
                return false;
            }
            let now = self.ticker.now_ns();
            let start = self.window_start.load(Ordering::Acquire);
            if now.saturating_sub(start) < self.window_ns {
                return false;
            }
            match self.state.compare_exchange_weak(
                state,
                next_window(state),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.publish(now);
                    return true;
                }
                // Admissions still landing in the old window, or a roll by another thread
                Err(actual) => state = actual,
            }
        }
    }

    /// Publishes the start of the window opened by a winning roll.
    fn publish(&self, start: u64) {
        self.window_start.store(start, Ordering::Release);
        self.state.fetch_and(!ROLLING, Ordering::AcqRel);
    }

    fn take(&self, amount: u64) -> ControlFlow<Reason> {
        if amount > self.max_requests {
            return ControlFlow::Break(Reason::Oversized {
                requested: amount,
                limit: self.max_requests,
            });
        }
        match self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                let next = count_of(state).checked_add(amount)?;
                (next <= self.max_requests).then(|| with_count(state, next))
            }) {
            Ok(_) => ControlFlow::Continue(()),
            Err(_) => ControlFlow::Break(Reason::Overloaded {
                retry_after: self.remaining(),
            }),
        }
    }

    fn remaining(&self) -> Duration {
        let now = self.ticker.now_ns();
        let expires = self
            .window_start
            .load(Ordering::Acquire)
            .saturating_add(self.window_ns);
        Duration::from_nanos(expires.saturating_sub(now))
    }
}

impl Strategy for SlidingWindow {
    #[inline]
    fn process(&self, amount: u64) -> ControlFlow<Reason> {
        if self.roll() {
            self.waiters.drain(self);
        }
        self.take(amount)
    }
}

impl Admission for SlidingWindow {
    fn waiters(&self) -> &WaitQueue {
        &self.waiters
    }

    fn admit(&self, amount: u64) -> ControlFlow<Reason> {
        self.roll();
        self.take(amount)
    }

    fn restore(&self, amount: u64) {
        // If the window rolled in between this only makes the new window
        // slightly more generous.
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                Some(with_count(state, count_of(state).saturating_sub(amount)))
            });
    }

    fn limit(&self) -> Option<u64> {
        Some(self.max_requests)
    }

    fn retry_after(&self, _amount: u64) -> Option<Duration> {
        Some(self.remaining())
    }
}
