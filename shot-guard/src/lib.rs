//! # shot-guard
//!
//! `shot-guard` provides lock-free admission control primitives: a counting
//! [`Semaphore`], three rate limiters ([`TokenBucket`], [`SlidingWindow`],
//! [`LeakyBucket`]) and a [`CircuitBreaker`].
//!
//! ## Core Philosophy
//!
//! Shared state lives in atomics and is only ever changed through
//! Compare-And-Swap (CAS) loops, so no caller can block another and no
//! primitive can deadlock. Fractional tokens are tracked as fixed-point
//! integers, which keeps concurrent refills exact.
//!
//! ## Key Concepts
//!
//! * **Non-blocking checks**: `try_acquire` and [`Strategy::process`] answer
//!   immediately.
//! * **Suspending acquires**: `acquire` parks the calling task on a
//!   [`WaitQueue`] and resumes it once capacity reappears. Combine with
//!   `acquire_timeout` to bound the wait.
//! * **Lazy Evaluation**: tokens, water and windows are recalculated at the
//!   moment of the request. No background threads are spawned; a parked task
//!   arms its own timer for the moment its request could fit.
//!
//! ## Example
//!
//! ```rust
//! use std::num::NonZeroU64;
//!
//! use shot_guard::TokenBucket;
//!
//! let capacity = NonZeroU64::new(10).unwrap();
//! let bucket = TokenBucket::new(100.0, capacity).unwrap();
//!
//! if bucket.try_acquire(1) {
//!     // Request allowed
//! }
//! ```

use std::fmt::Debug;
use std::ops::ControlFlow;
use std::time::Duration;

mod circuit_breaker;
mod clock;
mod error;
mod leaky_bucket;
mod semaphore;
mod sliding_window;
mod token_bucket;
mod wait_queue;

pub use circuit_breaker::CircuitBreaker;
pub use circuit_breaker::CircuitBreakerConfig;
pub use circuit_breaker::CircuitState;
pub use error::AcquireError;
pub use error::BreakerError;
pub use error::ConfigError;
pub use leaky_bucket::LeakyBucket;
pub use semaphore::Semaphore;
pub use sliding_window::SlidingWindow;
pub use token_bucket::TokenBucket;
pub use wait_queue::Acquire;
pub use wait_queue::Admission;
pub use wait_queue::Outcome;
pub use wait_queue::WaitQueue;

/// Scale factor for fixed-point token and water accounting.
///
/// One whole unit is stored as `PRECISION` micro-units.
pub const PRECISION: u64 = 1_000_000;

/// Reasons why a request might be rejected by a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// Capacity will reappear with time; `retry_after` estimates when.
    Overloaded { retry_after: Duration },
    /// Capacity only reappears through an explicit release or reset.
    Exhausted,
    /// The request can never fit, whatever happens.
    Oversized { requested: u64, limit: u64 },
}

/// The core trait for all non-blocking admission checks.
///
/// Strategies must be `Send` and `Sync` to allow sharing across thread boundaries
/// via `Arc`.
pub trait Strategy: Debug + Send + Sync {
    /// Attempts to admit `amount` units of work.
    ///
    /// This method is non-blocking and uses atomic operations to update
    /// internal state.
    ///
    /// # Errors
    ///
    /// Breaks with a [`Reason`] if the request cannot be admitted right now.
    fn process(&self, amount: u64) -> ControlFlow<Reason>;
}
