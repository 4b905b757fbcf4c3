//! # Tower Guard
//!
//! `tower-guard` puts the lock-free admission control primitives of
//! [`shot_guard`] in front of any [Tower](https://github.com/tower-rs/tower)
//! service.
//!
//! ## Layers
//!
//! 1. [`RateLimitLayer`]: admits each request through a shared limiter
//!    ([`shot_guard::TokenBucket`], [`shot_guard::SlidingWindow`],
//!    [`shot_guard::LeakyBucket`] or [`shot_guard::Semaphore`]). By default a
//!    request waits in the limiter's queue until it is admitted, surfacing
//!    back-pressure through `poll_ready`. It can instead fail fast, bound the
//!    wait (and the inner call) with a timeout, charge a per-request cost, and
//!    hand capacity back when the response completes.
//! 2. [`CircuitBreakerLayer`]: rejects requests while a shared
//!    [`shot_guard::CircuitBreaker`] is open and reports every admitted
//!    request's outcome to it.
//!
//! All middleware errors travel as [`tower::BoxError`] wrapping a cloneable
//! [`GuardError`].
//!
//! ## Feature Flags
//!
//! - `axum`: Enables `IntoResponse` for [`GuardError`], allowing automatic conversion
//!   to HTTP status codes (408, 429, 503, 500).

mod breaker;
mod error;
mod layer;
mod service;


pub use breaker::BreakerFuture;
pub use breaker::CircuitBreakerService;
pub use error::GuardError;
pub use layer::CircuitBreakerLayer;
pub use layer::RateLimitLayer;
pub use service::Permit;
pub use service::RateLimitService;
pub use service::ResponseFuture;
