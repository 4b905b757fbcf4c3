use std::sync::Arc;
use std::time::Duration;

use shot_guard::Admission;
use shot_guard::CircuitBreaker;
use tower::Layer;

use crate::breaker::CircuitBreakerService;
use crate::service::RateLimitService;

/// Applies admission control from a shared limiter to requests.
#[derive(Debug)]
pub struct RateLimitLayer<L>
where
    L: ?Sized,
{
    limiter: Arc<L>,
    fail_fast: bool,
    timeout: Option<Duration>,
    cost: u64,
    release_on_completion: bool,
}

impl<L> Clone for RateLimitLayer<L>
where
    L: ?Sized,
{
    fn clone(&self) -> Self {
        Self {
            limiter: Arc::clone(&self.limiter),
            fail_fast: self.fail_fast,
            timeout: self.timeout,
            cost: self.cost,
            release_on_completion: self.release_on_completion,
        }
    }
}

impl<L> RateLimitLayer<L>
where
    L: Admission + ?Sized,
{
    /// Create a RateLimitLayer
    pub fn new(limiter: Arc<L>) -> Self {
        RateLimitLayer {
            limiter,
            fail_fast: false,
            timeout: None,
            cost: 1,
            release_on_completion: false,
        }
    }

    /// Set whether the service should fail immediately when out of capacity.
    ///
    /// If `true`, the service will return `GuardError::RateLimited` (or
    /// `GuardError::Overloaded` for limiters that only recover on release)
    /// instead of waiting.
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Set a unified timeout for both waiting for admission and request execution.
    ///
    /// If the total time exceeds this duration, the service
    /// will return `GuardError::Timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set how many units each request takes from the limiter.
    pub fn with_cost(mut self, cost: u64) -> Self {
        self.cost = cost;
        self
    }

    /// Give each request's units back once its response completes.
    ///
    /// Combined with a [`shot_guard::Semaphore`] this bounds in-flight requests.
    pub fn with_release_on_completion(mut self, release: bool) -> Self {
        self.release_on_completion = release;
        self
    }
}

impl<L, S> Layer<S> for RateLimitLayer<L>
where
    L: Admission + ?Sized,
{
    type Service = RateLimitService<L, S>;

    fn layer(&self, service: S) -> Self::Service {
        let mut svc = RateLimitService::new(service, Arc::clone(&self.limiter))
            .with_fail_fast(self.fail_fast)
            .with_cost(self.cost)
            .with_release_on_completion(self.release_on_completion);
        if let Some(timeout) = self.timeout {
            svc = svc.with_timeout(timeout);
        }
        svc
    }
}

/// Applies a shared [`CircuitBreaker`] to requests.
#[derive(Debug, Clone)]
pub struct CircuitBreakerLayer {
    breaker: Arc<CircuitBreaker>,
}

impl CircuitBreakerLayer {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self { breaker }
    }
}

impl<S> Layer<S> for CircuitBreakerLayer {
    type Service = CircuitBreakerService<S>;

    fn layer(&self, service: S) -> Self::Service {
        CircuitBreakerService::new(service, Arc::clone(&self.breaker))
    }
}
