use std::fmt;
use std::future::Future;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use quanta::Clock;

use super::BreakerError;
use super::ConfigError;
use crate::clock::Ticker;

/// Position of a [`CircuitBreaker`] in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CircuitState {
    /// Requests flow normally
    Closed = 0,
    /// Requests are rejected until the reset timeout elapses
    Open = 1,
    /// Probe requests are let through to test recovery
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            1 => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        };
        f.write_str(s)
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in `Closed` before opening
    pub failure_threshold: u64,
    /// Successes in `HalfOpen` before closing again
    pub success_threshold: u64,
    /// Time after the last failure before an `Open` breaker lets a probe through
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u64) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u64) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::Zero("failure_threshold"));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::Zero("success_threshold"));
        }
        Ok(())
    }
}

/// A lock-free Closed / Open / HalfOpen circuit breaker.
///
/// Callers ask [`CircuitBreaker::allow_request`] before doing work and then
/// report the result exactly once with [`CircuitBreaker::on_success`] or
/// [`CircuitBreaker::on_failure`]. Reporting for a request that was never
/// admitted, or twice for the same request, is not detected and skews the
/// counters. [`CircuitBreaker::execute`] and [`CircuitBreaker::call`] pair
/// the two for you.
///
/// Every transition is a CAS on the state byte; only the winning thread
/// resets the counters.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: AtomicU8,
    failure_count: AtomicU64,
    success_count: AtomicU64,
    /// Nanos (from anchor) of the most recent failure
    last_failure: AtomicU64,
    reset_timeout_ns: u64,
    ticker: Ticker,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::build(CircuitBreakerConfig::default(), Clock::new())
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Result<Self, ConfigError> {
        Self::with_clock(config, Clock::new())
    }

    pub fn with_clock(config: CircuitBreakerConfig, clock: Clock) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config, clock))
    }

    fn build(config: CircuitBreakerConfig, clock: Clock) -> Self {
        let reset_timeout_ns = config.reset_timeout.as_nanos().min(u64::MAX as u128) as u64;
        Self {
            config,
            state: AtomicU8::new(CircuitState::Closed as u8),
            failure_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            last_failure: AtomicU64::new(0),
            reset_timeout_ns,
            ticker: Ticker::new(clock),
        }
    }

    /// Returns `true` if a request may proceed.
    ///
    /// An `Open` breaker whose reset timeout has elapsed moves to `HalfOpen`
    /// and admits the caller. Racing callers all get `true` even though only
    /// one of them performs the transition.
    pub fn allow_request(&self) -> bool {
        match self.state() {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let since = self
                    .ticker
                    .now_ns()
                    .saturating_sub(self.last_failure.load(Ordering::Acquire));
                if since < self.reset_timeout_ns {
                    return false;
                }
                self.transition(CircuitState::Open, CircuitState::HalfOpen);
                true
            }
        }
    }

    /// Reports that an admitted request succeeded.
    pub fn on_success(&self) {
        match self.state() {
            CircuitState::Closed => self.failure_count.store(0, Ordering::Release),
            CircuitState::HalfOpen => {
                let successes = self.success_count.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.success_threshold {
                    self.transition(CircuitState::HalfOpen, CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Reports that an admitted request failed.
    pub fn on_failure(&self) {
        self.last_failure
            .store(self.ticker.now_ns(), Ordering::Release);

        match self.state() {
            CircuitState::Closed => {
                let failures = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold {
                    self.transition(CircuitState::Closed, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                self.transition(CircuitState::HalfOpen, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Runs `f` if the breaker admits it, reporting the outcome.
    ///
    /// # Errors
    ///
    /// [`BreakerError::Open`] if the call was rejected, or
    /// [`BreakerError::Inner`] with the error `f` returned.
    pub fn execute<T, E, F>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        if !self.allow_request() {
            return Err(BreakerError::Open);
        }
        self.record(f()).map_err(BreakerError::Inner)
    }

    /// Runs `f` if the breaker admits it, and `fallback` if it does not or if
    /// `f` fails.
    pub fn execute_with_fallback<T, E, F, G>(&self, f: F, fallback: G) -> T
    where
        F: FnOnce() -> Result<T, E>,
        G: FnOnce() -> T,
    {
        self.execute(f).unwrap_or_else(|_| fallback())
    }

    /// Async form of [`CircuitBreaker::execute`].
    ///
    /// The future is only created once the breaker has admitted the call.
    /// Dropping the returned future before it completes reports nothing.
    pub async fn call<T, E, F, Fut>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.allow_request() {
            return Err(BreakerError::Open);
        }
        self.record(f().await).map_err(BreakerError::Inner)
    }

    fn record<T, E>(&self, result: Result<T, E>) -> Result<T, E> {
        match &result {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }
        result
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    /// Consecutive failures counted in the current state.
    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::Acquire)
    }

    /// Successes counted in the current `HalfOpen` period.
    pub fn success_count(&self) -> u64 {
        self.success_count.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Forces the breaker `Closed` and clears its counters.
    pub fn reset(&self) {
        self.force(CircuitState::Closed);
    }

    /// Forces the breaker `Open`, as if a failure had just been reported.
    pub fn force_open(&self) {
        self.last_failure
            .store(self.ticker.now_ns(), Ordering::Release);
        self.force(CircuitState::Open);
    }

    fn force(&self, to: CircuitState) {
        let from = CircuitState::from(self.state.swap(to as u8, Ordering::AcqRel));
        self.clear_counts();
        tracing::debug!(%from, %to, "circuit breaker state forced");
    }

    /// Moves `from -> to`. Only the caller that wins the CAS clears the counters.
    fn transition(&self, from: CircuitState, to: CircuitState) {
        if self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.clear_counts();
            tracing::debug!(%from, %to, "circuit breaker transition");
        }
    }

    fn clear_counts(&self) {
        self.failure_count.store(0, Ordering::Release);
        self.success_count.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn breaker(
        failures: u64,
        successes: u64,
        timeout: Duration,
    ) -> (CircuitBreaker, Arc<quanta::Mock>) {
        let (clock, mock) = Clock::mock();
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(failures)
            .with_success_threshold(successes)
            .with_reset_timeout(timeout);
        (CircuitBreaker::with_clock(config, clock).unwrap(), mock)
    }

    #[test]
    fn it_rejects_zero_thresholds() {
        let config = CircuitBreakerConfig::default().with_failure_threshold(0);
        assert_eq!(
            CircuitBreaker::new(config).unwrap_err(),
            ConfigError::Zero("failure_threshold")
        );
        let config = CircuitBreakerConfig::default().with_success_threshold(0);
        assert!(CircuitBreaker::new(config).is_err());

        // A zero reset timeout is allowed
        let config = CircuitBreakerConfig::default().with_reset_timeout(Duration::ZERO);
        assert!(CircuitBreaker::new(config).is_ok());
    }

    #[test]
    fn test_default_config() {
        let cb = CircuitBreaker::default();
        assert_eq!(cb.config().failure_threshold, 5);
        assert_eq!(cb.config().success_threshold, 3);
        assert_eq!(cb.config().reset_timeout, Duration::from_secs(30));
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_full_cycle() {
        let (cb, mock) = breaker(3, 2, Duration::from_millis(100));

        for _ in 0..3 {
            assert!(cb.allow_request());
            cb.on_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());

        mock.increment(Duration::from_millis(99));
        assert!(!cb.allow_request());
        mock.increment(Duration::from_millis(1));
        assert!(cb.allow_request());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.on_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.success_count(), 1);
        cb.on_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.success_count(), 0);
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let (cb, _mock) = breaker(3, 1, Duration::from_secs(1));

        cb.on_failure();
        cb.on_failure();
        assert_eq!(cb.failure_count(), 2);
        cb.on_success();
        assert_eq!(cb.failure_count(), 0);

        cb.on_failure();
        cb.on_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let (cb, mock) = breaker(1, 3, Duration::from_millis(50));

        cb.on_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        mock.increment(Duration::from_millis(50));
        assert!(cb.allow_request());
        cb.on_success();

        cb.on_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.success_count(), 0);

        // The reopen restarts the timeout from the new failure
        mock.increment(Duration::from_millis(49));
        assert!(!cb.allow_request());
        mock.increment(Duration::from_millis(1));
        assert!(cb.allow_request());
    }

    #[test]
    fn test_reset_and_force_open() {
        let (cb, mock) = breaker(1, 1, Duration::from_millis(10));

        cb.force_open();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request());

        cb.force_open();
        mock.increment(Duration::from_millis(10));
        assert!(cb.allow_request());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "CLOSED");
        assert_eq!(CircuitState::Open.to_string(), "OPEN");
        assert_eq!(CircuitState::HalfOpen.to_string(), "HALF_OPEN");
    }

    #[test]
    fn test_execute() {
        let (cb, _mock) = breaker(2, 1, Duration::from_secs(60));

        assert_eq!(cb.execute(|| Ok::<_, &str>(7)), Ok(7));
        assert_eq!(cb.execute(|| Err::<u8, _>("boom")), Err(BreakerError::Inner("boom")));
        assert_eq!(cb.execute(|| Err::<u8, _>("boom")), Err(BreakerError::Inner("boom")));

        let mut ran = false;
        let result = cb.execute(|| {
            ran = true;
            Ok::<_, &str>(1)
        });
        assert!(result.unwrap_err().is_open());
        assert!(!ran, "Open breaker must not run the call");
    }

    #[test]
    fn test_execute_with_fallback() {
        let (cb, _mock) = breaker(1, 1, Duration::from_secs(60));

        assert_eq!(cb.execute_with_fallback(|| Ok::<_, ()>(1), || 0), 1);
        // Failure falls back and opens the breaker
        assert_eq!(cb.execute_with_fallback(|| Err::<u8, _>(()), || 0), 0);
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.execute_with_fallback(|| Ok::<_, ()>(1), || 2), 2);
    }

    #[tokio::test]
    async fn test_async_call() {
        let (cb, _mock) = breaker(1, 1, Duration::from_secs(60));

        let ok = cb.call(|| async { Ok::<_, String>("fine") }).await;
        assert_eq!(ok, Ok("fine"));

        let err = cb.call(|| async { Err::<(), _>("down".to_string()) }).await;
        assert_eq!(err, Err(BreakerError::Inner("down".to_string())));
        assert_eq!(cb.state(), CircuitState::Open);

        let rejected = cb.call(|| async { Ok::<_, String>("never") }).await;
        assert_eq!(rejected, Err(BreakerError::Open));
    }

    #[test]
    fn test_concurrent_failures_open_once() {
        let (cb, mock) = breaker(10, 1, Duration::from_millis(5));
        let cb = Arc::new(cb);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cb = Arc::clone(&cb);
                thread::spawn(move || {
                    for _ in 0..100 {
                        if cb.allow_request() {
                            cb.on_failure();
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        // The mock clock never moved, so the breaker can only be open
        assert_eq!(cb.state(), CircuitState::Open);
        mock.increment(Duration::from_millis(5));
        assert!(cb.allow_request());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }
}
