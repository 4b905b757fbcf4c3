/// Invalid construction or reconfiguration parameters.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// A rate was negative, NaN or infinite, or zero where a positive rate is required.
    #[error("rate must be a finite positive number, got {0}")]
    InvalidRate(f64),

    /// A parameter that must be at least one was zero.
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    /// A parameter exceeded what the limiter can count.
    #[error("{name} must be at most {max}")]
    TooLarge { name: &'static str, max: u64 },
}

/// Why a suspending acquire could not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AcquireError {
    /// The limiter was closed while (or before) the caller waited.
    #[error("limiter closed")]
    Closed,

    /// The request exceeds the limiter's capacity and can never be satisfied.
    #[error("requested {requested} exceeds limit of {limit}")]
    Oversized { requested: u64, limit: u64 },
}

/// Failure of a call wrapped by a [`crate::CircuitBreaker`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BreakerError<E> {
    /// The breaker denied admission; the wrapped call was never attempted.
    #[error("circuit breaker is open")]
    Open,

    /// The wrapped call ran and failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    /// Returns `true` if the call was rejected without being attempted.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Returns the wrapped call's error, if it ran.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Open => None,
            Self::Inner(err) => Some(err),
        }
    }
}
