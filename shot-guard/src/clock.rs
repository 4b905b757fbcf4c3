use quanta::Clock;
use quanta::Instant;

/// Monotonic nanoseconds measured from a fixed anchor.
#[derive(Debug, Clone)]
pub(crate) struct Ticker {
    clock: Clock,
    /// A fixed point in time (TSC tick) to calculate deltas from.
    anchor: Instant,
}

impl Ticker {
    pub(crate) fn new(clock: Clock) -> Self {
        let anchor = clock.now();
        Self { clock, anchor }
    }

    #[inline]
    pub(crate) fn now_ns(&self) -> u64 {
        self.clock.now().duration_since(self.anchor).as_nanos() as u64
    }
}

pub(crate) const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Converts a rate in units per second into micro-units per second.
pub(crate) fn rate_to_fixed(rate: f64) -> u64 {
    (rate * crate::PRECISION as f64).round() as u64
}

/// Micro-units produced by `rate_fp` over `elapsed_ns`.
#[inline]
pub(crate) fn units_for(elapsed_ns: u64, rate_fp: u64) -> u64 {
    let units = elapsed_ns as u128 * rate_fp as u128 / NANOS_PER_SEC;
    units.min(u64::MAX as u128) as u64
}

/// Nanoseconds needed for `rate_fp` to produce `units` micro-units, rounded up.
///
/// `None` if the rate is zero and the units will never arrive.
#[inline]
pub(crate) fn nanos_until(units: u64, rate_fp: u64) -> Option<u64> {
    if rate_fp == 0 {
        return None;
    }
    let nanos = (units as u128 * NANOS_PER_SEC).div_ceil(rate_fp as u128);
    Some(nanos.min(u64::MAX as u128) as u64)
}
