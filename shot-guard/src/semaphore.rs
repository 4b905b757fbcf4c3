use std::ops::ControlFlow;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use super::Acquire;
use super::Admission;
use super::AcquireError;
use super::Outcome;
use super::Reason;
use super::Strategy;
use super::WaitQueue;
use crate::wait_queue::within;

/// A counting gate over a pool of interchangeable permits.
///
/// Permits are taken with a CAS loop and returned with [`Semaphore::release`],
/// which also hands them to parked acquirers. There is no upper bound: the
/// pool holds whatever has been released into it.
#[derive(Debug)]
pub struct Semaphore {
    available: AtomicU64,
    waiters: WaitQueue,
}

impl Semaphore {
    pub fn new(initial: u64) -> Self {
        Self {
            available: AtomicU64::new(initial),
            waiters: WaitQueue::new(),
        }
    }

    /// Takes `n` permits if that many are available right now.
    pub fn try_acquire(&self, n: u64) -> bool {
        self.process(n).is_continue()
    }

    /// Waits until `n` permits can be taken.
    pub fn acquire(&self, n: u64) -> Acquire<&Self> {
        Acquire::new(self, n)
    }

    /// Waits at most `timeout` for `n` permits.
    pub async fn acquire_timeout(
        &self,
        n: u64,
        timeout: Duration,
    ) -> Result<Outcome, AcquireError> {
        within(timeout, self.acquire(n)).await
    }

    /// Returns `n` permits to the pool and wakes any waiters they satisfy.
    pub fn release(&self, n: u64) {
        self.restore(n);
        self.waiters.drain(self);
    }

    /// Snapshot of the free permits; may be stale as soon as it is read.
    pub fn available(&self) -> u64 {
        self.available.load(Ordering::Acquire)
    }

    /// Number of parked acquires.
    pub fn waiting(&self) -> usize {
        self.waiters.len()
    }

    /// Fails all parked and future suspending acquires.
    pub fn close(&self) {
        self.waiters.close();
    }
}

impl Strategy for Semaphore {
    fn process(&self, amount: u64) -> ControlFlow<Reason> {
        self.admit(amount)
    }
}

impl Admission for Semaphore {
    fn waiters(&self) -> &WaitQueue {
        &self.waiters
    }

    fn admit(&self, amount: u64) -> ControlFlow<Reason> {
        match self
            .available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(amount)
            }) {
            Ok(_) => ControlFlow::Continue(()),
            Err(_) => ControlFlow::Break(Reason::Exhausted),
        }
    }

    fn restore(&self, amount: u64) {
        let _ = self
            .available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_add(amount))
            });
    }

    fn limit(&self) -> Option<u64> {
        None
    }

    fn retry_after(&self, _amount: u64) -> Option<Duration> {
        None
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use more_asserts::assert_le;
    use proptest::prelude::prop;
    use proptest::prelude::prop_assert;
    use proptest::prelude::prop_assert_eq;
    use proptest::prelude::prop_oneof;
    use proptest::prelude::proptest;
    use proptest::strategy::Strategy as _;

    use super::*;

    #[test]
    fn it_acquires_and_releases() {
        let sem = Semaphore::new(3);
        assert_eq!(sem.available(), 3);

        assert!(sem.try_acquire(2));
        assert_eq!(sem.available(), 1);

        // Failure has no side effects
        assert!(!sem.try_acquire(2));
        assert_eq!(sem.available(), 1);

        sem.release(2);
        assert_eq!(sem.available(), 3);
    }

    #[test]
    fn test_zero_permits_always_succeed() {
        let sem = Semaphore::new(0);
        assert!(sem.try_acquire(0));
        assert!(matches!(sem.process(1), ControlFlow::Break(Reason::Exhausted)));
    }

    #[test]
    fn test_concurrent_acquire_never_overdraws() {
        let permits = 1_000;
        let sem = Arc::new(Semaphore::new(permits));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let sem = Arc::clone(&sem);
                thread::spawn(move || {
                    let mut taken = 0;
                    for _ in 0..500 {
                        if sem.try_acquire(1) {
                            taken += 1;
                        }
                    }
                    taken
                })
            })
            .collect();

        let taken: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(taken, permits, "Exactly the initial permits should be handed out");
        assert_eq!(sem.available(), 0);
    }

    #[test]
    fn test_concurrent_release_sums_correctly() {
        let sem = Arc::new(Semaphore::new(0));

        let handles: Vec<_> = (1..=8u64)
            .map(|n| {
                let sem = Arc::clone(&sem);
                thread::spawn(move || {
                    for _ in 0..1_000 {
                        sem.release(n);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(sem.available(), 1_000 * (1..=8u64).sum::<u64>());
    }

    #[test]
    fn test_mixed_hammer_conserves_permits() {
        let initial = 64;
        let sem = Arc::new(Semaphore::new(initial));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let sem = Arc::clone(&sem);
                thread::spawn(move || {
                    for i in 0..2_000u64 {
                        let n = i % 4 + 1;
                        if sem.try_acquire(n) {
                            assert_le!(sem.available(), initial);
                            sem.release(n);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(sem.available(), initial);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Acquire(u64),
        Release(u64),
    }

    fn op() -> impl proptest::strategy::Strategy<Value = Op> {
        prop_oneof![
            (0..8u64).prop_map(Op::Acquire),
            (0..8u64).prop_map(Op::Release),
        ]
    }

    proptest! {
        /// Interleaved acquires and releases from several threads must leave the
        /// gate where a sequential model of the same successful operations ends.
        #[test]
        fn matches_sequential_model(
            initial in 0..32u64,
            scripts in prop::collection::vec(prop::collection::vec(op(), 0..64), 1..5)
        ) {
            let sem = Arc::new(Semaphore::new(initial));

            let handles: Vec<_> = scripts
                .into_iter()
                .map(|script| {
                    let sem = Arc::clone(&sem);
                    thread::spawn(move || {
                        let mut acquired = 0;
                        let mut released = 0;
                        for op in script {
                            match op {
                                Op::Acquire(n) => {
                                    if sem.try_acquire(n) {
                                        acquired += n;
                                    }
                                }
                                Op::Release(n) => {
                                    sem.release(n);
                                    released += n;
                                }
                            }
                        }
                        (acquired, released)
                    })
                })
                .collect();

            let (acquired, released) = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .fold((0, 0), |(a, r), (da, dr)| (a + da, r + dr));

            prop_assert!(acquired <= initial + released);
            prop_assert_eq!(sem.available(), initial + released - acquired);
        }
    }
}
