use std::fmt;
use std::future::Future;
use std::ops::ControlFlow;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::atomic::fence;
use std::task::Context;
use std::task::Poll;
use std::task::Waker;
use std::task::ready;
use std::thread;
use std::time::Duration;

use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;
use crossbeam_channel::unbounded;
use futures::task::AtomicWaker;
use tokio::runtime::Handle;
use tokio::time::Sleep;
use tokio::time::sleep;

use crate::AcquireError;
use crate::Reason;
use crate::Strategy;

const WAITING: u8 = 0;
const ADMITTED: u8 = 1;
const CANCELLED: u8 = 2;
const CLOSED: u8 = 3;
const REJECTED: u8 = 4;

/// Floor for retry timers, so a zero hint cannot spin the executor.
const MIN_RETRY: Duration = Duration::from_millis(1);

/// Result of a suspending acquire bounded by a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Admitted,
    TimedOut,
}

/// A limiter whose callers can park on a [`WaitQueue`].
///
/// `admit` and `restore` operate on the raw state only and must never touch
/// the wait queue themselves: the queue calls back into them while draining.
pub trait Admission: Strategy {
    /// The queue parked callers wait on.
    fn waiters(&self) -> &WaitQueue;

    /// Takes `amount` units if they are available right now.
    fn admit(&self, amount: u64) -> ControlFlow<Reason>;

    /// Gives back `amount` units taken by a successful [`Admission::admit`].
    fn restore(&self, amount: u64);

    /// The largest request that can ever be admitted, if bounded.
    fn limit(&self) -> Option<u64>;

    /// Estimated time until `amount` units could be admitted, if capacity
    /// returns with the passage of time at all.
    fn retry_after(&self, amount: u64) -> Option<Duration>;
}

#[derive(Debug)]
struct Slot {
    state: AtomicU8,
    waker: AtomicWaker,
}

impl Slot {
    fn new(waker: &Waker) -> Self {
        let slot = Self {
            state: AtomicU8::new(WAITING),
            waker: AtomicWaker::new(),
        };
        slot.waker.register(waker);
        slot
    }

    fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    /// Moves the slot out of `WAITING`. Only one caller can ever succeed.
    fn settle(&self, to: u8) -> bool {
        self.state
            .compare_exchange(WAITING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn resolve(&self, to: u8) -> bool {
        if self.settle(to) {
            self.waker.wake();
            true
        } else {
            false
        }
    }
}

struct Waiter {
    amount: u64,
    slot: Arc<Slot>,
}

/// Timer a parked acquire sets for its limiter's retry hint.
enum Retry {
    /// Inside a Tokio runtime
    Timer(Pin<Box<Sleep>>),
    /// Outside one: a detached thread sleeps and then wakes the slot
    Thread(Arc<AtomicBool>),
    /// No thread could be spawned: yield to the executor once, then retry
    Yield(bool),
}

impl Retry {
    fn arm(after: Duration, slot: &Arc<Slot>) -> Self {
        if Handle::try_current().is_ok() {
            return Self::Timer(Box::pin(sleep(after)));
        }

        let fired = Arc::new(AtomicBool::new(false));
        let spawned = {
            let fired = Arc::clone(&fired);
            let slot = Arc::clone(slot);
            thread::Builder::new()
                .name("shot-guard-retry".into())
                .spawn(move || {
                    thread::sleep(after);
                    fired.store(true, Ordering::Release);
                    slot.waker.wake();
                })
        };
        match spawned {
            Ok(_) => Self::Thread(fired),
            Err(err) => {
                tracing::warn!(%err, "failed to spawn retry thread");
                Self::Yield(false)
            }
        }
    }

    fn poll(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        match self {
            Self::Timer(timer) => timer.as_mut().poll(cx),
            Self::Thread(fired) if fired.load(Ordering::Acquire) => Poll::Ready(()),
            Self::Thread(_) => Poll::Pending,
            Self::Yield(true) => Poll::Ready(()),
            Self::Yield(yielded) => {
                *yielded = true;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }
}

/// A multi-producer multi-consumer queue of parked acquires.
///
/// Records are drained in best-effort arrival order: a waiter that still
/// cannot be satisfied goes back to the tail and draining stops.
pub struct WaitQueue {
    tx: Sender<Waiter>,
    rx: Receiver<Waiter>,
    closed: AtomicBool,
    /// Bumped by every drain, so a drainer that requeues can tell whether
    /// another drain ran while its waiter was out of the queue
    epoch: AtomicU64,
}

impl fmt::Debug for WaitQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitQueue")
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            closed: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
        }
    }

    /// Number of queued records.
    ///
    /// Abandoned records are discarded lazily, so this may over-count.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn push(&self, waiter: Waiter) {
        // The queue owns its receiver, so the channel can never be disconnected.
        let _ = self.tx.send(waiter);
    }

    /// Hands replenished capacity to parked callers.
    pub fn drain<A>(&self, limiter: &A)
    where
        A: Admission + ?Sized,
    {
        let mut epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        fence(Ordering::SeqCst);

        while let Ok(waiter) = self.rx.try_recv() {
            if waiter.slot.state() != WAITING {
                continue;
            }
            if self.is_closed() {
                waiter.slot.resolve(CLOSED);
                continue;
            }
            if let Some(limit) = limiter.limit()
                && waiter.amount > limit
            {
                tracing::trace!(amount = waiter.amount, limit, "waiter rejected as oversized");
                waiter.slot.resolve(REJECTED);
                continue;
            }

            match limiter.admit(waiter.amount) {
                ControlFlow::Continue(()) => {
                    if waiter.slot.resolve(ADMITTED) {
                        tracing::trace!(amount = waiter.amount, "waiter resumed");
                    } else {
                        // Cancelled between the state check and the admit
                        limiter.restore(waiter.amount);
                    }
                }
                ControlFlow::Break(_) => {
                    tracing::trace!(amount = waiter.amount, "waiter requeued");
                    self.push(waiter);
                    if self.is_closed() {
                        self.reject_all();
                        break;
                    }

                    // A concurrent drain may have found the queue empty while
                    // this waiter was out of it; go round again if so.
                    fence(Ordering::SeqCst);
                    let current = self.epoch.load(Ordering::SeqCst);
                    if current == epoch {
                        break;
                    }
                    epoch = current;
                }
            }
        }
    }

    /// Resolves every parked and future acquire with [`AcquireError::Closed`].
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!(waiting = self.len(), "wait queue closed");
        }
        self.reject_all();
    }

    fn reject_all(&self) {
        while let Ok(waiter) = self.rx.try_recv() {
            waiter.slot.resolve(CLOSED);
        }
    }
}

/// Future returned by the suspending `acquire` methods.
///
/// Works on any executor. Inside a Tokio runtime, waits for time-driven
/// capacity use Tokio's timer; elsewhere a short-lived thread sleeps through
/// each retry hint instead.
///
/// Dropping it before it completes withdraws the request. If the request was
/// admitted concurrently with the drop, the capacity is restored and offered
/// to the remaining waiters, so a caller never both gives up and consumes.
pub struct Acquire<H>
where
    H: Deref,
    H::Target: Admission,
{
    limiter: H,
    amount: u64,
    slot: Option<Arc<Slot>>,
    retry: Option<Retry>,
    finished: bool,
}

impl<H> fmt::Debug for Acquire<H>
where
    H: Deref,
    H::Target: Admission,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acquire")
            .field("amount", &self.amount)
            .field("queued", &self.slot.is_some())
            .field("finished", &self.finished)
            .finish()
    }
}

impl<H> Acquire<H>
where
    H: Deref,
    H::Target: Admission,
{
    pub fn new(limiter: H, amount: u64) -> Self {
        Self {
            limiter,
            amount,
            slot: None,
            retry: None,
            finished: false,
        }
    }

    /// First poll: try immediately, otherwise enqueue and try once more.
    fn start(&mut self, waker: &Waker) -> Result<Arc<Slot>, Result<(), AcquireError>> {
        let limiter = &*self.limiter;
        let queue = limiter.waiters();

        if queue.is_closed() {
            return Err(Err(AcquireError::Closed));
        }
        if let Some(limit) = limiter.limit()
            && self.amount > limit
        {
            return Err(Err(AcquireError::Oversized {
                requested: self.amount,
                limit,
            }));
        }
        if limiter.admit(self.amount).is_continue() {
            return Err(Ok(()));
        }

        let slot = Arc::new(Slot::new(waker));
        queue.push(Waiter {
            amount: self.amount,
            slot: Arc::clone(&slot),
        });
        tracing::trace!(amount = self.amount, "waiter parked");

        // Capacity may have appeared between the first attempt and the push.
        queue.drain(limiter);
        if queue.is_closed() {
            queue.reject_all();
        }
        Ok(slot)
    }
}

impl<H> Future for Acquire<H>
where
    H: Deref + Unpin,
    H::Target: Admission,
{
    type Output = Result<(), AcquireError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        let slot = match &this.slot {
            Some(slot) => Arc::clone(slot),
            None => match this.start(cx.waker()) {
                Ok(slot) => {
                    this.slot = Some(Arc::clone(&slot));
                    slot
                }
                Err(result) => {
                    this.finished = true;
                    return Poll::Ready(result);
                }
            },
        };

        loop {
            slot.waker.register(cx.waker());
            match slot.state() {
                ADMITTED => {
                    this.finished = true;
                    return Poll::Ready(Ok(()));
                }
                CLOSED => {
                    this.finished = true;
                    return Poll::Ready(Err(AcquireError::Closed));
                }
                REJECTED => {
                    this.finished = true;
                    let limit = this.limiter.limit().unwrap_or_default();
                    return Poll::Ready(Err(AcquireError::Oversized {
                        requested: this.amount,
                        limit,
                    }));
                }
                _ => {}
            }

            if this.retry.is_none() {
                let Some(after) = this.limiter.retry_after(this.amount) else {
                    return Poll::Pending;
                };
                this.retry = Some(Retry::arm(after.max(MIN_RETRY), &slot));
            }
            if let Some(retry) = this.retry.as_mut() {
                ready!(retry.poll(cx));
            }
            this.retry = None;
            this.limiter.waiters().drain(&*this.limiter);
        }
    }
}

impl<H> Drop for Acquire<H>
where
    H: Deref,
    H::Target: Admission,
{
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        let limiter = &*self.limiter;
        if slot.settle(CANCELLED) {
            // Discard stale records at the head of the queue
            limiter.waiters().drain(limiter);
        } else if slot.state() == ADMITTED && !self.finished {
            tracing::trace!(amount = self.amount, "admitted waiter abandoned");
            limiter.restore(self.amount);
            limiter.waiters().drain(limiter);
        }
    }
}

/// Bounds a suspending acquire with `timeout`.
pub(crate) async fn within<F>(timeout: Duration, acquire: F) -> Result<Outcome, AcquireError>
where
    F: Future<Output = Result<(), AcquireError>>,
{
    match tokio::time::timeout(timeout, acquire).await {
        Ok(result) => result.map(|()| Outcome::Admitted),
        Err(_) => Ok(Outcome::TimedOut),
    }
}
