use std::fmt;
use std::future::Future;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use pin_project_lite::pin_project;
use tokio::time::Instant;
use tokio::time::Sleep;
use tokio::time::sleep;
use tokio::time::sleep_until;
use tower::BoxError;
use tower::Service;

use shot_guard::Acquire;
use shot_guard::Admission;

use crate::error::GuardError;

/// Capacity taken from a limiter on behalf of one request.
///
/// Dropping it hands the capacity back unless it was spent.
pub struct Permit<L>
where
    L: Admission + ?Sized,
{
    limiter: Option<Arc<L>>,
    amount: u64,
}

impl<L> Permit<L>
where
    L: Admission + ?Sized,
{
    fn new(limiter: Arc<L>, amount: u64) -> Self {
        Self {
            limiter: Some(limiter),
            amount,
        }
    }

    /// Consumes the permit for good.
    fn spend(mut self) {
        self.limiter = None;
    }
}

impl<L> fmt::Debug for Permit<L>
where
    L: Admission + ?Sized,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit")
            .field("amount", &self.amount)
            .field("held", &self.limiter.is_some())
            .finish()
    }
}

impl<L> Drop for Permit<L>
where
    L: Admission + ?Sized,
{
    fn drop(&mut self) {
        if let Some(limiter) = self.limiter.take() {
            limiter.restore(self.amount);
            limiter.waiters().drain(&*limiter);
            tracing::trace!(amount = self.amount, "permit returned");
        }
    }
}

/// Admits requests through a shared [`Admission`] limiter.
///
/// Readiness is only reported once the limiter has admitted `cost` units,
/// so callers see back-pressure through `poll_ready`.
pub struct RateLimitService<L, S>
where
    L: Admission + ?Sized,
{
    inner: S,
    limiter: Arc<L>,
    acquire: Option<Acquire<Arc<L>>>,
    permit: Option<Permit<L>>,
    deadline: Option<Pin<Box<Sleep>>>,
    /// Timeout left over from the wait, for the inner call to use
    budget: Option<Duration>,
    fail_fast: bool,
    timeout: Option<Duration>,
    cost: u64,
    release_on_completion: bool,
}

impl<L, S> fmt::Debug for RateLimitService<L, S>
where
    L: Admission + ?Sized,
    S: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitService")
            .field("inner", &self.inner)
            .field("limiter", &self.limiter)
            .field("waiting", &self.acquire.is_some())
            .field("ready", &self.permit.is_some())
            .field("fail_fast", &self.fail_fast)
            .field("timeout", &self.timeout)
            .field("cost", &self.cost)
            .finish()
    }
}

// Manual Clone: a clone starts with no wait or permit of its own
impl<L, S> Clone for RateLimitService<L, S>
where
    L: Admission + ?Sized,
    S: Clone,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: Arc::clone(&self.limiter),
            acquire: None,
            permit: None,
            deadline: None,
            budget: None,
            fail_fast: self.fail_fast,
            timeout: self.timeout,
            cost: self.cost,
            release_on_completion: self.release_on_completion,
        }
    }
}

pin_project! {
    /// Response future of [`RateLimitService`].
    ///
    /// Enforces what is left of the timeout and holds the permit while the
    /// inner future runs, if it is to be handed back on completion.
    pub struct ResponseFuture<F, P> {
        #[pin]
        inner: F,
        #[pin]
        deadline: Option<Sleep>,
        permit: Option<P>,
    }
}

impl<F, P, T, E> Future for ResponseFuture<F, P>
where
    F: Future<Output = Result<T, E>>,
    E: From<BoxError>,
{
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if let Poll::Ready(res) = this.inner.poll(cx) {
            this.permit.take();
            return Poll::Ready(res);
        }
        if let Some(deadline) = this.deadline.as_pin_mut()
            && deadline.poll(cx).is_ready()
        {
            this.permit.take();
            return Poll::Ready(Err(E::from(Box::new(GuardError::Timeout))));
        }
        Poll::Pending
    }
}

impl<L, S> RateLimitService<L, S>
where
    L: Admission + ?Sized,
{
    pub fn new(inner: S, limiter: Arc<L>) -> Self {
        Self {
            inner,
            limiter,
            acquire: None,
            permit: None,
            deadline: None,
            budget: None,
            fail_fast: false,
            timeout: None,
            cost: 1,
            release_on_completion: false,
        }
    }

    /// Reject with [`GuardError::RateLimited`] instead of waiting for capacity.
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Bound the wait for admission plus the inner call by `timeout`.
    ///
    /// Time spent between readiness and `call` is not counted.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Units each request takes from the limiter. Defaults to 1.
    pub fn with_cost(mut self, cost: u64) -> Self {
        self.cost = cost;
        self
    }

    /// Return each request's units to the limiter once its response completes,
    /// turning the limiter into an in-flight bound.
    pub fn with_release_on_completion(mut self, release: bool) -> Self {
        self.release_on_completion = release;
        self
    }

    fn reset_wait(&mut self) {
        self.acquire = None;
        self.deadline = None;
    }

    fn poll_permit(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), GuardError>> {
        if self.fail_fast {
            return match self.limiter.process(self.cost) {
                ControlFlow::Continue(()) => Poll::Ready(Ok(())),
                ControlFlow::Break(reason) => Poll::Ready(Err(reason.into())),
            };
        }

        if self.deadline.is_none()
            && let Some(timeout) = self.timeout
        {
            self.deadline = Some(Box::pin(sleep_until(Instant::now() + timeout)));
        }

        let acquire = self
            .acquire
            .get_or_insert_with(|| Acquire::new(Arc::clone(&self.limiter), self.cost));
        if let Poll::Ready(result) = Pin::new(acquire).poll(cx) {
            self.acquire = None;
            return Poll::Ready(result.map_err(GuardError::from));
        }

        if let Some(deadline) = self.deadline.as_mut()
            && deadline.as_mut().poll(cx).is_ready()
        {
            // Dropping the acquire withdraws it, or returns capacity that
            // arrived concurrently with the deadline.
            self.reset_wait();
            tracing::trace!(cost = self.cost, "admission timed out");
            return Poll::Ready(Err(GuardError::Timeout));
        }
        Poll::Pending
    }
}

impl<L, S, Req> Service<Req> for RateLimitService<L, S>
where
    L: Admission + ?Sized + 'static,
    S: Service<Req, Error = BoxError>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future, Permit<L>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Check inner service readiness FIRST to avoid over-consuming capacity
        match self.inner.poll_ready(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {}
        }

        if self.permit.is_some() {
            return Poll::Ready(Ok(()));
        }

        match self.poll_permit(cx) {
            Poll::Ready(Ok(())) => {
                self.permit = Some(Permit::new(Arc::clone(&self.limiter), self.cost));
                // The clock stops until `call`
                let now = Instant::now();
                self.budget = self
                    .deadline
                    .take()
                    .map(|deadline| deadline.deadline().saturating_duration_since(now));
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(err)) => {
                self.reset_wait();
                Poll::Ready(Err(Box::new(err)))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let Some(permit) = self.permit.take() else {
            panic!("service not ready; poll_ready must be called first");
        };

        let permit = if self.release_on_completion {
            Some(permit)
        } else {
            permit.spend();
            None
        };

        // Whatever the wait left of the timeout now bounds the inner call
        let deadline = self.budget.take().or(self.timeout).map(sleep);

        ResponseFuture {
            inner: self.inner.call(req),
            deadline,
            permit,
        }
    }
}
