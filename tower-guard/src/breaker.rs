use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;

use pin_project_lite::pin_project;
use tower::BoxError;
use tower::Service;

use shot_guard::CircuitBreaker;

use crate::error::GuardError;

/// Guards an inner service with a shared [`CircuitBreaker`].
///
/// Every call asks the breaker first. Rejected calls fail with
/// [`GuardError::CircuitOpen`] without reaching the inner service; admitted
/// calls report their outcome once the response future completes. A response
/// future dropped before completion reports nothing.
#[derive(Debug, Clone)]
pub struct CircuitBreakerService<S> {
    inner: S,
    breaker: Arc<CircuitBreaker>,
}

impl<S> CircuitBreakerService<S> {
    pub fn new(inner: S, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

pin_project! {
    /// Response future of [`CircuitBreakerService`].
    #[project = BreakerFutureProj]
    pub enum BreakerFuture<F> {
        Called {
            #[pin]
            future: F,
            breaker: Arc<CircuitBreaker>,
        },
        Rejected {
            error: GuardError,
        },
    }
}

impl<F, T, E> Future for BreakerFuture<F>
where
    F: Future<Output = Result<T, E>>,
    E: From<BoxError>,
{
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project() {
            BreakerFutureProj::Called { future, breaker } => {
                let res = std::task::ready!(future.poll(cx));
                match &res {
                    Ok(_) => breaker.on_success(),
                    Err(_) => breaker.on_failure(),
                }
                Poll::Ready(res)
            }
            BreakerFutureProj::Rejected { error } => {
                Poll::Ready(Err(E::from(Box::new(error.clone()))))
            }
        }
    }
}

impl<S, Req> Service<Req> for CircuitBreakerService<S>
where
    S: Service<Req, Error = BoxError>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BreakerFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        if !self.breaker.allow_request() {
            tracing::trace!(state = %self.breaker.state(), "request rejected by circuit breaker");
            return BreakerFuture::Rejected {
                error: GuardError::CircuitOpen,
            };
        }
        BreakerFuture::Called {
            future: self.inner.call(req),
            breaker: Arc::clone(&self.breaker),
        }
    }
}
