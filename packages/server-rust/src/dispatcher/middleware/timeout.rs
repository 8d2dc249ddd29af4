//! Timeout middleware for operation calls.
//!
//! Rejects calls that exceed their `Invocation::timeout` with `DispatchError::Timeout`.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tower::{Layer, Service};

use super::invoke::Invocation;
use crate::dispatcher::invoker::InvokeOutput;
use crate::error::DispatchError;

// ---------------------------------------------------------------------------
// TimeoutLayer
// ---------------------------------------------------------------------------

/// Tower layer that wraps services with per-call timeout enforcement.
///
/// The timeout is read from each invocation, so operations without a
/// configured timeout pass through untouched.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutLayer;

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService { inner }
    }
}

// ---------------------------------------------------------------------------
// TimeoutService
// ---------------------------------------------------------------------------

/// Service wrapper that enforces per-call timeouts.
#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
}

impl<S> Service<Invocation> for TimeoutService<S>
where
    S: Service<Invocation, Response = InvokeOutput, Error = DispatchError> + Send,
    S::Future: Send + 'static,
{
    type Response = InvokeOutput;
    type Error = DispatchError;
    type Future = Pin<Box<dyn Future<Output = Result<InvokeOutput, DispatchError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, inv: Invocation) -> Self::Future {
        let timeout = inv.timeout;
        let fut = self.inner.call(inv);
        Box::pin(async move {
            let Some(duration) = timeout else {
                return fut.await;
            };
            match tokio::time::timeout(duration, fut).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    #[allow(clippy::cast_possible_truncation)]
                    let timeout_ms = duration.as_millis() as u64;
                    Err(DispatchError::Timeout { timeout_ms })
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use hostwire_core::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::dispatcher::contract::ServiceMethod;
    use crate::dispatcher::middleware::invoke::tests::{invocation, Svc};
    use crate::dispatcher::middleware::invoke::InvokeService;
    use crate::error::ServiceError;

    fn slow(delay_ms: u64) -> ServiceMethod {
        ServiceMethod::asynchronous(move |_: Arc<Svc>, args: Vec<Value>| async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            Ok::<_, ServiceError>((Value::Null, args))
        })
    }

    #[tokio::test]
    async fn completes_within_timeout() {
        let svc = TimeoutLayer.layer(InvokeService);
        let inv = invocation(slow(10), Some(Duration::from_millis(1000)));
        assert!(svc.oneshot(inv).await.is_ok());
    }

    #[tokio::test]
    async fn exceeds_timeout_returns_error() {
        let svc = TimeoutLayer.layer(InvokeService);
        let inv = invocation(slow(200), Some(Duration::from_millis(50)));
        let err = svc.oneshot(inv).await.unwrap_err();
        assert!(matches!(err, DispatchError::Timeout { timeout_ms: 50 }));
    }

    #[tokio::test]
    async fn no_timeout_passes_through() {
        let svc = TimeoutLayer.layer(InvokeService);
        let inv = invocation(slow(20), None);
        assert!(svc.oneshot(inv).await.is_ok());
    }
}
