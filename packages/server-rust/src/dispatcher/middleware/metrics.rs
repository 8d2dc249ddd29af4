//! Invocation timing.
//!
//! Each call into a service operation runs inside an `operation` span that
//! belongs to the request being processed. When the call returns, the span
//! gets the elapsed time and a coarse outcome: `ok`, `fault` for errors the
//! service itself returned, `timeout`, or `error` for everything else.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use tower::{Layer, Service};
use tracing::{debug, info_span, Instrument, Span};

use super::invoke::Invocation;
use crate::dispatcher::invoker::InvokeOutput;
use crate::error::DispatchError;

fn outcome(result: &Result<InvokeOutput, DispatchError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(DispatchError::Service(_)) => "fault",
        Err(DispatchError::Timeout { .. }) => "timeout",
        Err(_) => "error",
    }
}

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

/// Wraps the invoker so every operation call is timed.
#[derive(Debug, Clone, Copy)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S> Service<Invocation> for MetricsService<S>
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
        // Parented to the request span entered by the pipeline.
        let span = info_span!(
            "operation",
            operation = inv.operation.name(),
            call_id = inv.call_id,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );
        let call = self.inner.call(inv);

        Box::pin(
            async move {
                let started = Instant::now();
                let result = call.await;
                let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                let outcome = outcome(&result);

                let span = Span::current();
                span.record("duration_ms", elapsed);
                span.record("outcome", outcome);
                debug!(duration_ms = elapsed, outcome, "invocation finished");
                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
