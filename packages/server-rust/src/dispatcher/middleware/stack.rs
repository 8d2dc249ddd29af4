//! Stack composition: combines the middleware layers around `InvokeService`.

use tower::ServiceBuilder;

use super::invoke::InvokeService;
use super::metrics::{MetricsLayer, MetricsService};
use super::timeout::{TimeoutLayer, TimeoutService};

/// Concrete invocation stack. Cheap to clone; one clone is consumed per call.
pub type InvocationStack = TimeoutService<MetricsService<InvokeService>>;

/// Build the invocation stack.
///
/// Layer order (outermost to innermost):
/// 1. `TimeoutLayer` -- enforce the per-call operation timeout
/// 2. `MetricsLayer` -- record timing and outcome (closest to the actual call)
#[must_use]
pub fn build_invocation_stack() -> InvocationStack {
    ServiceBuilder::new()
        .layer(TimeoutLayer)
        .layer(MetricsLayer)
        .service(InvokeService)
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
    use crate::error::{DispatchError, ServiceError};

    #[tokio::test]
    async fn stack_routes_through_all_layers() {
        let stack = build_invocation_stack();
        let inv = invocation(ServiceMethod::sync(|_: &Svc, _| Ok(Value::Int(1))), None);
        let out = stack.clone().oneshot(inv).await.unwrap();
        assert_eq!(out.result, Value::Int(1));

        let slow = invocation(
            ServiceMethod::asynchronous(|_: Arc<Svc>, args: Vec<Value>| async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, ServiceError>((Value::Null, args))
            }),
            Some(Duration::from_millis(20)),
        );
        let err = stack.oneshot(slow).await.unwrap_err();
        assert!(matches!(err, DispatchError::Timeout { timeout_ms: 20 }));
    }
}
