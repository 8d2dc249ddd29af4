//! Leaf service of the invocation stack.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::FutureExt;
use hostwire_core::Value;
use tower::Service;

use crate::dispatcher::contract::ServiceObject;
use crate::dispatcher::invoker::InvokeOutput;
use crate::dispatcher::operation::DispatchOperation;
use crate::error::DispatchError;

/// One call of an operation on a service instance.
pub struct Invocation {
    pub call_id: u64,
    pub operation: Arc<DispatchOperation>,
    pub instance: ServiceObject,
    pub inputs: Vec<Value>,
    /// Per-call timeout enforced by `TimeoutLayer`.
    pub timeout: Option<Duration>,
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("call_id", &self.call_id)
            .field("operation", &self.operation.name())
            .field("inputs", &self.inputs)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Calls the operation's invoker, synchronously or via begin/end.
///
/// Panics inside the service method surface as `DispatchError::Panicked`.
#[derive(Debug, Clone, Copy, Default)]
pub struct InvokeService;

impl Service<Invocation> for InvokeService {
    type Response = InvokeOutput;
    type Error = DispatchError;
    type Future = Pin<Box<dyn Future<Output = Result<InvokeOutput, DispatchError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, inv: Invocation) -> Self::Future {
        let call = async move {
            let invoker = Arc::clone(inv.operation.invoker());
            if invoker.is_synchronous() {
                invoker.invoke(&inv.instance, inv.inputs)
            } else {
                let pending = invoker.invoke_begin(inv.instance, inv.inputs)?;
                invoker.invoke_end(pending).await
            }
        };
        Box::pin(async move {
            match AssertUnwindSafe(call).catch_unwind().await {
                Ok(result) => result.map_err(DispatchError::from),
                Err(payload) => Err(DispatchError::from_panic(payload.as_ref())),
            }
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use tower::ServiceExt;

    use super::*;
    use crate::dispatcher::contract::{OperationDescription, ServiceMethod};
    use crate::error::ServiceError;

    pub(crate) struct Svc;

    pub(crate) fn invocation(method: ServiceMethod, timeout: Option<Duration>) -> Invocation {
        let operation = DispatchOperation::from_description(&OperationDescription::new(
            "Op",
            "urn:Op",
            method,
        ));
        Invocation {
            call_id: 7,
            operation: Arc::new(operation),
            instance: Arc::new(Svc),
            inputs: Vec::new(),
            timeout,
        }
    }

    #[tokio::test]
    async fn sync_call_returns_result() {
        let inv = invocation(ServiceMethod::sync(|_: &Svc, _| Ok(Value::Int(1))), None);
        let out = InvokeService.oneshot(inv).await.unwrap();
        assert_eq!(out.result, Value::Int(1));
    }

    #[tokio::test]
    async fn async_call_returns_result() {
        let inv = invocation(
            ServiceMethod::asynchronous(|_: Arc<Svc>, args: Vec<Value>| async move {
                Ok::<_, ServiceError>((Value::Int(2), args))
            }),
            None,
        );
        let out = InvokeService.oneshot(inv).await.unwrap();
        assert_eq!(out.result, Value::Int(2));
    }

    #[tokio::test]
    async fn panics_become_errors() {
        let inv = invocation(
            ServiceMethod::sync(|_: &Svc, _| -> Result<Value, ServiceError> { panic!("kaboom") }),
            None,
        );
        let err = InvokeService.oneshot(inv).await.unwrap_err();
        assert!(matches!(err, DispatchError::Panicked { message } if message == "kaboom"));
    }
}
