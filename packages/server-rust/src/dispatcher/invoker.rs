//! Operation invokers: call the service method with positional parameters.
//!
//! Inputs and outputs are disjoint positional subsets of the method's full
//! argument list. The split lives in a `ParameterMap` computed once when the
//! operation is built; per call the invoker only spreads and gathers.

use std::fmt;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use hostwire_core::{ParameterMap, Value};

use super::contract::{ServiceMethod, ServiceObject};
use crate::error::ServiceError;

/// Return value and output parameters of one call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InvokeOutput {
    pub result: Value,
    pub outputs: Vec<Value>,
}

/// Token for an asynchronous call started by [`OperationInvoker::invoke_begin`].
pub struct PendingInvocation {
    call: BoxFuture<'static, Result<(Value, Vec<Value>), ServiceError>>,
}

impl fmt::Debug for PendingInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PendingInvocation")
    }
}

/// Invokes an operation on a service instance.
#[async_trait]
pub trait OperationInvoker: Send + Sync {
    /// Whether [`invoke`](Self::invoke) (as opposed to begin/end) is the call path.
    fn is_synchronous(&self) -> bool;

    /// Fresh input array sized to the operation's input parameters.
    fn allocate_inputs(&self) -> Vec<Value>;

    /// Run a synchronous operation to completion.
    ///
    /// # Errors
    ///
    /// Returns the service's error, or `ServiceError::Other` if the operation
    /// is asynchronous.
    fn invoke(&self, instance: &ServiceObject, inputs: Vec<Value>)
        -> Result<InvokeOutput, ServiceError>;

    /// Start an asynchronous operation.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::Other` if the operation is synchronous.
    fn invoke_begin(
        &self,
        instance: ServiceObject,
        inputs: Vec<Value>,
    ) -> Result<PendingInvocation, ServiceError>;

    /// Complete an asynchronous operation started with `invoke_begin`.
    ///
    /// # Errors
    ///
    /// Returns the service's error.
    async fn invoke_end(&self, pending: PendingInvocation) -> Result<InvokeOutput, ServiceError>;
}

// ---------------------------------------------------------------------------
// MethodInvoker
// ---------------------------------------------------------------------------

/// Invoker over a [`ServiceMethod`] and its precomputed parameter map.
#[derive(Debug)]
pub struct MethodInvoker {
    map: ParameterMap,
    method: ServiceMethod,
}

impl MethodInvoker {
    #[must_use]
    pub fn new(map: ParameterMap, method: ServiceMethod) -> Self {
        Self { map, method }
    }

    #[must_use]
    pub fn parameter_map(&self) -> &ParameterMap {
        &self.map
    }
}

#[async_trait]
impl OperationInvoker for MethodInvoker {
    fn is_synchronous(&self) -> bool {
        self.method.is_synchronous()
    }

    fn allocate_inputs(&self) -> Vec<Value> {
        self.map.allocate_inputs()
    }

    fn invoke(
        &self,
        instance: &ServiceObject,
        inputs: Vec<Value>,
    ) -> Result<InvokeOutput, ServiceError> {
        let ServiceMethod::Sync(method) = &self.method else {
            return Err(anyhow::anyhow!("asynchronous operation invoked synchronously").into());
        };
        let mut args = self.map.assemble(inputs);
        let result = method(instance, &mut args)?;
        Ok(InvokeOutput {
            result,
            outputs: self.map.extract_outputs(args),
        })
    }

    fn invoke_begin(
        &self,
        instance: ServiceObject,
        inputs: Vec<Value>,
    ) -> Result<PendingInvocation, ServiceError> {
        let ServiceMethod::Async(method) = &self.method else {
            return Err(anyhow::anyhow!("synchronous operation invoked asynchronously").into());
        };
        Ok(PendingInvocation {
            call: method(instance, self.map.assemble(inputs)),
        })
    }

    async fn invoke_end(&self, pending: PendingInvocation) -> Result<InvokeOutput, ServiceError> {
        let (result, args) = pending.call.await?;
        Ok(InvokeOutput {
            result,
            outputs: self.map.extract_outputs(args),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use hostwire_core::ParameterDescription;

    use super::*;
    use crate::error::FaultException;

    struct Calc;

    fn divide_map() -> ParameterMap {
        ParameterMap::new(&[
            ParameterDescription::input("a"),
            ParameterDescription::output("remainder"),
            ParameterDescription::input("b"),
        ])
    }

    fn sync_divide() -> MethodInvoker {
        MethodInvoker::new(
            divide_map(),
            ServiceMethod::sync(|_: &Calc, args: &mut [Value]| {
                let (a, b) = (args[0].as_int().unwrap_or(0), args[2].as_int().unwrap_or(0));
                if b == 0 {
                    return Err(FaultException::new("DivideByZero", a, "divide by zero").into());
                }
                args[1] = Value::Int(a % b);
                Ok(Value::Int(a / b))
            }),
        )
    }

    #[test]
    fn sync_invoke_splits_inputs_and_outputs() {
        let invoker = sync_divide();
        assert!(invoker.is_synchronous());
        assert_eq!(invoker.allocate_inputs(), vec![Value::Null, Value::Null]);

        let instance: ServiceObject = Arc::new(Calc);
        let out = invoker
            .invoke(&instance, vec![Value::Int(7), Value::Int(2)])
            .unwrap();
        assert_eq!(out.result, Value::Int(3));
        assert_eq!(out.outputs, vec![Value::Int(1)]);
    }

    #[test]
    fn sync_invoke_propagates_service_error() {
        let instance: ServiceObject = Arc::new(Calc);
        let err = sync_divide()
            .invoke(&instance, vec![Value::Int(7), Value::Int(0)])
            .unwrap_err();
        assert!(matches!(err, ServiceError::Fault(f) if f.detail_type == "DivideByZero"));
    }

    #[test]
    fn begin_on_sync_operation_is_rejected() {
        let instance: ServiceObject = Arc::new(Calc);
        assert!(sync_divide().invoke_begin(instance, Vec::new()).is_err());
    }

    #[tokio::test]
    async fn async_begin_end() {
        let invoker = MethodInvoker::new(
            divide_map(),
            ServiceMethod::asynchronous(|_: Arc<Calc>, mut args: Vec<Value>| async move {
                tokio::task::yield_now().await;
                let sum = args[0].as_int().unwrap_or(0) + args[2].as_int().unwrap_or(0);
                args[1] = Value::Int(sum);
                Ok::<_, ServiceError>((Value::Bool(true), args))
            }),
        );
        assert!(!invoker.is_synchronous());

        let instance: ServiceObject = Arc::new(Calc);
        assert!(invoker.invoke(&instance, Vec::new()).is_err());

        let pending = invoker
            .invoke_begin(instance, vec![Value::Int(2), Value::Int(3)])
            .unwrap();
        let out = invoker.invoke_end(pending).await.unwrap();
        assert_eq!(out.result, Value::Bool(true));
        assert_eq!(out.outputs, vec![Value::Int(5)]);
    }
}
