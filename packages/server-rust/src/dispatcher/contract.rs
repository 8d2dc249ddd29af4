//! Contract metadata: the configuration-time description of a service.
//!
//! A [`ContractDescription`] lists operations; each operation names its action,
//! its positional parameters, the typed faults it may raise and the method
//! that implements it. `EndpointDispatcher::initialize_from_contract` turns
//! this metadata into runtime `DispatchOperation`s.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::{self, BoxFuture, FutureExt};
use hostwire_core::{DispatchFormatter, ParameterDescription, Value};

use super::operation::ReleaseInstanceMode;
use crate::error::ServiceError;

/// Type-erased service instance.
pub type ServiceObject = Arc<dyn Any + Send + Sync>;

/// Synchronous method body: reads inputs from and writes outputs into the full
/// positional argument list, returns the result value.
pub type SyncMethod =
    Arc<dyn Fn(&ServiceObject, &mut [Value]) -> Result<Value, ServiceError> + Send + Sync>;

/// Asynchronous method body: takes the full argument list and hands it back
/// (with outputs written) alongside the result value.
pub type AsyncMethod = Arc<
    dyn Fn(ServiceObject, Vec<Value>) -> BoxFuture<'static, Result<(Value, Vec<Value>), ServiceError>>
        + Send
        + Sync,
>;

// ---------------------------------------------------------------------------
// ServiceMethod
// ---------------------------------------------------------------------------

/// The code behind an operation.
#[derive(Clone)]
pub enum ServiceMethod {
    Sync(SyncMethod),
    Async(AsyncMethod),
}

impl ServiceMethod {
    /// Wrap a synchronous method on service type `S`.
    pub fn sync<S, F>(method: F) -> Self
    where
        S: Any + Send + Sync,
        F: Fn(&S, &mut [Value]) -> Result<Value, ServiceError> + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(move |instance: &ServiceObject, args: &mut [Value]| {
            let service = instance
                .downcast_ref::<S>()
                .ok_or_else(wrong_instance::<S>)?;
            method(service, args)
        }))
    }

    /// Wrap an asynchronous method on service type `S`.
    pub fn asynchronous<S, F, Fut>(method: F) -> Self
    where
        S: Any + Send + Sync,
        F: Fn(Arc<S>, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(Value, Vec<Value>), ServiceError>> + Send + 'static,
    {
        Self::Async(Arc::new(move |instance: ServiceObject, args: Vec<Value>| {
            match instance.downcast::<S>() {
                Ok(service) => method(service, args).boxed(),
                Err(_) => future::ready(Err(wrong_instance::<S>())).boxed(),
            }
        }))
    }

    #[must_use]
    pub fn is_synchronous(&self) -> bool {
        matches!(self, Self::Sync(_))
    }
}

impl fmt::Debug for ServiceMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("ServiceMethod::Sync"),
            Self::Async(_) => f.write_str("ServiceMethod::Async"),
        }
    }
}

fn wrong_instance<S>() -> ServiceError {
    ServiceError::Other(anyhow::anyhow!(
        "service instance is not a {}",
        std::any::type_name::<S>()
    ))
}

// ---------------------------------------------------------------------------
// Descriptions
// ---------------------------------------------------------------------------

/// A typed fault an operation declares it may raise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultDescription {
    /// Matched against `FaultException::detail_type`.
    pub detail_type: String,
    /// Action stamped on the fault message.
    pub action: String,
}

impl FaultDescription {
    #[must_use]
    pub fn new(detail_type: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            detail_type: detail_type.into(),
            action: action.into(),
        }
    }
}

/// One operation of a contract.
#[derive(Clone)]
pub struct OperationDescription {
    pub name: String,
    /// Input action; `"*"` declares the catch-all operation.
    pub action: String,
    pub reply_action: Option<String>,
    pub is_one_way: bool,
    /// Closes the session channel after the call completes.
    pub is_terminating: bool,
    pub parameters: Vec<ParameterDescription>,
    pub faults: Vec<FaultDescription>,
    pub release_instance: ReleaseInstanceMode,
    pub method: ServiceMethod,
    /// Overrides the default formatter for this operation.
    pub formatter: Option<Arc<dyn DispatchFormatter>>,
}

impl OperationDescription {
    /// Request/reply operation; the reply action defaults to `"{action}Response"`.
    #[must_use]
    pub fn new(name: impl Into<String>, action: impl Into<String>, method: ServiceMethod) -> Self {
        let action = action.into();
        Self {
            name: name.into(),
            reply_action: Some(format!("{action}Response")),
            action,
            is_one_way: false,
            is_terminating: false,
            parameters: Vec::new(),
            faults: Vec::new(),
            release_instance: ReleaseInstanceMode::None,
            method,
            formatter: None,
        }
    }

    #[must_use]
    pub fn one_way(mut self) -> Self {
        self.is_one_way = true;
        self.reply_action = None;
        self
    }

    #[must_use]
    pub fn terminating(mut self) -> Self {
        self.is_terminating = true;
        self
    }

    #[must_use]
    pub fn with_reply_action(mut self, action: impl Into<String>) -> Self {
        self.reply_action = Some(action.into());
        self
    }

    #[must_use]
    pub fn with_parameters(mut self, parameters: Vec<ParameterDescription>) -> Self {
        self.parameters = parameters;
        self
    }

    #[must_use]
    pub fn with_fault(mut self, fault: FaultDescription) -> Self {
        self.faults.push(fault);
        self
    }

    #[must_use]
    pub fn with_release(mut self, mode: ReleaseInstanceMode) -> Self {
        self.release_instance = mode;
        self
    }

    #[must_use]
    pub fn with_formatter(mut self, formatter: Arc<dyn DispatchFormatter>) -> Self {
        self.formatter = Some(formatter);
        self
    }
}

impl fmt::Debug for OperationDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationDescription")
            .field("name", &self.name)
            .field("action", &self.action)
            .field("is_one_way", &self.is_one_way)
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

/// A named, namespaced set of operations.
#[derive(Debug, Clone)]
pub struct ContractDescription {
    pub name: String,
    pub namespace: String,
    pub operations: Vec<OperationDescription>,
}

impl ContractDescription {
    #[must_use]
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            operations: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_operation(mut self, operation: OperationDescription) -> Self {
        self.operations.push(operation);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Echo;

    #[test]
    fn sync_method_downcasts_instance() {
        let method = ServiceMethod::sync(|_: &Echo, args: &mut [Value]| Ok(args[0].clone()));
        let ServiceMethod::Sync(call) = method else {
            panic!("expected sync method");
        };
        let instance: ServiceObject = Arc::new(Echo);
        let mut args = vec![Value::Int(5)];
        assert_eq!(call(&instance, &mut args).unwrap(), Value::Int(5));

        let wrong: ServiceObject = Arc::new(17_u8);
        assert!(matches!(call(&wrong, &mut args), Err(ServiceError::Other(_))));
    }

    #[tokio::test]
    async fn async_method_returns_arguments() {
        let method = ServiceMethod::asynchronous(|_: Arc<Echo>, mut args: Vec<Value>| async move {
            args[1] = Value::Bool(true);
            Ok::<_, ServiceError>((Value::Int(1), args))
        });
        assert!(!method.is_synchronous());
        let ServiceMethod::Async(call) = method else {
            panic!("expected async method");
        };
        let (result, args) = call(Arc::new(Echo), vec![Value::Null, Value::Null])
            .await
            .unwrap();
        assert_eq!(result, Value::Int(1));
        assert_eq!(args[1], Value::Bool(true));
    }

    #[test]
    fn operation_builder_defaults() {
        let op = OperationDescription::new(
            "Add",
            "urn:calc/Add",
            ServiceMethod::sync(|_: &Echo, _| Ok(Value::Null)),
        );
        assert_eq!(op.reply_action.as_deref(), Some("urn:calc/AddResponse"));
        assert!(!op.is_one_way);

        let one_way = op.one_way();
        assert!(one_way.is_one_way);
        assert!(one_way.reply_action.is_none());
    }
}
