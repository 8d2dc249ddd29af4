//! Endpoint-level dispatch: contracts, operations, invokers, and fault policy.
//!
//! - [`config`]: Dispatcher-wide settings and timeouts
//! - [`contract`]: Declarative contract, operation, and fault descriptions
//! - [`operation`]: Runtime operation with formatter and inspectors
//! - [`invoker`]: Calls the service method with decoded inputs
//! - [`runtime`]: Operation table, selector, inspectors, instancing settings
//! - [`endpoint`]: Address and contract filters around one runtime
//! - [`fault`]: Error handlers and error-to-fault conversion
//! - [`middleware`]: Tower layers wrapped around every invocation

pub mod config;
pub mod contract;
pub mod endpoint;
pub mod fault;
pub mod invoker;
pub mod middleware;
pub mod operation;
pub mod runtime;

pub use config::{DispatcherConfig, TimeoutConfig};
pub use contract::{
    ContractDescription, FaultDescription, OperationDescription, ServiceMethod, ServiceObject,
};
pub use endpoint::EndpointDispatcher;
pub use fault::{
    ErrorHandler, ErrorHandling, FaultConverter, FaultPolicy, SessionShutdownHandler,
    StandardFaultConverter, GENERIC_FAULT_REASON,
};
pub use invoker::{InvokeOutput, MethodInvoker, OperationInvoker};
pub use operation::{CorrelationState, DispatchOperation, ParameterInspector, ReleaseInstanceMode};
pub use runtime::{DispatchRuntime, InstanceFactory, MessageInspector, OperationSelector};
