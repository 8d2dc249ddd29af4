//! Fault construction: converters, error handlers, and the fault policy.
//!
//! Policy order when a request fails:
//! 1. every registered [`ErrorHandler`] may provide a fault directly;
//! 2. a typed `FaultException` declared by the operation is serialized under
//!    its declared action;
//! 3. the version's [`FaultConverter`] translates dispatch-level errors;
//! 4. a generic internal fault, exposing details only on explicit opt-in.
//!
//! Returning `None` means no fault can be produced and the error propagates.

use std::sync::Arc;

use hostwire_core::fault::{codes, DISPATCH_FAULT_NAMESPACE, EXCEPTION_DETAIL_TYPE};
use hostwire_core::{
    ExceptionDetail, FaultBody, FaultCode, FaultDetail, Message, MessageError, MessageVersion,
};
use tracing::warn;

use super::operation::DispatchOperation;
use crate::error::DispatchError;

/// Reason text of generic faults when exception details are not exposed.
pub const GENERIC_FAULT_REASON: &str =
    "The server was unable to process the request due to an internal error.";

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Translates an error into a protocol fault message.
pub trait FaultConverter: Send + Sync {
    fn try_create_fault_message(&self, error: &DispatchError) -> Option<Message>;
}

/// Outcome of [`ErrorHandler::handle_error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorHandling {
    /// Not handled; later handlers run.
    Unhandled,
    /// Handled; suppresses propagation.
    Handled,
    /// Handled, and the session must be torn down.
    Shutdown,
}

/// User hook over request failures.
pub trait ErrorHandler: Send + Sync {
    /// Replace or supply the fault sent for `error`.
    fn provide_fault(
        &self,
        _error: &DispatchError,
        _version: MessageVersion,
        _fault: &mut Option<Message>,
    ) {
    }

    fn handle_error(&self, error: &DispatchError) -> ErrorHandling;
}

/// Notified when an error handler tears down a session.
pub trait SessionShutdownHandler: Send + Sync {
    fn session_shutdown(&self, session_id: Option<&str>);
}

// ---------------------------------------------------------------------------
// Standard faults
// ---------------------------------------------------------------------------

fn addressing_or_dispatch(version: MessageVersion) -> &'static str {
    version
        .addressing_namespace()
        .unwrap_or(DISPATCH_FAULT_NAMESPACE)
}

/// Sender fault for a destination no endpoint listens on.
#[must_use]
pub fn destination_unreachable(version: MessageVersion, to: Option<&str>) -> FaultBody {
    FaultBody::new(
        FaultCode::sender(codes::DESTINATION_UNREACHABLE, addressing_or_dispatch(version)),
        format!(
            "The message with To '{}' cannot be processed at the receiver, due to an \
             AddressFilter mismatch at the EndpointDispatcher.",
            to.unwrap_or_default()
        ),
    )
}

/// Sender fault for an action no operation or contract filter accepts.
#[must_use]
pub fn action_not_supported(version: MessageVersion, action: &str) -> FaultBody {
    FaultBody::new(
        FaultCode::sender(codes::ACTION_NOT_SUPPORTED, addressing_or_dispatch(version)),
        format!("The message with Action '{action}' cannot be processed at the receiver."),
    )
}

/// Receiver fault sent when the service tears down the session.
#[must_use]
pub fn session_terminated() -> FaultBody {
    FaultBody::new(
        FaultCode::receiver(codes::SESSION_TERMINATED, DISPATCH_FAULT_NAMESPACE),
        "The session was terminated by the service.",
    )
}

/// Converter for dispatch-level errors, keyed by message version.
#[derive(Debug, Clone, Copy)]
pub struct StandardFaultConverter {
    version: MessageVersion,
}

impl StandardFaultConverter {
    #[must_use]
    pub fn for_version(version: MessageVersion) -> Self {
        Self { version }
    }

    fn body_for(&self, error: &DispatchError) -> Option<FaultBody> {
        match error {
            DispatchError::ActionNotSupported { action } => {
                Some(action_not_supported(self.version, action))
            }
            DispatchError::Formatter(_) | DispatchError::Message(MessageError::Decode(_)) => {
                Some(FaultBody::new(
                    FaultCode::sender(codes::DESERIALIZATION_FAILED, DISPATCH_FAULT_NAMESPACE),
                    "The request body could not be deserialized.",
                ))
            }
            DispatchError::Timeout { timeout_ms } => Some(FaultBody::new(
                FaultCode::receiver(codes::TIMEOUT, DISPATCH_FAULT_NAMESPACE),
                format!("The operation did not complete within {timeout_ms}ms."),
            )),
            _ => None,
        }
    }
}

impl FaultConverter for StandardFaultConverter {
    fn try_create_fault_message(&self, error: &DispatchError) -> Option<Message> {
        if !self.version.supports_faults() {
            return None;
        }
        let body = self.body_for(error)?;
        Message::fault(self.version, &body, None).ok()
    }
}

// ---------------------------------------------------------------------------
// FaultPolicy
// ---------------------------------------------------------------------------

/// Dispatcher-wide fault construction settings.
#[derive(Clone)]
pub struct FaultPolicy {
    version: MessageVersion,
    include_exception_detail: bool,
    enable_faults: bool,
    converter: Arc<dyn FaultConverter>,
}

impl FaultPolicy {
    #[must_use]
    pub fn new(version: MessageVersion, include_exception_detail: bool, enable_faults: bool) -> Self {
        Self {
            version,
            include_exception_detail,
            enable_faults,
            converter: Arc::new(StandardFaultConverter::for_version(version)),
        }
    }

    #[must_use]
    pub fn with_converter(mut self, converter: Arc<dyn FaultConverter>) -> Self {
        self.converter = converter;
        self
    }

    #[must_use]
    pub fn version(&self) -> MessageVersion {
        self.version
    }

    /// Produce the fault for `error`, or `None` if it must propagate.
    #[must_use]
    pub fn build_fault(
        &self,
        error: &DispatchError,
        operation: Option<&DispatchOperation>,
        handlers: &[Arc<dyn ErrorHandler>],
    ) -> Option<Message> {
        let mut fault = None;
        for handler in handlers {
            handler.provide_fault(error, self.version, &mut fault);
        }
        if fault.is_some() {
            return fault;
        }

        if let Some(exception) = error.as_fault_exception() {
            let code = exception.code.clone().unwrap_or_else(|| {
                FaultCode::sender(exception.detail_type.clone(), DISPATCH_FAULT_NAMESPACE)
            });
            let body = FaultBody::new(code, exception.reason.clone());
            return match operation.and_then(|op| op.declared_fault(&exception.detail_type)) {
                Some(declared) => self.encode(
                    &body.with_detail(FaultDetail {
                        type_name: exception.detail_type.clone(),
                        value: exception.detail.clone(),
                    }),
                    Some(&declared.action),
                ),
                // Undeclared typed faults keep their reason but never their detail.
                None => self.encode(&body, None),
            };
        }

        if let Some(message) = self.converter.try_create_fault_message(error) {
            return Some(message);
        }

        if !self.enable_faults {
            return None;
        }
        let code = FaultCode::receiver(codes::INTERNAL_SERVICE_FAULT, DISPATCH_FAULT_NAMESPACE);
        let body = if self.include_exception_detail {
            FaultBody::new(code, error.to_string())
                .with_detail(ExceptionDetail::from_error(EXCEPTION_DETAIL_TYPE, error).into_fault_detail())
        } else {
            FaultBody::new(code, GENERIC_FAULT_REASON)
        };
        self.encode(&body, None)
    }

    fn encode(&self, body: &FaultBody, action: Option<&str>) -> Option<Message> {
        match Message::fault(self.version, body, action) {
            Ok(message) => Some(message),
            Err(MessageError::FaultsUnsupported { .. }) => None,
            Err(err) => {
                warn!(error = %err, "failed to encode fault message");
                None
            }
        }
    }
}

impl std::fmt::Debug for FaultPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultPolicy")
            .field("version", &self.version)
            .field("include_exception_detail", &self.include_exception_detail)
            .field("enable_faults", &self.enable_faults)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use hostwire_core::{FaultParty, Value};

    use super::*;
    use crate::dispatcher::contract::{FaultDescription, OperationDescription, ServiceMethod};
    use crate::error::FaultException;

    struct Calc;

    fn divide_op() -> DispatchOperation {
        DispatchOperation::from_description(
            &OperationDescription::new(
                "Divide",
                "urn:calc/Divide",
                ServiceMethod::sync(|_: &Calc, _| Ok(Value::Null)),
            )
            .with_fault(FaultDescription::new("DivideByZero", "urn:calc/DivideByZeroFault")),
        )
    }

    fn policy(include_detail: bool) -> FaultPolicy {
        FaultPolicy::new(MessageVersion::Soap12Addressing10, include_detail, true)
    }

    #[test]
    fn declared_fault_uses_declared_action_and_detail() {
        let err: DispatchError = FaultException::new("DivideByZero", 10_i64, "divide by zero").into();
        let mut fault = policy(false)
            .build_fault(&err, Some(&divide_op()), &[])
            .unwrap();
        assert!(fault.is_fault());
        assert_eq!(fault.action(), Some("urn:calc/DivideByZeroFault"));
        let body = fault.read_fault().unwrap();
        assert_eq!(body.reason, "divide by zero");
        let detail = body.detail.unwrap();
        assert_eq!(detail.type_name, "DivideByZero");
        assert_eq!(detail.value, Value::Int(10));
    }

    #[test]
    fn undeclared_fault_drops_detail() {
        let err: DispatchError = FaultException::new("Secret", "classified", "nope").into();
        let mut fault = policy(false)
            .build_fault(&err, Some(&divide_op()), &[])
            .unwrap();
        let body = fault.read_fault().unwrap();
        assert_eq!(body.reason, "nope");
        assert!(body.detail.is_none());
    }

    #[test]
    fn generic_fault_hides_details_by_default() {
        let err = DispatchError::Internal(anyhow::anyhow!("db password is hunter2"));
        let mut fault = policy(false).build_fault(&err, None, &[]).unwrap();
        let body = fault.read_fault().unwrap();
        assert_eq!(body.reason, GENERIC_FAULT_REASON);
        assert!(body.detail.is_none());
        assert_eq!(body.code.party, FaultParty::Receiver);
        assert_eq!(body.code.name, codes::INTERNAL_SERVICE_FAULT);
    }

    #[test]
    fn generic_fault_includes_details_on_opt_in() {
        let err = DispatchError::Internal(anyhow::anyhow!("boom"));
        let mut fault = policy(true).build_fault(&err, None, &[]).unwrap();
        let body = fault.read_fault().unwrap();
        assert!(body.reason.contains("boom"));
        assert_eq!(body.detail.unwrap().type_name, EXCEPTION_DETAIL_TYPE);
    }

    #[test]
    fn converter_handles_action_not_supported() {
        let err = DispatchError::ActionNotSupported {
            action: "urn:nope".to_string(),
        };
        let mut fault = policy(false).build_fault(&err, None, &[]).unwrap();
        let body = fault.read_fault().unwrap();
        assert!(body.code.is_sender_fault());
        assert_eq!(body.code.name, codes::ACTION_NOT_SUPPORTED);
    }

    #[test]
    fn disabled_faults_and_faultless_versions_propagate() {
        let err = DispatchError::Internal(anyhow::anyhow!("boom"));
        let disabled = FaultPolicy::new(MessageVersion::Soap12Addressing10, false, false);
        assert!(disabled.build_fault(&err, None, &[]).is_none());

        let raw = FaultPolicy::new(MessageVersion::None, false, true);
        assert!(raw.build_fault(&err, None, &[]).is_none());
        let typed: DispatchError = FaultException::new("DivideByZero", 1_i64, "x").into();
        assert!(raw.build_fault(&typed, Some(&divide_op()), &[]).is_none());
    }

    struct Replacing;

    impl ErrorHandler for Replacing {
        fn provide_fault(
            &self,
            _error: &DispatchError,
            version: MessageVersion,
            fault: &mut Option<Message>,
        ) {
            let body = FaultBody::new(FaultCode::receiver("Custom", "urn:test"), "custom");
            *fault = Message::fault(version, &body, Some("urn:test/custom")).ok();
        }

        fn handle_error(&self, _error: &DispatchError) -> ErrorHandling {
            ErrorHandling::Unhandled
        }
    }

    #[test]
    fn error_handler_fault_wins() {
        let err: DispatchError = FaultException::new("DivideByZero", 1_i64, "x").into();
        let handlers: Vec<Arc<dyn ErrorHandler>> = vec![Arc::new(Replacing)];
        let fault = policy(false)
            .build_fault(&err, Some(&divide_op()), &handlers)
            .unwrap();
        assert_eq!(fault.action(), Some("urn:test/custom"));
    }
}
