//! Error taxonomy for the dispatch runtime.
//!
//! - [`ConfigError`]: Setup-time misconfiguration; the dispatcher never starts.
//! - [`TransportError`]: listener/channel failures, reported per channel.
//! - [`ServiceError`]: what a service method returns.
//! - [`DispatchError`]: the per-request error carried through the pipeline.

use std::time::Duration;

use hostwire_core::{FaultCode, FilterError, FormatterError, MessageError, Value};

use crate::channel::lifecycle::DispatcherState;

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Configuration errors, raised before the accept loop starts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("endpoint {endpoint}: no instance provider and no default instance factory")]
    MissingInstanceFactory { endpoint: String },
    #[error("operation {name} is already registered")]
    DuplicateOperation { name: String },
    #[error("action {action} is already bound to operation {existing}")]
    DuplicateAction { action: String, existing: String },
    #[error("endpoint {endpoint} has no {kind} filter")]
    MissingFilter {
        endpoint: String,
        kind: &'static str,
    },
    #[error("dispatcher cannot be reconfigured in state {state:?}")]
    InvalidState { state: DispatcherState },
    #[error("endpoint does not belong to this dispatcher")]
    ForeignEndpoint,
    #[error("dispatcher is already attached to host {host}")]
    AlreadyAttached { host: String },
    #[error("dispatcher is not attached to this host")]
    NotAttached,
    #[error(transparent)]
    Filter(#[from] FilterError),
}

// ---------------------------------------------------------------------------
// TransportError
// ---------------------------------------------------------------------------

/// Failures of a listener or channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
    #[error("communication object is closed")]
    Closed,
    #[error("communication object was aborted")]
    Aborted,
    #[error("request was already replied to")]
    AlreadyReplied,
    #[error("communication failure: {0}")]
    Communication(String),
}

// ---------------------------------------------------------------------------
// ServiceError / FaultException
// ---------------------------------------------------------------------------

/// A typed, intentionally client-visible fault raised by a service method.
///
/// If the operation declares a fault whose `detail_type` matches, the detail is
/// serialized under that fault's action.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{reason}")]
pub struct FaultException {
    pub detail_type: String,
    pub detail: Value,
    pub reason: String,
    /// Overrides the default sender `FaultCode` when set.
    pub code: Option<FaultCode>,
}

impl FaultException {
    #[must_use]
    pub fn new(
        detail_type: impl Into<String>,
        detail: impl Into<Value>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            detail_type: detail_type.into(),
            detail: detail.into(),
            reason: reason.into(),
            code: None,
        }
    }

    #[must_use]
    pub fn with_code(mut self, code: FaultCode) -> Self {
        self.code = Some(code);
        self
    }
}

/// Error returned by a service method.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Fault(#[from] FaultException),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ---------------------------------------------------------------------------
// DispatchError
// ---------------------------------------------------------------------------

/// Per-request error raised inside the pipeline or by endpoint routing.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("{count} candidates matched the message at priority {priority}")]
    AmbiguousMatch { priority: i32, count: usize },
    #[error("{what} is closed")]
    ObjectDisposed { what: &'static str },
    #[error(transparent)]
    Configuration(#[from] ConfigError),
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("no operation handles action {action:?}")]
    ActionNotSupported { action: String },
    #[error("failed to format parameters: {0}")]
    Formatter(#[from] FormatterError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("operation panicked: {message}")]
    Panicked { message: String },
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<FilterError> for DispatchError {
    fn from(err: FilterError) -> Self {
        match err {
            FilterError::AmbiguousMatch { priority, count } => {
                Self::AmbiguousMatch { priority, count }
            }
            FilterError::DuplicateFilter => Self::Configuration(ConfigError::Filter(err)),
        }
    }
}

impl From<FaultException> for DispatchError {
    fn from(fault: FaultException) -> Self {
        Self::Service(ServiceError::Fault(fault))
    }
}

impl DispatchError {
    /// Build a `Panicked` error from a caught panic payload.
    #[must_use]
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self::Panicked { message }
    }

    /// The typed fault raised by the service, if any.
    #[must_use]
    pub fn as_fault_exception(&self) -> Option<&FaultException> {
        match self {
            Self::Service(ServiceError::Fault(fault)) => Some(fault),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ambiguous_filter_error_maps_to_dispatch_error() {
        let err: DispatchError = FilterError::AmbiguousMatch {
            priority: 2,
            count: 3,
        }
        .into();
        assert!(matches!(
            err,
            DispatchError::AmbiguousMatch {
                priority: 2,
                count: 3
            }
        ));
    }

    #[test]
    fn duplicate_filter_is_a_configuration_error() {
        let err: DispatchError = FilterError::DuplicateFilter.into();
        assert!(matches!(
            err,
            DispatchError::Configuration(ConfigError::Filter(FilterError::DuplicateFilter))
        ));
    }

    #[test]
    fn panic_payloads_are_stringified() {
        let err = DispatchError::from_panic(&"boom");
        assert!(matches!(err, DispatchError::Panicked { message } if message == "boom"));

        let owned: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        let err = DispatchError::from_panic(owned.as_ref());
        assert!(matches!(err, DispatchError::Panicked { message } if message == "owned"));
    }

    #[test]
    fn fault_exception_is_reachable_through_dispatch_error() {
        let err: DispatchError = FaultException::new("DivideByZero", 7_i64, "divide by zero").into();
        let fault = err.as_fault_exception().unwrap();
        assert_eq!(fault.detail_type, "DivideByZero");
        assert_eq!(err.to_string(), "divide by zero");
    }
}
