//! Protocol-level fault bodies.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Namespace for fault codes raised by the dispatch runtime itself.
pub const DISPATCH_FAULT_NAMESPACE: &str = "urn:hostwire:dispatch";

/// Well-known fault code names.
pub mod codes {
    pub const DESTINATION_UNREACHABLE: &str = "DestinationUnreachable";
    pub const ACTION_NOT_SUPPORTED: &str = "ActionNotSupported";
    pub const INTERNAL_SERVICE_FAULT: &str = "InternalServiceFault";
    pub const DESERIALIZATION_FAILED: &str = "DeserializationFailed";
    pub const SESSION_TERMINATED: &str = "SessionTerminated";
    pub const TIMEOUT: &str = "Timeout";
}

/// Which party a fault blames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultParty {
    /// The request was malformed or unroutable.
    Sender,
    /// The service failed while handling a well-formed request.
    Receiver,
}

/// Hierarchical fault code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultCode {
    pub party: FaultParty,
    pub name: String,
    pub namespace: String,
    pub sub_code: Option<Box<FaultCode>>,
}

impl FaultCode {
    #[must_use]
    pub fn sender(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            party: FaultParty::Sender,
            name: name.into(),
            namespace: namespace.into(),
            sub_code: None,
        }
    }

    #[must_use]
    pub fn receiver(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            party: FaultParty::Receiver,
            name: name.into(),
            namespace: namespace.into(),
            sub_code: None,
        }
    }

    /// Attach a more specific sub-code.
    #[must_use]
    pub fn with_sub_code(mut self, sub_code: FaultCode) -> Self {
        self.sub_code = Some(Box::new(sub_code));
        self
    }

    #[must_use]
    pub fn is_sender_fault(&self) -> bool {
        self.party == FaultParty::Sender
    }
}

/// Typed detail attached to a fault, tagged with the declared detail type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultDetail {
    pub type_name: String,
    pub value: Value,
}

/// Body of a fault message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultBody {
    pub code: FaultCode,
    pub reason: String,
    pub detail: Option<FaultDetail>,
}

impl FaultBody {
    #[must_use]
    pub fn new(code: FaultCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            detail: None,
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: FaultDetail) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// Detail type name used when exception details are exposed in faults.
pub const EXCEPTION_DETAIL_TYPE: &str = "ExceptionDetail";

/// Debugging description of an error chain, only ever placed in a fault when
/// the dispatcher explicitly opts into exposing exception details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionDetail {
    pub type_name: String,
    pub message: String,
    pub inner: Option<Box<ExceptionDetail>>,
}

impl ExceptionDetail {
    /// Build from any error, walking its `source()` chain.
    #[must_use]
    pub fn from_error(type_name: &str, err: &(dyn std::error::Error + 'static)) -> Self {
        let mut causes = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }
        let inner = causes.into_iter().rev().fold(None, |inner, message| {
            Some(Box::new(Self {
                type_name: "cause".to_string(),
                message,
                inner,
            }))
        });
        Self {
            type_name: type_name.to_string(),
            message: err.to_string(),
            inner,
        }
    }

    /// Encode as a fault detail value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert("type".to_string(), Value::String(self.type_name.clone()));
        map.insert("message".to_string(), Value::String(self.message.clone()));
        map.insert(
            "inner".to_string(),
            self.inner.as_ref().map_or(Value::Null, |inner| inner.to_value()),
        );
        Value::Map(map)
    }

    #[must_use]
    pub fn into_fault_detail(self) -> FaultDetail {
        FaultDetail {
            type_name: EXCEPTION_DETAIL_TYPE.to_string(),
            value: self.to_value(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("outer failure")]
    struct Outer(#[source] Inner);

    #[derive(Debug, thiserror::Error)]
    #[error("inner failure")]
    struct Inner;

    #[test]
    fn exception_detail_walks_source_chain() {
        let detail = ExceptionDetail::from_error("Outer", &Outer(Inner));
        assert_eq!(detail.message, "outer failure");
        assert_eq!(detail.inner.as_ref().unwrap().message, "inner failure");
        assert!(detail.inner.unwrap().inner.is_none());
    }

    #[test]
    fn sub_codes_nest() {
        let code = FaultCode::sender("Client", "urn:a")
            .with_sub_code(FaultCode::sender(codes::ACTION_NOT_SUPPORTED, "urn:b"));
        assert!(code.is_sender_fault());
        assert_eq!(code.sub_code.unwrap().name, codes::ACTION_NOT_SUPPORTED);
    }
}
