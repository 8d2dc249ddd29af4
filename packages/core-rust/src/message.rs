//! Message envelope: headers, single-consumption body, buffered copies.
//!
//! A [`Message`] body can be read exactly once. Components that need to look
//! at a message more than once take a [`MessageBuffer`] via
//! [`Message::create_buffered_copy`] and mint fresh messages from it.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::fault::FaultBody;

// ---------------------------------------------------------------------------
// MessageVersion
// ---------------------------------------------------------------------------

/// Namespace used for WS-Addressing 1.0 headers and fault codes.
pub const ADDRESSING10_NAMESPACE: &str = "http://www.w3.org/2005/08/addressing";

/// Envelope/addressing combination a message is framed with.
///
/// The dispatch core never encodes envelopes itself; the version only decides
/// whether faults can be expressed and which fault action/namespace they use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MessageVersion {
    /// Raw payloads with no envelope. Faults cannot be represented.
    None,
    /// SOAP 1.1 envelope without addressing headers.
    Soap11,
    /// SOAP 1.2 envelope with WS-Addressing 1.0.
    #[default]
    Soap12Addressing10,
}

impl MessageVersion {
    /// Whether this version has an envelope capable of carrying a fault.
    #[must_use]
    pub fn supports_faults(self) -> bool {
        !matches!(self, Self::None)
    }

    /// Namespace for addressing-level fault codes, if addressing is in use.
    #[must_use]
    pub fn addressing_namespace(self) -> Option<&'static str> {
        match self {
            Self::Soap12Addressing10 => Some(ADDRESSING10_NAMESPACE),
            Self::None | Self::Soap11 => None,
        }
    }

    /// Action stamped on faults that have no operation-specific action.
    #[must_use]
    pub fn default_fault_action(self) -> Option<&'static str> {
        match self {
            Self::Soap12Addressing10 => Some("http://www.w3.org/2005/08/addressing/soap/fault"),
            Self::None | Self::Soap11 => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

/// Addressing headers carried by every message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeaders {
    /// Destination URI.
    pub to: Option<String>,
    /// Action URI identifying the target operation.
    pub action: Option<String>,
    /// Correlation id of this message.
    pub message_id: Option<String>,
    /// Correlation id of the request this message answers.
    pub relates_to: Option<String>,
    /// Address the sender wants replies delivered to.
    pub reply_to: Option<String>,
}

impl MessageHeaders {
    /// Generate a fresh `urn:uuid:` message id.
    #[must_use]
    pub fn new_message_id() -> String {
        format!("urn:uuid:{}", uuid::Uuid::new_v4())
    }
}

// ---------------------------------------------------------------------------
// MessageState / MessageError
// ---------------------------------------------------------------------------

/// Consumption state of a message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    /// Body not yet touched.
    Created,
    /// Body has been read.
    Read,
    /// Body has been moved into a [`MessageBuffer`].
    Copied,
    /// Message was closed; its resources are released.
    Closed,
}

/// Errors raised by message body access.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("message body cannot be accessed in state {state:?}")]
    InvalidState { state: MessageState },
    #[error("message is not a fault")]
    NotAFault,
    #[error("message version {version:?} cannot carry a fault")]
    FaultsUnsupported { version: MessageVersion },
    #[error("failed to encode message body: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode message body: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Opaque, single-consumption message envelope.
///
/// Ownership moves along the dispatch path; whoever holds the message last is
/// responsible for it. Dropping or [`close`](Self::close)-ing releases the body.
#[derive(Debug)]
pub struct Message {
    version: MessageVersion,
    headers: MessageHeaders,
    body: Option<Bytes>,
    is_fault: bool,
    state: MessageState,
}

impl Message {
    /// Create a message with a raw body.
    #[must_use]
    pub fn new(version: MessageVersion, action: impl Into<String>, body: Bytes) -> Self {
        Self {
            version,
            headers: MessageHeaders {
                action: Some(action.into()),
                ..MessageHeaders::default()
            },
            body: Some(body),
            is_fault: false,
            state: MessageState::Created,
        }
    }

    /// Create a message with no body.
    #[must_use]
    pub fn empty(version: MessageVersion, action: impl Into<String>) -> Self {
        let mut message = Self::new(version, action, Bytes::new());
        message.body = None;
        message
    }

    /// Create a message whose body is `value` encoded as named `MsgPack`.
    ///
    /// # Errors
    ///
    /// Returns `MessageError::Encode` if `value` cannot be serialized.
    pub fn from_value<T: Serialize>(
        version: MessageVersion,
        action: impl Into<String>,
        value: &T,
    ) -> Result<Self, MessageError> {
        let bytes = rmp_serde::to_vec_named(value)?;
        Ok(Self::new(version, action, Bytes::from(bytes)))
    }

    /// Create a fault message.
    ///
    /// `action` falls back to the version's default fault action.
    ///
    /// # Errors
    ///
    /// Returns `MessageError::FaultsUnsupported` for [`MessageVersion::None`].
    pub fn fault(
        version: MessageVersion,
        fault: &FaultBody,
        action: Option<&str>,
    ) -> Result<Self, MessageError> {
        if !version.supports_faults() {
            return Err(MessageError::FaultsUnsupported { version });
        }
        let bytes = rmp_serde::to_vec_named(fault)?;
        let action = action.or_else(|| version.default_fault_action());
        Ok(Self {
            version,
            headers: MessageHeaders {
                action: action.map(str::to_string),
                ..MessageHeaders::default()
            },
            body: Some(Bytes::from(bytes)),
            is_fault: true,
            state: MessageState::Created,
        })
    }

    /// Envelope version.
    #[must_use]
    pub fn version(&self) -> MessageVersion {
        self.version
    }

    /// Addressing headers.
    #[must_use]
    pub fn headers(&self) -> &MessageHeaders {
        &self.headers
    }

    /// Mutable addressing headers. Headers stay accessible after the body is read.
    pub fn headers_mut(&mut self) -> &mut MessageHeaders {
        &mut self.headers
    }

    /// Shorthand for `headers().action`.
    #[must_use]
    pub fn action(&self) -> Option<&str> {
        self.headers.action.as_deref()
    }

    /// Builder-style setter for the destination header.
    #[must_use]
    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.headers.to = Some(to.into());
        self
    }

    /// Builder-style setter for the message id header.
    #[must_use]
    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.headers.message_id = Some(id.into());
        self
    }

    /// Whether this message carries a fault body.
    #[must_use]
    pub fn is_fault(&self) -> bool {
        self.is_fault
    }

    /// Whether the message was created without a body.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.body.is_none()
    }

    /// Current consumption state.
    #[must_use]
    pub fn state(&self) -> MessageState {
        self.state
    }

    /// Read the raw body. Succeeds once.
    ///
    /// # Errors
    ///
    /// Returns `MessageError::InvalidState` if the body was already read,
    /// copied, or the message was closed.
    pub fn read_body(&mut self) -> Result<Bytes, MessageError> {
        if self.state != MessageState::Created {
            return Err(MessageError::InvalidState { state: self.state });
        }
        self.state = MessageState::Read;
        Ok(self.body.take().unwrap_or_default())
    }

    /// Read and decode the body as `T`.
    ///
    /// # Errors
    ///
    /// Propagates [`read_body`](Self::read_body) errors and decode failures.
    pub fn read_body_as<T: DeserializeOwned>(&mut self) -> Result<T, MessageError> {
        let bytes = self.read_body()?;
        Ok(rmp_serde::from_slice(&bytes)?)
    }

    /// Read the body as a fault.
    ///
    /// # Errors
    ///
    /// Returns `MessageError::NotAFault` for non-fault messages.
    pub fn read_fault(&mut self) -> Result<FaultBody, MessageError> {
        if !self.is_fault {
            return Err(MessageError::NotAFault);
        }
        self.read_body_as()
    }

    /// Move the body into a reusable buffer.
    ///
    /// # Errors
    ///
    /// Returns `MessageError::InvalidState` unless the body is untouched.
    pub fn create_buffered_copy(&mut self) -> Result<MessageBuffer, MessageError> {
        if self.state != MessageState::Created {
            return Err(MessageError::InvalidState { state: self.state });
        }
        self.state = MessageState::Copied;
        Ok(MessageBuffer {
            version: self.version,
            headers: self.headers.clone(),
            body: self.body.take(),
            is_fault: self.is_fault,
        })
    }

    /// Release the body. Idempotent.
    pub fn close(&mut self) {
        self.body = None;
        self.state = MessageState::Closed;
    }
}

// ---------------------------------------------------------------------------
// MessageBuffer
// ---------------------------------------------------------------------------

/// Buffered copy of a message that can mint any number of fresh messages.
#[derive(Debug, Clone)]
pub struct MessageBuffer {
    version: MessageVersion,
    headers: MessageHeaders,
    body: Option<Bytes>,
    is_fault: bool,
}

impl MessageBuffer {
    /// Create a new, unread message from the buffer. `Bytes` clones are shallow.
    #[must_use]
    pub fn create_message(&self) -> Message {
        Message {
            version: self.version,
            headers: self.headers.clone(),
            body: self.body.clone(),
            is_fault: self.is_fault,
            state: MessageState::Created,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{FaultBody, FaultCode};

    #[test]
    fn body_reads_once() {
        let mut msg = Message::new(MessageVersion::default(), "urn:a", Bytes::from_static(b"xyz"));
        assert_eq!(msg.read_body().unwrap(), Bytes::from_static(b"xyz"));
        assert_eq!(msg.state(), MessageState::Read);
        assert!(matches!(
            msg.read_body(),
            Err(MessageError::InvalidState { state: MessageState::Read })
        ));
    }

    #[test]
    fn headers_survive_body_read() {
        let mut msg = Message::new(MessageVersion::default(), "urn:a", Bytes::new())
            .with_to("net.mem://host/svc")
            .with_message_id("urn:uuid:1");
        msg.read_body().unwrap();
        assert_eq!(msg.action(), Some("urn:a"));
        assert_eq!(msg.headers().to.as_deref(), Some("net.mem://host/svc"));
    }

    #[test]
    fn buffered_copy_mints_independent_messages() {
        let mut msg = Message::from_value(MessageVersion::default(), "urn:a", &42_i64).unwrap();
        let buffer = msg.create_buffered_copy().unwrap();
        assert_eq!(msg.state(), MessageState::Copied);
        assert!(msg.read_body().is_err());

        let mut first = buffer.create_message();
        let mut second = buffer.create_message();
        assert_eq!(first.read_body_as::<i64>().unwrap(), 42);
        assert_eq!(second.read_body_as::<i64>().unwrap(), 42);
    }

    #[test]
    fn closed_message_rejects_reads() {
        let mut msg = Message::empty(MessageVersion::default(), "urn:a");
        msg.close();
        msg.close();
        assert!(matches!(
            msg.read_body(),
            Err(MessageError::InvalidState { state: MessageState::Closed })
        ));
    }

    #[test]
    fn fault_uses_default_action_and_decodes() {
        let body = FaultBody::new(FaultCode::receiver("Oops", "urn:test"), "boom");
        let mut msg = Message::fault(MessageVersion::Soap12Addressing10, &body, None).unwrap();
        assert!(msg.is_fault());
        assert_eq!(
            msg.action(),
            MessageVersion::Soap12Addressing10.default_fault_action()
        );
        assert_eq!(msg.read_fault().unwrap(), body);
    }

    #[test]
    fn version_none_cannot_carry_faults() {
        let body = FaultBody::new(FaultCode::receiver("Oops", "urn:test"), "boom");
        let err = Message::fault(MessageVersion::None, &body, None).unwrap_err();
        assert!(matches!(err, MessageError::FaultsUnsupported { .. }));
    }

    #[test]
    fn read_fault_on_plain_message_errors() {
        let mut msg = Message::empty(MessageVersion::default(), "urn:a");
        assert!(matches!(msg.read_fault(), Err(MessageError::NotAFault)));
    }
}
