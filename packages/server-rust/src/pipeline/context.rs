//! Per-request processing context threaded through every stage.

use std::fmt;
use std::sync::Arc;

use hostwire_core::{Message, MessageHeaders, MessageVersion, ANONYMOUS_ADDRESS};
use tokio_util::sync::CancellationToken;

use crate::channel::transport::{Channel, RequestContext};
use crate::dispatcher::contract::ServiceObject;
use crate::dispatcher::operation::{CorrelationState, DispatchOperation};
use crate::error::DispatchError;
use crate::instance::InstanceContext;

/// Where a reply for the current request goes.
pub enum ReplyTarget {
    /// Reply through the request/reply channel's request context.
    Request(Box<dyn RequestContext>),
    /// Send the reply as an ordinary message on the (duplex) channel.
    Channel,
    /// Input-only channel: nothing can be sent back.
    None,
}

impl ReplyTarget {
    #[must_use]
    pub fn can_reply(&self) -> bool {
        !matches!(self, Self::None)
    }
}

impl fmt::Debug for ReplyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request(cx) => f.debug_tuple("Request").field(cx).finish(),
            Self::Channel => f.write_str("Channel"),
            Self::None => f.write_str("None"),
        }
    }
}

/// Transient state of one in-flight request. Created per message and dropped
/// after the finalize chain; never shared between requests.
pub struct ProcessingContext {
    pub call_id: u64,
    pub request: Option<Message>,
    /// Copied from the request before its body is consumed.
    pub request_headers: MessageHeaders,
    /// Envelope version for the reply or fault.
    pub version: MessageVersion,
    pub channel: Arc<dyn Channel>,
    pub reply_target: ReplyTarget,
    pub session_id: Option<String>,
    pub operation: Option<Arc<DispatchOperation>>,
    pub instance_context: Option<Arc<InstanceContext>>,
    pub instance: Option<ServiceObject>,
    pub reply: Option<Message>,
    pub fault: Option<Message>,
    pub error: Option<DispatchError>,
    /// The error chain produced a fault message for the error.
    pub fault_produced: bool,
    /// An error handler claimed the error.
    pub handled: bool,
    /// An error handler asked for the session to be torn down.
    pub terminate_session: bool,
    /// A reply or fault already went out.
    pub replied: bool,
    /// One slot per message inspector, in registration order.
    pub inspector_state: Vec<CorrelationState>,
    pub cancellation: CancellationToken,
}

impl ProcessingContext {
    #[must_use]
    pub fn new(
        call_id: u64,
        request: Message,
        version: MessageVersion,
        channel: Arc<dyn Channel>,
        reply_target: ReplyTarget,
    ) -> Self {
        let session_id = channel.session_id().map(str::to_string);
        Self {
            call_id,
            request_headers: request.headers().clone(),
            request: Some(request),
            version,
            channel,
            reply_target,
            session_id,
            operation: None,
            instance_context: None,
            instance: None,
            reply: None,
            fault: None,
            error: None,
            fault_produced: false,
            handled: false,
            terminate_session: false,
            replied: false,
            inspector_state: Vec::new(),
            cancellation: CancellationToken::new(),
        }
    }

    /// Tie this request to a cancellation scope, e.g. dispatcher shutdown.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Request action, or `""` when absent.
    #[must_use]
    pub fn action(&self) -> &str {
        self.request_headers.action.as_deref().unwrap_or_default()
    }

    #[must_use]
    pub fn is_one_way(&self) -> bool {
        self.operation.as_ref().is_some_and(|op| op.is_one_way())
    }
}

impl fmt::Debug for ProcessingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessingContext")
            .field("call_id", &self.call_id)
            .field("action", &self.request_headers.action)
            .field("session_id", &self.session_id)
            .field("operation", &self.operation.as_ref().map(|op| op.name()))
            .field("error", &self.error)
            .field("replied", &self.replied)
            .finish_non_exhaustive()
    }
}

/// Fill in reply addressing from the request.
///
/// `relates_to` always points at the request; on sessionless channels the
/// reply is also addressed to the request's `reply_to` unless that is the
/// anonymous back channel. Manual addressing leaves the reply untouched.
pub(crate) fn correlate_reply(
    reply: &mut Message,
    request_headers: &MessageHeaders,
    has_session: bool,
    manual_addressing: bool,
) {
    if manual_addressing {
        return;
    }
    let headers = reply.headers_mut();
    headers.relates_to.clone_from(&request_headers.message_id);
    if headers.message_id.is_none() {
        headers.message_id = Some(MessageHeaders::new_message_id());
    }
    if !has_session {
        if let Some(reply_to) = &request_headers.reply_to {
            if reply_to != ANONYMOUS_ADDRESS {
                headers.to = Some(reply_to.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_headers(reply_to: Option<&str>) -> MessageHeaders {
        MessageHeaders {
            action: Some("Ping".into()),
            message_id: Some("urn:uuid:req".into()),
            reply_to: reply_to.map(str::to_string),
            ..MessageHeaders::default()
        }
    }

    fn reply() -> Message {
        Message::empty(MessageVersion::default(), "PingResponse")
    }

    #[test]
    fn reply_relates_to_request() {
        let mut reply = reply();
        correlate_reply(&mut reply, &request_headers(Some("mem://client")), false, false);
        let headers = reply.headers();
        assert_eq!(headers.relates_to.as_deref(), Some("urn:uuid:req"));
        assert!(headers.message_id.as_deref().unwrap().starts_with("urn:uuid:"));
        assert_eq!(headers.to.as_deref(), Some("mem://client"));
    }

    #[test]
    fn anonymous_and_session_replies_are_not_readdressed() {
        let mut anonymous = reply();
        correlate_reply(&mut anonymous, &request_headers(Some(ANONYMOUS_ADDRESS)), false, false);
        assert!(anonymous.headers().to.is_none());

        let mut session = reply();
        correlate_reply(&mut session, &request_headers(Some("mem://client")), true, false);
        assert!(session.headers().to.is_none());
        assert!(session.headers().relates_to.is_some());
    }

    #[test]
    fn manual_addressing_leaves_reply_alone() {
        let mut reply = reply();
        correlate_reply(&mut reply, &request_headers(Some("mem://client")), false, true);
        assert_eq!(reply.headers(), &MessageHeaders {
            action: Some("PingResponse".into()),
            ..MessageHeaders::default()
        });
    }
}
