//! Parameter formatters: convert between messages and positional parameters.
//!
//! Wire encoding is not the dispatch core's concern; [`MsgPackFormatter`] is
//! the default used when an operation does not supply its own formatter.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::message::{Message, MessageError, MessageVersion};
use crate::parameters::ParameterMap;
use crate::value::Value;

/// Errors raised while formatting parameters into or out of messages.
#[derive(Debug, thiserror::Error)]
pub enum FormatterError {
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error("expected {expected} parameters, got {actual}")]
    ParameterCount { expected: usize, actual: usize },
}

/// Server-side formatter: request message in, reply message out.
pub trait DispatchFormatter: Send + Sync {
    /// Fill `parameters` (sized to the operation's inputs) from the request body.
    ///
    /// # Errors
    ///
    /// Returns `FormatterError` if the body cannot be read or decoded.
    fn deserialize_request(
        &self,
        message: &mut Message,
        parameters: &mut [Value],
    ) -> Result<(), FormatterError>;

    /// Build the reply from the return value and output parameters.
    ///
    /// # Errors
    ///
    /// Returns `FormatterError` if the reply cannot be encoded.
    fn serialize_reply(
        &self,
        version: MessageVersion,
        action: Option<&str>,
        outputs: &[Value],
        result: Value,
    ) -> Result<Message, FormatterError>;
}

/// Client-side formatter: the mirror image of [`DispatchFormatter`].
pub trait ClientFormatter: Send + Sync {
    /// Build a request message from input parameters.
    ///
    /// # Errors
    ///
    /// Returns `FormatterError` if the request cannot be encoded.
    fn serialize_request(
        &self,
        version: MessageVersion,
        action: &str,
        inputs: &[Value],
    ) -> Result<Message, FormatterError>;

    /// Decode a reply, filling `outputs` and returning the result value.
    ///
    /// # Errors
    ///
    /// Returns `FormatterError` if the body cannot be read or decoded.
    fn deserialize_reply(
        &self,
        message: &mut Message,
        outputs: &mut [Value],
    ) -> Result<Value, FormatterError>;
}

// ---------------------------------------------------------------------------
// MsgPackFormatter
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
struct ReplyBody {
    result: Value,
    outputs: BTreeMap<String, Value>,
}

/// Encodes parameters as a named `MsgPack` map keyed by parameter name.
#[derive(Debug, Clone, Default)]
pub struct MsgPackFormatter {
    input_names: Vec<String>,
    output_names: Vec<String>,
}

impl MsgPackFormatter {
    #[must_use]
    pub fn new(map: &ParameterMap) -> Self {
        Self {
            input_names: map.input_names().map(str::to_string).collect(),
            output_names: map.output_names().map(str::to_string).collect(),
        }
    }

    fn check_len(expected: usize, actual: usize) -> Result<(), FormatterError> {
        if expected == actual {
            Ok(())
        } else {
            Err(FormatterError::ParameterCount { expected, actual })
        }
    }

    fn encode_named(names: &[String], values: &[Value]) -> BTreeMap<String, Value> {
        names.iter().cloned().zip(values.iter().cloned()).collect()
    }

    fn decode_named(names: &[String], mut body: BTreeMap<String, Value>, into: &mut [Value]) {
        for (slot, name) in into.iter_mut().zip(names) {
            *slot = body.remove(name).unwrap_or_default();
        }
    }
}

impl DispatchFormatter for MsgPackFormatter {
    fn deserialize_request(
        &self,
        message: &mut Message,
        parameters: &mut [Value],
    ) -> Result<(), FormatterError> {
        Self::check_len(self.input_names.len(), parameters.len())?;
        if message.is_empty() {
            message.read_body()?;
            parameters.iter_mut().for_each(|p| *p = Value::Null);
            return Ok(());
        }
        let body: BTreeMap<String, Value> = message.read_body_as()?;
        Self::decode_named(&self.input_names, body, parameters);
        Ok(())
    }

    fn serialize_reply(
        &self,
        version: MessageVersion,
        action: Option<&str>,
        outputs: &[Value],
        result: Value,
    ) -> Result<Message, FormatterError> {
        Self::check_len(self.output_names.len(), outputs.len())?;
        let body = ReplyBody {
            result,
            outputs: Self::encode_named(&self.output_names, outputs),
        };
        let mut message = Message::from_value(version, action.unwrap_or_default(), &body)?;
        if action.is_none() {
            message.headers_mut().action = None;
        }
        Ok(message)
    }
}

impl ClientFormatter for MsgPackFormatter {
    fn serialize_request(
        &self,
        version: MessageVersion,
        action: &str,
        inputs: &[Value],
    ) -> Result<Message, FormatterError> {
        Self::check_len(self.input_names.len(), inputs.len())?;
        let body = Self::encode_named(&self.input_names, inputs);
        Ok(Message::from_value(version, action, &body)?)
    }

    fn deserialize_reply(
        &self,
        message: &mut Message,
        outputs: &mut [Value],
    ) -> Result<Value, FormatterError> {
        Self::check_len(self.output_names.len(), outputs.len())?;
        let body: ReplyBody = message.read_body_as()?;
        Self::decode_named(&self.output_names, body.outputs, outputs);
        Ok(body.result)
    }
}

// ---------------------------------------------------------------------------
// RawMessageFormatter
// ---------------------------------------------------------------------------

/// Pass-through formatter for catch-all (`"*"`) operations.
///
/// Inputs are `[action, body]` as `[Value::String | Value::Null, Value::Bytes]`.
/// A `Value::Bytes` result becomes the raw reply body; anything else is
/// encoded as `MsgPack`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawMessageFormatter;

impl DispatchFormatter for RawMessageFormatter {
    fn deserialize_request(
        &self,
        message: &mut Message,
        parameters: &mut [Value],
    ) -> Result<(), FormatterError> {
        MsgPackFormatter::check_len(2, parameters.len())?;
        parameters[0] = message.action().map_or(Value::Null, Value::from);
        parameters[1] = Value::Bytes(message.read_body()?.to_vec());
        Ok(())
    }

    fn serialize_reply(
        &self,
        version: MessageVersion,
        action: Option<&str>,
        _outputs: &[Value],
        result: Value,
    ) -> Result<Message, FormatterError> {
        let mut message = match result {
            Value::Bytes(raw) => Message::new(version, "", Bytes::from(raw)),
            other => Message::from_value(version, "", &other)?,
        };
        message.headers_mut().action = action.map(str::to_string);
        Ok(message)
    }
}
