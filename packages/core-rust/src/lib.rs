//! hostwire core: message model, filters, filter table, faults, and parameter formatting.

pub mod address;
pub mod fault;
pub mod filter;
pub mod filter_table;
pub mod formatter;
pub mod message;
pub mod parameters;
pub mod value;

pub use address::{AddressError, EndpointAddress, ANONYMOUS_ADDRESS, NONE_ADDRESS};
pub use fault::{ExceptionDetail, FaultBody, FaultCode, FaultDetail, FaultParty};
pub use filter::{
    same_filter, ActionMessageFilter, AndMessageFilter, EndpointAddressMessageFilter,
    MatchAllMessageFilter, MatchNoneMessageFilter, MessageFilter, WILDCARD_ACTION,
};
pub use filter_table::{FilterError, MessageFilterTable};
pub use formatter::{
    ClientFormatter, DispatchFormatter, FormatterError, MsgPackFormatter, RawMessageFormatter,
};
pub use message::{
    Message, MessageBuffer, MessageError, MessageHeaders, MessageState, MessageVersion,
};
pub use parameters::{ParameterDescription, ParameterDirection, ParameterMap};
pub use value::Value;
