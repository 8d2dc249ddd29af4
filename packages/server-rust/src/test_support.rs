//! Calculator service shared by the dispatcher and pipeline tests.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use hostwire_core::{
    ClientFormatter, Message, MessageHeaders, MessageVersion, MsgPackFormatter,
    ParameterDescription, ParameterMap, Value,
};

use crate::dispatcher::contract::{
    ContractDescription, FaultDescription, OperationDescription, ServiceMethod,
};
use crate::dispatcher::endpoint::EndpointDispatcher;
use crate::error::{FaultException, ServiceError};

pub(crate) const ADDRESS: &str = "mem://host/calc";
pub(crate) const NAMESPACE: &str = "urn:calc";
pub(crate) const DIVIDE_BY_ZERO_ACTION: &str = "urn:calc/Divide/DivideByZeroFault";

#[derive(Debug, Default)]
pub(crate) struct Calculator {
    total: AtomicI64,
}

fn int(args: &[Value], index: usize) -> Result<i64, ServiceError> {
    args.get(index)
        .and_then(Value::as_int)
        .ok_or_else(|| anyhow::anyhow!("argument {index} is not an integer").into())
}

fn inputs(names: &[&str]) -> Vec<ParameterDescription> {
    names.iter().map(|n| ParameterDescription::input(*n)).collect()
}

/// - `Add(a, b)`: sync sum
/// - `Divide(a, b)`: typed `DivideByZero` fault on `b == 0`
/// - `Accumulate(n)`: running total kept on the instance
/// - `Wait(ms)`: async sleep, returns `ms`
/// - `Log(text)`: one-way
/// - `Explode()`: panics
/// - `End()`: terminates the session
pub(crate) fn calculator_contract() -> ContractDescription {
    ContractDescription::new("Calculator", NAMESPACE)
        .with_operation(
            OperationDescription::new(
                "Add",
                "urn:calc/Add",
                ServiceMethod::sync(|_: &Calculator, args: &mut [Value]| {
                    Ok(Value::Int(int(args, 0)? + int(args, 1)?))
                }),
            )
            .with_parameters(inputs(&["a", "b"])),
        )
        .with_operation(
            OperationDescription::new(
                "Divide",
                "urn:calc/Divide",
                ServiceMethod::sync(|_: &Calculator, args: &mut [Value]| {
                    let divisor = int(args, 1)?;
                    if divisor == 0 {
                        return Err(FaultException::new(
                            "DivideByZero",
                            int(args, 0)?,
                            "division by zero",
                        )
                        .into());
                    }
                    Ok(Value::Int(int(args, 0)? / divisor))
                }),
            )
            .with_parameters(inputs(&["a", "b"]))
            .with_fault(FaultDescription::new("DivideByZero", DIVIDE_BY_ZERO_ACTION)),
        )
        .with_operation(
            OperationDescription::new(
                "Accumulate",
                "urn:calc/Accumulate",
                ServiceMethod::sync(|calc: &Calculator, args: &mut [Value]| {
                    let n = int(args, 0)?;
                    Ok(Value::Int(calc.total.fetch_add(n, Ordering::SeqCst) + n))
                }),
            )
            .with_parameters(inputs(&["n"])),
        )
        .with_operation(
            OperationDescription::new(
                "Wait",
                "urn:calc/Wait",
                ServiceMethod::asynchronous(|_: std::sync::Arc<Calculator>, args: Vec<Value>| async move {
                    let ms = int(&args, 0)?;
                    tokio::time::sleep(Duration::from_millis(ms.unsigned_abs())).await;
                    Ok::<_, ServiceError>((Value::Int(ms), args))
                }),
            )
            .with_parameters(inputs(&["ms"])),
        )
        .with_operation(
            OperationDescription::new(
                "Log",
                "urn:calc/Log",
                ServiceMethod::sync(|_: &Calculator, args: &mut [Value]| {
                    if args.first().and_then(Value::as_str) == Some("fail") {
                        return Err(anyhow::anyhow!("log sink unavailable").into());
                    }
                    Ok(Value::Null)
                }),
            )
            .with_parameters(inputs(&["text"]))
            .one_way(),
        )
        .with_operation(OperationDescription::new(
            "Explode",
            "urn:calc/Explode",
            ServiceMethod::sync(|_: &Calculator, _: &mut [Value]| -> Result<Value, ServiceError> {
                panic!("calculator exploded")
            }),
        ))
        .with_operation(
            OperationDescription::new(
                "End",
                "urn:calc/End",
                ServiceMethod::sync(|_: &Calculator, _: &mut [Value]| Ok(Value::Null)),
            )
            .terminating(),
        )
}

/// Calculator endpoint with a `Calculator::default()` instance factory.
pub(crate) fn calculator_endpoint() -> EndpointDispatcher {
    let mut endpoint = EndpointDispatcher::new(ADDRESS, "Calculator", NAMESPACE).unwrap();
    endpoint.runtime_mut().set_service_type::<Calculator>();
    endpoint
        .initialize_from_contract(&calculator_contract())
        .unwrap();
    endpoint
}

/// Encode a request the way a client proxy would.
pub(crate) fn request(action: &str, names: &[&str], values: Vec<Value>) -> Message {
    let map = ParameterMap::new(&inputs(names));
    MsgPackFormatter::new(&map)
        .serialize_request(MessageVersion::default(), action, &values)
        .unwrap()
        .with_message_id(MessageHeaders::new_message_id())
}

pub(crate) fn add_request(a: i64, b: i64) -> Message {
    request("urn:calc/Add", &["a", "b"], vec![Value::Int(a), Value::Int(b)])
}

pub(crate) fn divide_request(a: i64, b: i64) -> Message {
    request("urn:calc/Divide", &["a", "b"], vec![Value::Int(a), Value::Int(b)])
}

pub(crate) fn accumulate_request(n: i64) -> Message {
    request("urn:calc/Accumulate", &["n"], vec![Value::Int(n)])
}

pub(crate) fn wait_request(ms: i64) -> Message {
    request("urn:calc/Wait", &["ms"], vec![Value::Int(ms)])
}

pub(crate) fn log_request(text: &str) -> Message {
    request("urn:calc/Log", &["text"], vec![Value::from(text)])
}

pub(crate) fn bare_request(action: &str) -> Message {
    Message::empty(MessageVersion::default(), action)
}

/// Decode the return value of a calculator reply.
pub(crate) fn reply_result(reply: &mut Message) -> Value {
    MsgPackFormatter::new(&ParameterMap::default())
        .deserialize_reply(reply, &mut [])
        .unwrap()
}
