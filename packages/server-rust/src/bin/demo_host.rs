//! Demo host: serves a per-session counter over the in-memory transport and
//! drives a handful of client sessions through it.
//!
//! Usage: demo-host [--sessions <n>] [--calls <n>] [--json]

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use clap::Parser;
use hostwire_core::{
    ClientFormatter, Message, MessageHeaders, MessageVersion, MsgPackFormatter,
    ParameterDescription, ParameterMap, Value,
};
use hostwire_server::channel::{ChannelShape, MemoryConnector};
use hostwire_server::{
    ChannelDispatcher, ContractDescription, DispatchError, DispatcherConfig, EndpointDispatcher,
    ErrorHandler, ErrorHandling, FaultException, InstanceMode, MemoryListener,
    OperationDescription, ServiceError, ServiceMethod,
};
use hostwire_server::dispatcher::FaultDescription;
use serde_json::json;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const ADDRESS: &str = "mem://localhost/counter";
const NAMESPACE: &str = "urn:hostwire:demo";
const UNDERFLOW_ACTION: &str = "urn:hostwire:demo/Take/UnderflowFault";

#[derive(Parser, Debug)]
#[command(name = "demo-host")]
#[command(about = "Runs a counter service on an in-memory channel dispatcher")]
struct Args {
    /// Number of concurrent client sessions.
    #[arg(long, env = "HOSTWIRE_DEMO_SESSIONS", default_value = "4")]
    sessions: usize,

    /// Increment calls made by each session.
    #[arg(long, env = "HOSTWIRE_DEMO_CALLS", default_value = "5")]
    calls: i64,

    /// Cap on simultaneously open sessions.
    #[arg(long, env = "HOSTWIRE_MAX_SESSIONS", default_value = "100")]
    max_sessions: usize,

    /// Put error text into faults sent to clients.
    #[arg(long)]
    exception_detail: bool,

    /// Log as JSON lines instead of the compact format.
    #[arg(long, env = "HOSTWIRE_LOG_JSON")]
    json: bool,

    /// Default log filter when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_tracing(args: &Args) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .compact()
            .init();
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Counter {
    total: AtomicI64,
}

fn int_arg(args: &[Value], index: usize) -> Result<i64, ServiceError> {
    args.get(index)
        .and_then(Value::as_int)
        .ok_or_else(|| anyhow::anyhow!("argument {index} is not an integer").into())
}

fn params(names: &[&str]) -> Vec<ParameterDescription> {
    names.iter().map(|n| ParameterDescription::input(*n)).collect()
}

fn counter_contract() -> ContractDescription {
    ContractDescription::new("Counter", NAMESPACE)
        .with_operation(
            OperationDescription::new(
                "Increment",
                "urn:hostwire:demo/Increment",
                ServiceMethod::sync(|counter: &Counter, args: &mut [Value]| {
                    let n = int_arg(args, 0)?;
                    Ok(Value::Int(counter.total.fetch_add(n, Ordering::SeqCst) + n))
                }),
            )
            .with_parameters(params(&["n"])),
        )
        .with_operation(
            OperationDescription::new(
                "Take",
                "urn:hostwire:demo/Take",
                ServiceMethod::sync(|counter: &Counter, args: &mut [Value]| {
                    let n = int_arg(args, 0)?;
                    let total = counter.total.load(Ordering::SeqCst);
                    if n > total {
                        return Err(
                            FaultException::new("Underflow", total, "not enough counted").into()
                        );
                    }
                    Ok(Value::Int(counter.total.fetch_sub(n, Ordering::SeqCst) - n))
                }),
            )
            .with_parameters(params(&["n"]))
            .with_fault(FaultDescription::new("Underflow", UNDERFLOW_ACTION)),
        )
        .with_operation(
            OperationDescription::new(
                "Delay",
                "urn:hostwire:demo/Delay",
                ServiceMethod::asynchronous(|counter: Arc<Counter>, args: Vec<Value>| async move {
                    let ms = int_arg(&args, 0)?;
                    tokio::time::sleep(Duration::from_millis(ms.unsigned_abs())).await;
                    Ok::<_, ServiceError>((Value::Int(counter.total.load(Ordering::SeqCst)), args))
                }),
            )
            .with_parameters(params(&["ms"])),
        )
        .with_operation(
            OperationDescription::new(
                "Note",
                "urn:hostwire:demo/Note",
                ServiceMethod::sync(|_: &Counter, args: &mut [Value]| {
                    info!(text = ?args.first(), "note received");
                    Ok(Value::Null)
                }),
            )
            .with_parameters(params(&["text"]))
            .one_way(),
        )
        .with_operation(
            OperationDescription::new(
                "Finish",
                "urn:hostwire:demo/Finish",
                ServiceMethod::sync(|counter: &Counter, _: &mut [Value]| {
                    Ok(Value::Int(counter.total.load(Ordering::SeqCst)))
                }),
            )
            .terminating(),
        )
}

#[derive(Debug, Default)]
struct Summary {
    completed: usize,
    failed: usize,
    counted: i64,
}

/// Logs every failed request and leaves fault generation to the dispatcher.
struct LogErrors;

impl ErrorHandler for LogErrors {
    fn handle_error(&self, error: &DispatchError) -> ErrorHandling {
        warn!(error = %error, "request failed");
        ErrorHandling::Unhandled
    }
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

fn encode(action: &str, names: &[&str], values: &[Value]) -> anyhow::Result<Message> {
    let message = MsgPackFormatter::new(&ParameterMap::new(&params(names)))
        .serialize_request(MessageVersion::default(), action, values)?
        .with_to(ADDRESS)
        .with_message_id(MessageHeaders::new_message_id());
    Ok(message)
}

fn decode(mut reply: Message) -> anyhow::Result<Value> {
    if reply.is_fault() {
        let fault = reply.read_fault()?;
        anyhow::bail!("fault {}: {}", fault.code.name, fault.reason);
    }
    Ok(MsgPackFormatter::new(&ParameterMap::default()).deserialize_reply(&mut reply, &mut [])?)
}

async fn run_session(connector: MemoryConnector, index: usize, calls: i64) -> anyhow::Result<i64> {
    let session = format!("session-{index}");
    let client = connector.connect(ChannelShape::Reply, Some(&session))?;

    for n in 1..=calls {
        let reply = client
            .request(encode("urn:hostwire:demo/Increment", &["n"], &[Value::Int(n)])?)
            .await?
            .context("increment produced no reply")?;
        let total = decode(reply)?;
        info!(session = %session, running_total = ?total, "incremented");
    }

    // Asking for more than was counted comes back as the declared fault.
    let mut refused = client
        .request(encode("urn:hostwire:demo/Take", &["n"], &[Value::Int(i64::MAX)])?)
        .await?
        .context("take produced no reply")?;
    anyhow::ensure!(
        refused.action() == Some(UNDERFLOW_ACTION),
        "expected an underflow fault"
    );
    let fault = refused.read_fault()?;
    info!(session = %session, reason = %fault.reason, detail = ?fault.detail, "take refused");

    // One-way: the dispatcher completes the request without a reply.
    let ack = client
        .request(encode("urn:hostwire:demo/Note", &["text"], &[Value::from("halfway")])?)
        .await?;
    anyhow::ensure!(ack.is_none(), "one-way note was answered");

    client
        .request(encode("urn:hostwire:demo/Delay", &["ms"], &[Value::Int(10)])?)
        .await?
        .context("delay produced no reply")?;

    let reply = client
        .request(encode("urn:hostwire:demo/Finish", &[], &[])?)
        .await?
        .context("finish produced no reply")?;
    decode(reply)?
        .as_int()
        .context("finish returned a non-integer total")
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    let listener = Arc::new(MemoryListener::new(ADDRESS));
    let connector = listener.connector();
    let config = DispatcherConfig {
        max_concurrent_sessions: args.max_sessions,
        include_exception_detail_in_faults: args.exception_detail,
        ..DispatcherConfig::default()
    };
    let dispatcher = ChannelDispatcher::new(listener, config);

    let mut endpoint = EndpointDispatcher::new(ADDRESS, "Counter", NAMESPACE)?;
    endpoint.use_address_filter();
    endpoint
        .runtime_mut()
        .set_instance_mode(InstanceMode::PerSession);
    endpoint.runtime_mut().set_service_type::<Counter>();
    endpoint.initialize_from_contract(&counter_contract())?;
    dispatcher.add_endpoint(endpoint)?;
    dispatcher.add_error_handler(Arc::new(LogErrors))?;
    dispatcher.open().await?;

    let mut sessions = JoinSet::new();
    for index in 0..args.sessions {
        sessions.spawn(run_session(connector.clone(), index, args.calls));
    }

    let started = Instant::now();
    let drive = async {
        let mut summary = Summary::default();
        while let Some(joined) = sessions.join_next().await {
            match joined {
                Ok(Ok(total)) => {
                    info!(total, "session finished");
                    summary.completed += 1;
                    summary.counted += total;
                }
                Ok(Err(err)) => {
                    summary.failed += 1;
                    error!(error = %err, "session failed");
                }
                Err(err) => {
                    summary.failed += 1;
                    error!(error = %err, "session task panicked");
                }
            }
        }
        summary
    };

    let summary = tokio::select! {
        summary = drive => summary,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            info!("interrupted, shutting down");
            Summary::default()
        }
    };

    dispatcher.close().await?;
    println!(
        "{}",
        json!({
            "sessions": args.sessions,
            "completed": summary.completed,
            "failed": summary.failed,
            "counted": summary.counted,
            "elapsed_ms": u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        })
    );
    let failures = summary.failed;
    anyhow::ensure!(failures == 0, "{failures} session(s) failed");
    Ok(())
}
