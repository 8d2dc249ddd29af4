//! Tower middleware around operation invocation.
//!
//! - [`invoke`]: Leaf service that calls the operation's invoker
//! - [`timeout`]: Per-call operation timeout enforcement
//! - [`metrics`]: Call timing and outcome via `tracing` spans
//! - [`stack`]: Composes the layers into the invocation stack

pub mod invoke;
pub mod metrics;
pub mod stack;
pub mod timeout;

pub use invoke::{Invocation, InvokeService};
pub use metrics::MetricsLayer;
pub use stack::{build_invocation_stack, InvocationStack};
pub use timeout::TimeoutLayer;
