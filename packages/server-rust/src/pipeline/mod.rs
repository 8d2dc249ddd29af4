//! Request processing pipeline.
//!
//! - [`context`]: Per-request state threaded through the stages
//! - [`stage`]: Stage trait and ordered chains
//! - [`stages`]: Built-in stages of the initialize/process/error/finalize chains
//! - [`processor`]: Per-endpoint driver that runs the chains

pub mod context;
pub mod processor;
pub mod stage;
pub mod stages;

pub use context::{ProcessingContext, ReplyTarget};
pub use processor::RequestProcessor;
pub use stage::{Stage, StageChain};
pub use stages::StageEnv;
