//! Channels, listeners, and the dispatcher that pumps them.
//!
//! - [`transport`]: Listener, channel, and request-context traits
//! - [`memory`]: In-process transport for hosting and tests
//! - [`registry`]: Live-channel bookkeeping
//! - [`lifecycle`]: Dispatcher state machine and in-flight tracking
//! - [`host`]: Hooks exposed by the owning service host
//! - [`dispatcher`]: Accept loop, endpoint routing, and request entry points

pub mod dispatcher;
pub mod host;
pub mod lifecycle;
pub mod memory;
pub mod registry;
pub mod transport;

pub use dispatcher::ChannelDispatcher;
pub use host::ServiceHost;
pub use lifecycle::{DispatcherState, InFlightGuard, LifecycleController};
pub use memory::{
    ChannelStats, MemoryChannel, MemoryClient, MemoryConnector, MemoryListener,
    MemoryRequestContext,
};
pub use registry::{ChannelHandle, ChannelId, ChannelRegistry};
pub use transport::{Channel, ChannelListener, ChannelShape, CommunicationState, RequestContext};
