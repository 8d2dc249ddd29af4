//! Instance management: the lifecycle of the object that executes operations.
//!
//! An [`InstanceContext`] wraps at most one service instance. Which context a
//! message lands on is decided by an [`InstanceContextProvider`] selected from
//! the endpoint's [`InstanceMode`]; the [`InstanceManager`] ties providers,
//! factories and release policy together for the pipeline.

pub mod context;
pub mod manager;
pub mod provider;

pub use context::{CallGuard, HeldInstance, InstanceContext, InstanceContextState};
pub use manager::InstanceManager;
pub use provider::{InstanceContextProvider, PerCallProvider, SessionProvider, SingletonProvider};

use hostwire_core::Message;

use crate::dispatcher::contract::ServiceObject;

/// How instance contexts are shared between messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstanceMode {
    /// Fresh context and instance for every message.
    #[default]
    PerCall,
    /// One context for the whole endpoint, never closed by the pipeline.
    Single,
    /// One context per session id; messages without a session share the `""` key.
    PerSession,
}

/// User-supplied instance source.
///
/// Owns creation and release policy: every instance returned by
/// [`get_instance`](Self::get_instance) is handed back to
/// [`release_instance`](Self::release_instance) exactly once.
pub trait InstanceProvider: Send + Sync {
    /// # Errors
    ///
    /// Any error aborts the request and flows through the error chain.
    fn get_instance(
        &self,
        context: &InstanceContext,
        message: Option<&Message>,
    ) -> anyhow::Result<ServiceObject>;

    fn release_instance(&self, context: &InstanceContext, instance: ServiceObject);
}
