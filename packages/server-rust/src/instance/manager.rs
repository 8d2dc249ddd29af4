//! Instance manager: the pipeline-facing side of instance management.

use std::fmt;
use std::sync::Arc;

use hostwire_core::Message;
use tracing::debug;

use super::context::{HeldInstance, InstanceContext};
use super::provider::{InstanceContextProvider, PerCallProvider, SessionProvider, SingletonProvider};
use super::{InstanceMode, InstanceProvider};
use crate::dispatcher::contract::ServiceObject;
use crate::dispatcher::operation::ReleaseInstanceMode;
use crate::dispatcher::runtime::{DispatchRuntime, InstanceFactory};
use crate::error::{ConfigError, DispatchError};

/// Resolves contexts, creates and releases service instances, and closes idle
/// contexts for one endpoint.
pub struct InstanceManager {
    endpoint: String,
    mode: InstanceMode,
    contexts: Arc<dyn InstanceContextProvider>,
    provider: Option<Arc<dyn InstanceProvider>>,
    factory: Option<InstanceFactory>,
    concurrency_bound: usize,
}

impl InstanceManager {
    /// Snapshot the instancing configuration of an endpoint's runtime.
    #[must_use]
    pub fn from_runtime(endpoint: impl Into<String>, runtime: &DispatchRuntime) -> Self {
        let mode = runtime.instance_mode();
        let contexts: Arc<dyn InstanceContextProvider> = match mode {
            InstanceMode::PerCall => Arc::new(PerCallProvider),
            InstanceMode::Single => Arc::new(SingletonProvider::default()),
            InstanceMode::PerSession => Arc::new(SessionProvider::default()),
        };
        Self {
            endpoint: endpoint.into(),
            mode,
            contexts,
            provider: runtime.instance_provider().cloned(),
            factory: runtime.instance_factory().cloned(),
            concurrency_bound: runtime.concurrency_bound(),
        }
    }

    #[must_use]
    pub fn mode(&self) -> InstanceMode {
        self.mode
    }

    #[must_use]
    pub fn context_provider(&self) -> &Arc<dyn InstanceContextProvider> {
        &self.contexts
    }

    /// # Errors
    ///
    /// Returns `ConfigError::MissingInstanceFactory` when neither a provider
    /// nor a factory is configured.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.provider.is_none() && self.factory.is_none() {
            return Err(ConfigError::MissingInstanceFactory {
                endpoint: self.endpoint.clone(),
            });
        }
        Ok(())
    }

    /// Existing context for the session, or a newly registered one.
    #[must_use]
    pub fn get_or_create_context(&self, session_id: Option<&str>) -> Arc<InstanceContext> {
        if let Some(existing) = self.contexts.get_existing(session_id) {
            return existing;
        }
        let fresh = Arc::new(InstanceContext::new(
            session_id.map(str::to_string),
            self.concurrency_bound,
        ));
        let context = self.contexts.initialize(fresh, session_id);
        debug!(
            endpoint = %self.endpoint,
            context_id = context.id(),
            session_id = ?session_id,
            "instance context resolved"
        );
        context
    }

    /// The context's instance, created through the provider or factory on first use.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::ObjectDisposed` if the context is closed, or the
    /// provider/factory error as `DispatchError::Internal`.
    pub fn get_or_create_service_instance(
        &self,
        context: &InstanceContext,
        message: Option<&Message>,
    ) -> Result<ServiceObject, DispatchError> {
        context.open()?;
        if let Some(instance) = context.instance() {
            return Ok(instance);
        }
        let held = match (&self.provider, &self.factory) {
            (Some(provider), _) => HeldInstance {
                instance: provider.get_instance(context, message)?,
                from_provider: true,
            },
            (None, Some(factory)) => HeldInstance {
                instance: factory()?,
                from_provider: false,
            },
            (None, None) => {
                return Err(ConfigError::MissingInstanceFactory {
                    endpoint: self.endpoint.clone(),
                }
                .into())
            }
        };
        match context.install(held) {
            Ok((instance, surplus)) => {
                if let Some(surplus) = surplus {
                    self.release_held(context, surplus);
                }
                Ok(instance)
            }
            Err(rejected) => {
                self.release_held(context, rejected);
                Err(DispatchError::ObjectDisposed {
                    what: "instance context",
                })
            }
        }
    }

    /// Release the context's instance, leaving the context open.
    pub fn release_instance(&self, context: &InstanceContext) {
        if let Some(held) = context.take_instance() {
            self.release_held(context, held);
        }
    }

    /// Release before or after the call, as the operation's mode asks.
    pub fn release_if_configured(
        &self,
        context: &InstanceContext,
        mode: ReleaseInstanceMode,
        before_call: bool,
    ) {
        let release = if before_call {
            mode.releases_before_call()
        } else {
            mode.releases_after_call()
        };
        if release {
            self.release_instance(context);
        }
    }

    /// Close `context` when nothing still needs it. Returns whether it closed.
    ///
    /// Closed and busy contexts are left alone, so repeated calls never
    /// release an instance twice.
    pub fn close_if_idle(&self, context: &InstanceContext) -> bool {
        if context.is_closed() || context.is_busy() || !self.contexts.is_idle(context) {
            return false;
        }
        let closed = self.close_context(context);
        if closed {
            self.contexts.notify_idle(context);
        }
        closed
    }

    /// Close a context unconditionally, releasing its instance.
    pub fn close_context(&self, context: &InstanceContext) -> bool {
        match context.close() {
            Ok(Some(held)) => {
                self.release_held(context, held);
                true
            }
            Ok(None) => true,
            Err(_) => false,
        }
    }

    /// The session's channel closed; close its context, if retained.
    pub fn session_closed(&self, session_id: Option<&str>) {
        if let Some(context) = self.contexts.session_closed(session_id) {
            self.close_context(&context);
        }
    }

    /// Close every retained context. Returns how many were closed.
    pub fn drain(&self) -> usize {
        self.contexts
            .drain()
            .iter()
            .filter(|cx| self.close_context(cx))
            .count()
    }

    fn release_held(&self, context: &InstanceContext, held: HeldInstance) {
        if held.from_provider {
            if let Some(provider) = &self.provider {
                provider.release_instance(context, held.instance);
            }
        }
    }
}

impl fmt::Debug for InstanceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceManager")
            .field("endpoint", &self.endpoint)
            .field("mode", &self.mode)
            .field("contexts", &self.contexts)
            .field("concurrency_bound", &self.concurrency_bound)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Provider that counts paired get/release calls.
    #[derive(Default)]
    pub(crate) struct CountingProvider {
        pub(crate) created: AtomicUsize,
        pub(crate) released: AtomicUsize,
    }

    impl InstanceProvider for CountingProvider {
        fn get_instance(
            &self,
            _context: &InstanceContext,
            _message: Option<&Message>,
        ) -> anyhow::Result<ServiceObject> {
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(n))
        }

        fn release_instance(&self, _context: &InstanceContext, _instance: ServiceObject) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn manager(mode: InstanceMode, provider: Option<Arc<CountingProvider>>) -> InstanceManager {
        let mut runtime = DispatchRuntime::new();
        runtime.set_instance_mode(mode);
        match provider {
            Some(provider) => runtime.set_instance_provider(provider),
            None => runtime.set_service_type::<String>(),
        }
        InstanceManager::from_runtime("Test@/svc", &runtime)
    }

    #[test]
    fn validate_requires_instance_source() {
        let bare = InstanceManager::from_runtime("Test@/svc", &DispatchRuntime::new());
        assert!(matches!(
            bare.validate(),
            Err(ConfigError::MissingInstanceFactory { .. })
        ));
        assert!(manager(InstanceMode::PerCall, None).validate().is_ok());
    }

    #[test]
    fn per_call_creates_fresh_contexts() {
        let manager = manager(InstanceMode::PerCall, None);
        let a = manager.get_or_create_context(None);
        let b = manager.get_or_create_context(None);
        assert!(!Arc::ptr_eq(&a, &b));

        let instance = manager.get_or_create_service_instance(&a, None).unwrap();
        assert!(instance.downcast_ref::<String>().is_some());
        assert!(manager.close_if_idle(&a));
    }

    #[test]
    fn session_mode_reuses_context_per_session() {
        let manager = manager(InstanceMode::PerSession, None);
        let first = manager.get_or_create_context(Some("s1"));
        let second = manager.get_or_create_context(Some("s1"));
        assert!(Arc::ptr_eq(&first, &second));

        let other = manager.get_or_create_context(Some("s2"));
        let absent = manager.get_or_create_context(None);
        assert!(!Arc::ptr_eq(&first, &other));
        assert!(!Arc::ptr_eq(&first, &absent));

        // Session affinity keeps the context open across calls.
        assert!(!manager.close_if_idle(&first));
        manager.session_closed(Some("s1"));
        assert!(first.is_closed());
        assert!(!Arc::ptr_eq(&manager.get_or_create_context(Some("s1")), &first));
    }

    #[test]
    fn provider_calls_are_paired() {
        let provider = Arc::new(CountingProvider::default());
        let manager = manager(InstanceMode::PerCall, Some(Arc::clone(&provider)));
        let cx = manager.get_or_create_context(None);

        let a = manager.get_or_create_service_instance(&cx, None).unwrap();
        let b = manager.get_or_create_service_instance(&cx, None).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(provider.created.load(Ordering::SeqCst), 1);

        manager.release_if_configured(&cx, ReleaseInstanceMode::AfterCall, true);
        assert_eq!(provider.released.load(Ordering::SeqCst), 0);
        manager.release_if_configured(&cx, ReleaseInstanceMode::AfterCall, false);
        assert_eq!(provider.released.load(Ordering::SeqCst), 1);

        manager.get_or_create_service_instance(&cx, None).unwrap();
        assert!(manager.close_if_idle(&cx));
        assert_eq!(provider.created.load(Ordering::SeqCst), 2);
        assert_eq!(provider.released.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn close_if_idle_is_idempotent() {
        let provider = Arc::new(CountingProvider::default());
        let manager = manager(InstanceMode::PerCall, Some(Arc::clone(&provider)));
        let cx = manager.get_or_create_context(None);
        manager.get_or_create_service_instance(&cx, None).unwrap();

        assert!(manager.close_if_idle(&cx));
        assert!(!manager.close_if_idle(&cx));
        assert!(!manager.close_if_idle(&cx));
        assert_eq!(provider.released.load(Ordering::SeqCst), 1);
        assert!(matches!(
            manager.get_or_create_service_instance(&cx, None),
            Err(DispatchError::ObjectDisposed { .. })
        ));
    }

    #[tokio::test]
    async fn busy_context_is_not_closed() {
        let manager = manager(InstanceMode::PerCall, None);
        let cx = manager.get_or_create_context(None);
        let guard = cx.enter_call().await.unwrap();
        assert!(!manager.close_if_idle(&cx));
        drop(guard);
        assert!(manager.close_if_idle(&cx));
    }

    #[test]
    fn singleton_survives_pipeline_and_drains_at_shutdown() {
        let provider = Arc::new(CountingProvider::default());
        let manager = manager(InstanceMode::Single, Some(Arc::clone(&provider)));
        let cx = manager.get_or_create_context(None);
        manager.get_or_create_service_instance(&cx, None).unwrap();
        assert!(!manager.close_if_idle(&cx));
        assert!(Arc::ptr_eq(&manager.get_or_create_context(Some("x")), &cx));

        assert_eq!(manager.drain(), 1);
        assert!(cx.is_closed());
        assert_eq!(provider.released.load(Ordering::SeqCst), 1);
    }
}
