//! Instance-context providers: decide which context a message runs on.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use super::context::InstanceContext;

/// Strategy for sharing instance contexts between messages.
pub trait InstanceContextProvider: Send + Sync + fmt::Debug {
    /// Context already associated with `session_id`, if any.
    fn get_existing(&self, session_id: Option<&str>) -> Option<Arc<InstanceContext>>;

    /// Associate a freshly created context and return the one to use. When a
    /// concurrent caller registered first, the earlier context wins.
    fn initialize(
        &self,
        context: Arc<InstanceContext>,
        session_id: Option<&str>,
    ) -> Arc<InstanceContext>;

    /// Whether the pipeline may close `context` once its calls finish.
    fn is_idle(&self, context: &InstanceContext) -> bool;

    /// `context` was closed by the pipeline; forget it.
    fn notify_idle(&self, context: &InstanceContext);

    /// The session's channel closed; detach and return its context.
    fn session_closed(&self, _session_id: Option<&str>) -> Option<Arc<InstanceContext>> {
        None
    }

    /// Dispatcher shutdown; detach and return every retained context.
    fn drain(&self) -> Vec<Arc<InstanceContext>> {
        Vec::new()
    }
}

// ---------------------------------------------------------------------------
// PerCallProvider
// ---------------------------------------------------------------------------

/// Never reuses a context: every message gets a fresh one.
#[derive(Debug, Default)]
pub struct PerCallProvider;

impl InstanceContextProvider for PerCallProvider {
    fn get_existing(&self, _session_id: Option<&str>) -> Option<Arc<InstanceContext>> {
        None
    }

    fn initialize(
        &self,
        context: Arc<InstanceContext>,
        _session_id: Option<&str>,
    ) -> Arc<InstanceContext> {
        context
    }

    fn is_idle(&self, _context: &InstanceContext) -> bool {
        true
    }

    fn notify_idle(&self, _context: &InstanceContext) {}
}

// ---------------------------------------------------------------------------
// SingletonProvider
// ---------------------------------------------------------------------------

/// One endpoint-wide context, created on first use and kept until shutdown.
#[derive(Debug, Default)]
pub struct SingletonProvider {
    context: Mutex<Option<Arc<InstanceContext>>>,
}

impl InstanceContextProvider for SingletonProvider {
    fn get_existing(&self, _session_id: Option<&str>) -> Option<Arc<InstanceContext>> {
        self.context
            .lock()
            .as_ref()
            .filter(|cx| !cx.is_closed())
            .cloned()
    }

    fn initialize(
        &self,
        context: Arc<InstanceContext>,
        _session_id: Option<&str>,
    ) -> Arc<InstanceContext> {
        let mut slot = self.context.lock();
        match slot.as_ref() {
            Some(existing) if !existing.is_closed() => Arc::clone(existing),
            _ => {
                *slot = Some(Arc::clone(&context));
                context
            }
        }
    }

    fn is_idle(&self, _context: &InstanceContext) -> bool {
        false
    }

    fn notify_idle(&self, _context: &InstanceContext) {}

    fn drain(&self) -> Vec<Arc<InstanceContext>> {
        self.context.lock().take().into_iter().collect()
    }
}

// ---------------------------------------------------------------------------
// SessionProvider
// ---------------------------------------------------------------------------

/// One context per session id. A missing session id maps to the `""` key.
#[derive(Debug, Default)]
pub struct SessionProvider {
    contexts: DashMap<String, Arc<InstanceContext>>,
}

impl SessionProvider {
    fn key(session_id: Option<&str>) -> String {
        session_id.unwrap_or_default().to_string()
    }

    /// Number of sessions with a live context.
    #[must_use]
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

impl InstanceContextProvider for SessionProvider {
    fn get_existing(&self, session_id: Option<&str>) -> Option<Arc<InstanceContext>> {
        self.contexts
            .get(&Self::key(session_id))
            .map(|entry| Arc::clone(entry.value()))
            .filter(|cx| !cx.is_closed())
    }

    fn initialize(
        &self,
        context: Arc<InstanceContext>,
        session_id: Option<&str>,
    ) -> Arc<InstanceContext> {
        let mut entry = self
            .contexts
            .entry(Self::key(session_id))
            .or_insert_with(|| Arc::clone(&context));
        if entry.is_closed() {
            *entry = Arc::clone(&context);
        }
        Arc::clone(entry.value())
    }

    /// Idle only once the session no longer maps to this context.
    fn is_idle(&self, context: &InstanceContext) -> bool {
        !self
            .contexts
            .get(&Self::key(context.session_id()))
            .is_some_and(|entry| std::ptr::eq(entry.value().as_ref(), context))
    }

    fn notify_idle(&self, context: &InstanceContext) {
        self.contexts
            .remove_if(&Self::key(context.session_id()), |_, cx| {
                std::ptr::eq(cx.as_ref(), context)
            });
    }

    fn session_closed(&self, session_id: Option<&str>) -> Option<Arc<InstanceContext>> {
        self.contexts
            .remove(&Self::key(session_id))
            .map(|(_, cx)| cx)
    }

    fn drain(&self) -> Vec<Arc<InstanceContext>> {
        let keys: Vec<String> = self.contexts.iter().map(|e| e.key().clone()).collect();
        keys.into_iter()
            .filter_map(|key| self.contexts.remove(&key).map(|(_, cx)| cx))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(session: Option<&str>) -> Arc<InstanceContext> {
        Arc::new(InstanceContext::new(session.map(str::to_string), 1))
    }

    #[test]
    fn per_call_never_reuses() {
        let provider = PerCallProvider;
        let cx = provider.initialize(fresh(None), None);
        assert!(provider.get_existing(None).is_none());
        assert!(provider.is_idle(&cx));
    }

    #[test]
    fn singleton_keeps_first_context() {
        let provider = SingletonProvider::default();
        let first = provider.initialize(fresh(None), None);
        let second = provider.initialize(fresh(Some("other")), Some("other"));
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&provider.get_existing(Some("x")).unwrap(), &first));
        assert!(!provider.is_idle(&first));

        let drained = provider.drain();
        assert_eq!(drained.len(), 1);
        assert!(provider.get_existing(None).is_none());
    }

    #[test]
    fn session_contexts_are_keyed_by_session() {
        let provider = SessionProvider::default();
        let a = provider.initialize(fresh(Some("a")), Some("a"));
        let again = provider.get_existing(Some("a")).unwrap();
        assert!(Arc::ptr_eq(&a, &again));

        let b = provider.initialize(fresh(Some("b")), Some("b"));
        assert!(!Arc::ptr_eq(&a, &b));

        let anonymous = provider.initialize(fresh(None), None);
        assert!(!Arc::ptr_eq(&anonymous, &a));
        assert!(Arc::ptr_eq(&provider.get_existing(Some("")).unwrap(), &anonymous));
        assert_eq!(provider.len(), 3);
    }

    #[test]
    fn session_context_is_idle_only_after_session_ends() {
        let provider = SessionProvider::default();
        let cx = provider.initialize(fresh(Some("s")), Some("s"));
        assert!(!provider.is_idle(&cx));

        let closed = provider.session_closed(Some("s")).unwrap();
        assert!(Arc::ptr_eq(&closed, &cx));
        assert!(provider.is_idle(&cx));
        assert!(provider.is_empty());
    }

    #[test]
    fn closed_session_context_is_replaced() {
        let provider = SessionProvider::default();
        let old = provider.initialize(fresh(Some("s")), Some("s"));
        old.close().unwrap();
        assert!(provider.get_existing(Some("s")).is_none());

        let new = provider.initialize(fresh(Some("s")), Some("s"));
        assert!(!Arc::ptr_eq(&old, &new));

        provider.notify_idle(&old);
        assert!(provider.get_existing(Some("s")).is_some());
        provider.notify_idle(&new);
        assert!(provider.is_empty());
    }
}
