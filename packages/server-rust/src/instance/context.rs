//! Instance context: one service instance plus its lifecycle state.
//!
//! State machine: Created -> Opened -> Closed. Opening is lazy and Closed is
//! terminal. Busy/idle is tracked separately by an RAII call counter so the
//! pipeline can tell whether a context still has calls in flight.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::dispatcher::contract::ServiceObject;
use crate::error::DispatchError;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

const DISPOSED: DispatchError = DispatchError::ObjectDisposed {
    what: "instance context",
};

/// Lifecycle state of an [`InstanceContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceContextState {
    Created,
    Opened,
    Closed,
}

/// A service instance together with where it came from.
pub struct HeldInstance {
    pub instance: ServiceObject,
    /// Created by a user `InstanceProvider`, which must get it back on release.
    pub from_provider: bool,
}

impl fmt::Debug for HeldInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeldInstance")
            .field("from_provider", &self.from_provider)
            .finish_non_exhaustive()
    }
}

struct Inner {
    state: InstanceContextState,
    held: Option<HeldInstance>,
}

/// Lifecycle wrapper around the object that executes operations.
///
/// Calls are admitted through a semaphore sized to the endpoint's concurrency
/// bound, so a context never runs more calls at once than configured.
pub struct InstanceContext {
    id: u64,
    session_id: Option<String>,
    inner: Mutex<Inner>,
    call_gate: Arc<Semaphore>,
    busy: Arc<AtomicUsize>,
}

impl InstanceContext {
    #[must_use]
    pub fn new(session_id: Option<String>, concurrency_bound: usize) -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            session_id,
            inner: Mutex::new(Inner {
                state: InstanceContextState::Created,
                held: None,
            }),
            call_gate: Arc::new(Semaphore::new(concurrency_bound.max(1))),
            busy: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Process-unique id, for logs.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    #[must_use]
    pub fn state(&self) -> InstanceContextState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == InstanceContextState::Closed
    }

    /// Move Created to Opened. Opening an open context is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::ObjectDisposed` if the context is closed.
    pub fn open(&self) -> Result<(), DispatchError> {
        let mut inner = self.inner.lock();
        match inner.state {
            InstanceContextState::Closed => Err(DISPOSED),
            InstanceContextState::Created => {
                inner.state = InstanceContextState::Opened;
                Ok(())
            }
            InstanceContextState::Opened => Ok(()),
        }
    }

    /// Current service instance, if one has been created.
    #[must_use]
    pub fn instance(&self) -> Option<ServiceObject> {
        self.inner
            .lock()
            .held
            .as_ref()
            .map(|held| Arc::clone(&held.instance))
    }

    /// Install `held` unless an instance is already present.
    ///
    /// Returns the instance to use plus any surplus the caller must release.
    ///
    /// # Errors
    ///
    /// Hands `held` back if the context is closed.
    pub(crate) fn install(
        &self,
        held: HeldInstance,
    ) -> Result<(ServiceObject, Option<HeldInstance>), HeldInstance> {
        let mut inner = self.inner.lock();
        if inner.state == InstanceContextState::Closed {
            return Err(held);
        }
        if let Some(existing) = &inner.held {
            return Ok((Arc::clone(&existing.instance), Some(held)));
        }
        let instance = Arc::clone(&held.instance);
        inner.held = Some(held);
        Ok((instance, None))
    }

    /// Detach the instance without closing the context.
    pub fn take_instance(&self) -> Option<HeldInstance> {
        self.inner.lock().held.take()
    }

    /// Wait for a call slot.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::ObjectDisposed` if the context closes first.
    pub async fn enter_call(&self) -> Result<CallGuard, DispatchError> {
        let permit = Arc::clone(&self.call_gate)
            .acquire_owned()
            .await
            .map_err(|_| DISPOSED)?;
        if self.is_closed() {
            return Err(DISPOSED);
        }
        self.busy.fetch_add(1, Ordering::AcqRel);
        Ok(CallGuard {
            _permit: permit,
            busy: Arc::clone(&self.busy),
        })
    }

    /// Whether any call currently holds a slot.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire) > 0
    }

    /// Close the context, returning its instance for release.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::ObjectDisposed` if it was already closed.
    pub fn close(&self) -> Result<Option<HeldInstance>, DispatchError> {
        let mut inner = self.inner.lock();
        if inner.state == InstanceContextState::Closed {
            return Err(DISPOSED);
        }
        inner.state = InstanceContextState::Closed;
        self.call_gate.close();
        Ok(inner.held.take())
    }
}

impl fmt::Debug for InstanceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceContext")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("state", &self.state())
            .field("busy", &self.busy.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// RAII call slot; marks the context busy until dropped, even on panic.
#[derive(Debug)]
pub struct CallGuard {
    _permit: OwnedSemaphorePermit,
    busy: Arc<AtomicUsize>,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.busy.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn held(value: u32) -> HeldInstance {
        HeldInstance {
            instance: Arc::new(value),
            from_provider: false,
        }
    }

    #[test]
    fn state_machine() {
        let cx = InstanceContext::new(None, 1);
        assert_eq!(cx.state(), InstanceContextState::Created);
        cx.open().unwrap();
        cx.open().unwrap();
        assert_eq!(cx.state(), InstanceContextState::Opened);

        assert!(cx.close().unwrap().is_none());
        assert!(cx.is_closed());
        assert!(matches!(cx.open(), Err(DispatchError::ObjectDisposed { .. })));
        assert!(matches!(cx.close(), Err(DispatchError::ObjectDisposed { .. })));
    }

    #[test]
    fn first_installed_instance_wins() {
        let cx = InstanceContext::new(Some("s1".into()), 1);
        let (first, surplus) = cx.install(held(1)).unwrap();
        assert!(surplus.is_none());
        let (second, surplus) = cx.install(held(2)).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(surplus.unwrap().instance.downcast_ref::<u32>(), Some(&2));

        let released = cx.close().unwrap().unwrap();
        assert_eq!(released.instance.downcast_ref::<u32>(), Some(&1));
        assert!(cx.install(held(3)).is_err());
    }

    #[tokio::test]
    async fn call_guard_tracks_busy() {
        let cx = InstanceContext::new(None, 2);
        assert!(!cx.is_busy());
        let a = cx.enter_call().await.unwrap();
        let b = cx.enter_call().await.unwrap();
        assert!(cx.is_busy());
        drop(a);
        assert!(cx.is_busy());
        drop(b);
        assert!(!cx.is_busy());
    }

    #[tokio::test]
    async fn concurrency_bound_serializes_calls() {
        let cx = Arc::new(InstanceContext::new(None, 1));
        let guard = cx.enter_call().await.unwrap();

        let waiter = {
            let cx = Arc::clone(&cx);
            tokio::spawn(async move { cx.enter_call().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn closing_releases_waiters_with_disposed() {
        let cx = Arc::new(InstanceContext::new(None, 1));
        let _guard = cx.enter_call().await.unwrap();
        let waiter = {
            let cx = Arc::clone(&cx);
            tokio::spawn(async move { cx.enter_call().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cx.close().unwrap();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(DispatchError::ObjectDisposed { .. })
        ));
    }
}
