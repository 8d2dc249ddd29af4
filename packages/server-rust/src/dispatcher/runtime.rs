//! Dispatch runtime: an endpoint's operation table plus its instancing and
//! inspection extensions.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use hostwire_core::{Message, WILDCARD_ACTION};

use super::contract::ServiceObject;
use super::operation::{CorrelationState, DispatchOperation};
use crate::error::ConfigError;
use crate::instance::{InstanceMode, InstanceProvider};

/// Creates a fresh service instance; the "default constructor" of a service type.
pub type InstanceFactory = Arc<dyn Fn() -> anyhow::Result<ServiceObject> + Send + Sync>;

/// Chooses the target operation by name instead of by action.
pub trait OperationSelector: Send + Sync {
    /// Name of the operation to run, or `None` to fall back to the catch-all.
    fn select_operation(&self, message: &Message) -> Option<String>;
}

/// Observes and may rewrite requests and replies.
pub trait MessageInspector: Send + Sync {
    fn after_receive_request(&self, request: &mut Message) -> CorrelationState;

    fn before_send_reply(&self, reply: &mut Message, correlation: CorrelationState);
}

// ---------------------------------------------------------------------------
// DispatchRuntime
// ---------------------------------------------------------------------------

/// Operation table keyed by unique name and unique action, with `"*"` held
/// separately as the unhandled-message operation.
pub struct DispatchRuntime {
    operations: HashMap<String, Arc<DispatchOperation>>,
    actions: HashMap<String, String>,
    unhandled: Option<Arc<DispatchOperation>>,
    operation_selector: Option<Arc<dyn OperationSelector>>,
    message_inspectors: Vec<Arc<dyn MessageInspector>>,
    instance_mode: InstanceMode,
    instance_provider: Option<Arc<dyn InstanceProvider>>,
    instance_factory: Option<InstanceFactory>,
    concurrency_bound: usize,
}

impl DispatchRuntime {
    #[must_use]
    pub fn new() -> Self {
        Self {
            operations: HashMap::new(),
            actions: HashMap::new(),
            unhandled: None,
            operation_selector: None,
            message_inspectors: Vec::new(),
            instance_mode: InstanceMode::default(),
            instance_provider: None,
            instance_factory: None,
            concurrency_bound: 1,
        }
    }

    /// Register an operation.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::DuplicateOperation` if the name is taken and
    /// `ConfigError::DuplicateAction` if another operation owns the action.
    pub fn add_operation(&mut self, operation: DispatchOperation) -> Result<(), ConfigError> {
        let name = operation.name().to_string();
        if self.operations.contains_key(&name) || self.unhandled_named(&name) {
            return Err(ConfigError::DuplicateOperation { name });
        }
        let action = operation.action().to_string();
        if action == WILDCARD_ACTION {
            if let Some(existing) = &self.unhandled {
                return Err(ConfigError::DuplicateAction {
                    action,
                    existing: existing.name().to_string(),
                });
            }
            self.unhandled = Some(Arc::new(operation));
            return Ok(());
        }
        if let Some(existing) = self.actions.get(&action) {
            return Err(ConfigError::DuplicateAction {
                action,
                existing: existing.clone(),
            });
        }
        self.actions.insert(action, name.clone());
        self.operations.insert(name, Arc::new(operation));
        Ok(())
    }

    fn unhandled_named(&self, name: &str) -> bool {
        self.unhandled.as_ref().is_some_and(|op| op.name() == name)
    }

    #[must_use]
    pub fn has_operation(&self, name: &str) -> bool {
        self.operations.contains_key(name) || self.unhandled_named(name)
    }

    #[must_use]
    pub fn operation(&self, name: &str) -> Option<&Arc<DispatchOperation>> {
        self.operations
            .get(name)
            .or_else(|| self.unhandled.as_ref().filter(|op| op.name() == name))
    }

    #[must_use]
    pub fn operation_for_action(&self, action: &str) -> Option<&Arc<DispatchOperation>> {
        self.actions
            .get(action)
            .and_then(|name| self.operations.get(name))
    }

    #[must_use]
    pub fn unhandled_operation(&self) -> Option<&Arc<DispatchOperation>> {
        self.unhandled.as_ref()
    }

    /// Number of operations, the catch-all included.
    #[must_use]
    pub fn operation_count(&self) -> usize {
        self.operations.len() + usize::from(self.unhandled.is_some())
    }

    /// Resolve the target operation: selector if present, else exact action,
    /// else the `"*"` operation.
    #[must_use]
    pub fn select_operation(&self, message: &Message) -> Option<Arc<DispatchOperation>> {
        let selected = match &self.operation_selector {
            Some(selector) => selector
                .select_operation(message)
                .and_then(|name| self.operations.get(&name)),
            None => message
                .action()
                .and_then(|action| self.operation_for_action(action)),
        };
        selected.or(self.unhandled.as_ref()).cloned()
    }

    pub fn set_operation_selector(&mut self, selector: Arc<dyn OperationSelector>) {
        self.operation_selector = Some(selector);
    }

    pub fn add_message_inspector(&mut self, inspector: Arc<dyn MessageInspector>) {
        self.message_inspectors.push(inspector);
    }

    #[must_use]
    pub fn message_inspectors(&self) -> &[Arc<dyn MessageInspector>] {
        &self.message_inspectors
    }

    // -- instancing ---------------------------------------------------------

    pub fn set_instance_mode(&mut self, mode: InstanceMode) {
        self.instance_mode = mode;
    }

    #[must_use]
    pub fn instance_mode(&self) -> InstanceMode {
        self.instance_mode
    }

    pub fn set_instance_provider(&mut self, provider: Arc<dyn InstanceProvider>) {
        self.instance_provider = Some(provider);
    }

    #[must_use]
    pub fn instance_provider(&self) -> Option<&Arc<dyn InstanceProvider>> {
        self.instance_provider.as_ref()
    }

    pub fn set_instance_factory(&mut self, factory: InstanceFactory) {
        self.instance_factory = Some(factory);
    }

    /// Use `S::default()` as the instance factory.
    pub fn set_service_type<S>(&mut self)
    where
        S: Default + Send + Sync + 'static,
    {
        self.instance_factory = Some(Arc::new(|| -> anyhow::Result<ServiceObject> {
            Ok(Arc::new(S::default()))
        }));
    }

    #[must_use]
    pub fn instance_factory(&self) -> Option<&InstanceFactory> {
        self.instance_factory.as_ref()
    }

    /// Concurrent calls allowed per instance context. Clamped to at least 1.
    pub fn set_concurrency_bound(&mut self, bound: usize) {
        self.concurrency_bound = bound.max(1);
    }

    #[must_use]
    pub fn concurrency_bound(&self) -> usize {
        self.concurrency_bound
    }
}

impl Default for DispatchRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DispatchRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchRuntime")
            .field("operations", &self.operations.keys().collect::<Vec<_>>())
            .field("unhandled", &self.unhandled.as_ref().map(|op| op.name()))
            .field("instance_mode", &self.instance_mode)
            .field("concurrency_bound", &self.concurrency_bound)
            .finish_non_exhaustive()
    }
}
