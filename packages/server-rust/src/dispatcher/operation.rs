//! Runtime operation entries.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use hostwire_core::{
    DispatchFormatter, MsgPackFormatter, ParameterMap, RawMessageFormatter, Value,
    WILDCARD_ACTION,
};

use super::contract::{FaultDescription, OperationDescription};
use super::invoker::{MethodInvoker, OperationInvoker};

/// Opaque state handed from a `before_*` inspector hook to its `after_*` twin.
pub type CorrelationState = Option<Box<dyn Any + Send>>;

/// When the service instance is released relative to an operation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReleaseInstanceMode {
    #[default]
    None,
    BeforeCall,
    AfterCall,
    BeforeAndAfterCall,
}

impl ReleaseInstanceMode {
    #[must_use]
    pub fn releases_before_call(self) -> bool {
        matches!(self, Self::BeforeCall | Self::BeforeAndAfterCall)
    }

    #[must_use]
    pub fn releases_after_call(self) -> bool {
        matches!(self, Self::AfterCall | Self::BeforeAndAfterCall)
    }
}

/// Observes parameters around an invocation.
pub trait ParameterInspector: Send + Sync {
    fn before_call(&self, operation: &str, inputs: &[Value]) -> CorrelationState;

    fn after_call(
        &self,
        operation: &str,
        outputs: &[Value],
        result: &Value,
        correlation: CorrelationState,
    );
}

// ---------------------------------------------------------------------------
// DispatchOperation
// ---------------------------------------------------------------------------

/// A named, invocable operation. Immutable once its endpoint is added to a
/// channel dispatcher.
pub struct DispatchOperation {
    name: String,
    action: String,
    reply_action: Option<String>,
    is_one_way: bool,
    is_terminating: bool,
    release_instance: ReleaseInstanceMode,
    formatter: Arc<dyn DispatchFormatter>,
    invoker: Arc<dyn OperationInvoker>,
    faults: Vec<FaultDescription>,
    parameter_inspectors: Vec<Arc<dyn ParameterInspector>>,
}

impl DispatchOperation {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        action: impl Into<String>,
        formatter: Arc<dyn DispatchFormatter>,
        invoker: Arc<dyn OperationInvoker>,
    ) -> Self {
        Self {
            name: name.into(),
            action: action.into(),
            reply_action: None,
            is_one_way: false,
            is_terminating: false,
            release_instance: ReleaseInstanceMode::None,
            formatter,
            invoker,
            faults: Vec::new(),
            parameter_inspectors: Vec::new(),
        }
    }

    /// Build from contract metadata. The positional parameter map is computed
    /// here, once. Catch-all operations default to the raw pass-through
    /// formatter, everything else to `MsgPack`.
    #[must_use]
    pub fn from_description(description: &OperationDescription) -> Self {
        let map = ParameterMap::new(&description.parameters);
        let formatter: Arc<dyn DispatchFormatter> = match &description.formatter {
            Some(formatter) => Arc::clone(formatter),
            None if description.action == WILDCARD_ACTION => Arc::new(RawMessageFormatter),
            None => Arc::new(MsgPackFormatter::new(&map)),
        };
        let invoker = Arc::new(MethodInvoker::new(map, description.method.clone()));
        Self {
            name: description.name.clone(),
            action: description.action.clone(),
            reply_action: description.reply_action.clone(),
            is_one_way: description.is_one_way,
            is_terminating: description.is_terminating,
            release_instance: description.release_instance,
            formatter,
            invoker,
            faults: description.faults.clone(),
            parameter_inspectors: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_reply_action(mut self, action: impl Into<String>) -> Self {
        self.reply_action = Some(action.into());
        self
    }

    #[must_use]
    pub fn one_way(mut self) -> Self {
        self.is_one_way = true;
        self
    }

    #[must_use]
    pub fn terminating(mut self) -> Self {
        self.is_terminating = true;
        self
    }

    #[must_use]
    pub fn with_release(mut self, mode: ReleaseInstanceMode) -> Self {
        self.release_instance = mode;
        self
    }

    #[must_use]
    pub fn with_fault(mut self, fault: FaultDescription) -> Self {
        self.faults.push(fault);
        self
    }

    pub fn add_parameter_inspector(&mut self, inspector: Arc<dyn ParameterInspector>) {
        self.parameter_inspectors.push(inspector);
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn action(&self) -> &str {
        &self.action
    }

    #[must_use]
    pub fn reply_action(&self) -> Option<&str> {
        self.reply_action.as_deref()
    }

    #[must_use]
    pub fn is_one_way(&self) -> bool {
        self.is_one_way
    }

    #[must_use]
    pub fn is_terminating(&self) -> bool {
        self.is_terminating
    }

    #[must_use]
    pub fn release_instance(&self) -> ReleaseInstanceMode {
        self.release_instance
    }

    #[must_use]
    pub fn formatter(&self) -> &Arc<dyn DispatchFormatter> {
        &self.formatter
    }

    #[must_use]
    pub fn invoker(&self) -> &Arc<dyn OperationInvoker> {
        &self.invoker
    }

    #[must_use]
    pub fn faults(&self) -> &[FaultDescription] {
        &self.faults
    }

    /// Declared fault matching a detail type.
    #[must_use]
    pub fn declared_fault(&self, detail_type: &str) -> Option<&FaultDescription> {
        self.faults.iter().find(|f| f.detail_type == detail_type)
    }

    #[must_use]
    pub fn parameter_inspectors(&self) -> &[Arc<dyn ParameterInspector>] {
        &self.parameter_inspectors
    }
}

impl fmt::Debug for DispatchOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchOperation")
            .field("name", &self.name)
            .field("action", &self.action)
            .field("reply_action", &self.reply_action)
            .field("is_one_way", &self.is_one_way)
            .field("is_terminating", &self.is_terminating)
            .field("release_instance", &self.release_instance)
            .finish_non_exhaustive()
    }
}
