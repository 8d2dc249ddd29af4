//! Endpoint dispatcher: an address/contract filter pair bound to an operation table.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Weak};

use hostwire_core::{
    ActionMessageFilter, AddressError, EndpointAddress, EndpointAddressMessageFilter,
    MatchAllMessageFilter, MessageFilter, WILDCARD_ACTION,
};

use super::contract::ContractDescription;
use super::operation::DispatchOperation;
use super::runtime::DispatchRuntime;
use crate::channel::dispatcher::ChannelDispatcher;
use crate::error::ConfigError;

/// Routing and handling unit for one address/contract pair.
///
/// Mutable until it is added to a [`ChannelDispatcher`], which takes ownership
/// and freezes it behind an `Arc`.
pub struct EndpointDispatcher {
    address: EndpointAddress,
    contract_name: String,
    contract_namespace: String,
    address_filter: Option<Arc<dyn MessageFilter>>,
    contract_filter: Option<Arc<dyn MessageFilter>>,
    filter_priority: i32,
    runtime: DispatchRuntime,
    channel_dispatcher: Weak<ChannelDispatcher>,
}

impl EndpointDispatcher {
    /// Both filters start out as match-all.
    ///
    /// # Errors
    ///
    /// Returns `AddressError` if `address` does not parse.
    pub fn new(
        address: &str,
        contract_name: impl Into<String>,
        contract_namespace: impl Into<String>,
    ) -> Result<Self, AddressError> {
        Ok(Self {
            address: EndpointAddress::parse(address)?,
            contract_name: contract_name.into(),
            contract_namespace: contract_namespace.into(),
            address_filter: Some(Arc::new(MatchAllMessageFilter)),
            contract_filter: Some(Arc::new(MatchAllMessageFilter)),
            filter_priority: 0,
            runtime: DispatchRuntime::new(),
            channel_dispatcher: Weak::new(),
        })
    }

    /// `"{contract}@{address}"`, used in logs and errors.
    #[must_use]
    pub fn name(&self) -> String {
        format!("{}@{}", self.contract_name, self.address)
    }

    #[must_use]
    pub fn address(&self) -> &EndpointAddress {
        &self.address
    }

    #[must_use]
    pub fn contract_name(&self) -> &str {
        &self.contract_name
    }

    #[must_use]
    pub fn contract_namespace(&self) -> &str {
        &self.contract_namespace
    }

    #[must_use]
    pub fn address_filter(&self) -> Option<&Arc<dyn MessageFilter>> {
        self.address_filter.as_ref()
    }

    pub fn set_address_filter(&mut self, filter: Option<Arc<dyn MessageFilter>>) {
        self.address_filter = filter;
    }

    /// Replace the address filter with a prefix filter over this endpoint's address.
    pub fn use_address_filter(&mut self) {
        self.address_filter = Some(Arc::new(EndpointAddressMessageFilter::new(
            self.address.clone(),
        )));
    }

    #[must_use]
    pub fn contract_filter(&self) -> Option<&Arc<dyn MessageFilter>> {
        self.contract_filter.as_ref()
    }

    pub fn set_contract_filter(&mut self, filter: Option<Arc<dyn MessageFilter>>) {
        self.contract_filter = filter;
    }

    #[must_use]
    pub fn filter_priority(&self) -> i32 {
        self.filter_priority
    }

    pub fn set_filter_priority(&mut self, priority: i32) {
        self.filter_priority = priority;
    }

    #[must_use]
    pub fn runtime(&self) -> &DispatchRuntime {
        &self.runtime
    }

    pub fn runtime_mut(&mut self) -> &mut DispatchRuntime {
        &mut self.runtime
    }

    /// Owning channel dispatcher, once added to one.
    #[must_use]
    pub fn channel_dispatcher(&self) -> Option<Arc<ChannelDispatcher>> {
        self.channel_dispatcher.upgrade()
    }

    pub(crate) fn set_channel_dispatcher(&mut self, owner: Weak<ChannelDispatcher>) {
        self.channel_dispatcher = owner;
    }

    /// Derive the contract filter and operation table from contract metadata.
    ///
    /// The contract filter accepts the union of all operation actions, or every
    /// message if any operation is the `"*"` catch-all. Operations already
    /// present by name are skipped, so repeated passes are harmless.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::DuplicateAction` if two differently named
    /// operations claim the same action.
    pub fn initialize_from_contract(
        &mut self,
        contract: &ContractDescription,
    ) -> Result<(), ConfigError> {
        let mut actions = BTreeSet::new();
        let mut wildcard = false;
        for description in &contract.operations {
            if description.action == WILDCARD_ACTION {
                wildcard = true;
            } else {
                actions.insert(description.action.clone());
            }
            if self.runtime.has_operation(&description.name) {
                continue;
            }
            self.runtime
                .add_operation(DispatchOperation::from_description(description))?;
        }
        self.contract_filter = Some(if wildcard {
            Arc::new(MatchAllMessageFilter)
        } else {
            Arc::new(ActionMessageFilter::new(actions))
        });
        Ok(())
    }

    /// Setup-time validation: both filters present and an instance source configured.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingFilter` or `ConfigError::MissingInstanceFactory`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address_filter.is_none() {
            return Err(ConfigError::MissingFilter {
                endpoint: self.name(),
                kind: "address",
            });
        }
        if self.contract_filter.is_none() {
            return Err(ConfigError::MissingFilter {
                endpoint: self.name(),
                kind: "contract",
            });
        }
        if self.runtime.instance_provider().is_none() && self.runtime.instance_factory().is_none() {
            return Err(ConfigError::MissingInstanceFactory {
                endpoint: self.name(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for EndpointDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointDispatcher")
            .field("address", &self.address.to_string())
            .field("contract", &self.contract_name)
            .field("address_filter", &self.address_filter)
            .field("contract_filter", &self.contract_filter)
            .field("filter_priority", &self.filter_priority)
            .field("runtime", &self.runtime)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use hostwire_core::{Message, MessageVersion, Value};

    use super::*;
    use crate::dispatcher::contract::{OperationDescription, ServiceMethod};

    #[derive(Default)]
    struct Svc;

    fn op(name: &str, action: &str) -> OperationDescription {
        OperationDescription::new(name, action, ServiceMethod::sync(|_: &Svc, _| Ok(Value::Null)))
    }

    fn msg(action: &str) -> Message {
        Message::empty(MessageVersion::default(), action)
    }

    #[test]
    fn contract_filter_is_union_of_actions() {
        let contract = ContractDescription::new("Ping", "urn:test")
            .with_operation(op("Ping", "Ping"))
            .with_operation(op("Echo", "Echo"));
        let mut endpoint = EndpointDispatcher::new("/svc", "Ping", "urn:test").unwrap();
        endpoint.initialize_from_contract(&contract).unwrap();

        let filter = endpoint.contract_filter().unwrap();
        assert!(filter.matches(&msg("Ping")));
        assert!(filter.matches(&msg("Echo")));
        assert!(!filter.matches(&msg("Other")));
        assert_eq!(endpoint.runtime().operation_count(), 2);
    }

    #[test]
    fn wildcard_operation_makes_contract_filter_match_all() {
        let contract = ContractDescription::new("Any", "urn:test")
            .with_operation(op("Ping", "Ping"))
            .with_operation(op("Catch", WILDCARD_ACTION));
        let mut endpoint = EndpointDispatcher::new("/svc", "Any", "urn:test").unwrap();
        endpoint.initialize_from_contract(&contract).unwrap();
        assert!(endpoint.contract_filter().unwrap().matches(&msg("Whatever")));
    }

    #[test]
    fn initialize_is_idempotent_per_operation_name() {
        let contract = ContractDescription::new("Ping", "urn:test").with_operation(op("Ping", "Ping"));
        let mut endpoint = EndpointDispatcher::new("/svc", "Ping", "urn:test").unwrap();
        endpoint.initialize_from_contract(&contract).unwrap();
        endpoint.initialize_from_contract(&contract).unwrap();
        assert_eq!(endpoint.runtime().operation_count(), 1);
    }

    #[test]
    fn conflicting_actions_are_rejected() {
        let contract = ContractDescription::new("Ping", "urn:test")
            .with_operation(op("Ping", "Ping"))
            .with_operation(op("Ping2", "Ping"));
        let mut endpoint = EndpointDispatcher::new("/svc", "Ping", "urn:test").unwrap();
        assert!(matches!(
            endpoint.initialize_from_contract(&contract),
            Err(ConfigError::DuplicateAction { .. })
        ));
    }

    #[test]
    fn validate_requires_filters_and_instance_source() {
        let mut endpoint = EndpointDispatcher::new("/svc", "Ping", "urn:test").unwrap();
        assert!(matches!(
            endpoint.validate(),
            Err(ConfigError::MissingInstanceFactory { .. })
        ));
        endpoint.runtime_mut().set_service_type::<Svc>();
        endpoint.validate().unwrap();

        endpoint.set_address_filter(None);
        assert!(matches!(
            endpoint.validate(),
            Err(ConfigError::MissingFilter { kind: "address", .. })
        ));
    }

    #[test]
    fn address_filter_from_own_address() {
        let mut endpoint = EndpointDispatcher::new("/svc", "Ping", "urn:test").unwrap();
        endpoint.use_address_filter();
        let filter = endpoint.address_filter().unwrap();
        assert!(filter.matches(&msg("Ping").with_to("/svc")));
        assert!(!filter.matches(&msg("Ping").with_to("/other")));
        assert_eq!(endpoint.name(), "Ping@/svc");
        assert!(endpoint.channel_dispatcher().is_none());
    }
}
