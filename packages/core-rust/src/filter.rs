//! Message filters: immutable predicates over a message's headers.
//!
//! Filters are shared as `Arc<dyn MessageFilter>` and compared by identity
//! (see [`same_filter`]), never by structure: two address filters built from
//! the same URI are distinct table entries.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::address::{AddressError, EndpointAddress};
use crate::message::Message;

/// Action that matches every message, including messages without an action.
pub const WILDCARD_ACTION: &str = "*";

/// Predicate deciding whether a message belongs to an endpoint or operation.
pub trait MessageFilter: Send + Sync + fmt::Debug {
    /// Returns `true` if the message satisfies this filter.
    fn matches(&self, message: &Message) -> bool;
}

/// Reference identity of a shared filter.
#[must_use]
pub fn same_filter(a: &Arc<dyn MessageFilter>, b: &Arc<dyn MessageFilter>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a).cast::<()>(),
        Arc::as_ptr(b).cast::<()>(),
    )
}

// ---------------------------------------------------------------------------
// MatchAll / MatchNone
// ---------------------------------------------------------------------------

/// Matches every message. Default address and contract filter of an endpoint.
#[derive(Debug, Default, Clone, Copy)]
pub struct MatchAllMessageFilter;

impl MessageFilter for MatchAllMessageFilter {
    fn matches(&self, _message: &Message) -> bool {
        true
    }
}

/// Matches nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct MatchNoneMessageFilter;

impl MessageFilter for MatchNoneMessageFilter {
    fn matches(&self, _message: &Message) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// EndpointAddressMessageFilter
// ---------------------------------------------------------------------------

/// Matches messages by destination.
///
/// A message matches when its `To` header is absent, names one of the
/// well-known anonymous/none addresses, or its path is a case-sensitive
/// prefix of this filter's address path. Host names are compared only when
/// `include_host_name_in_comparison` is set and both sides are absolute.
#[derive(Debug, Clone)]
pub struct EndpointAddressMessageFilter {
    address: EndpointAddress,
    include_host_name_in_comparison: bool,
}

impl EndpointAddressMessageFilter {
    #[must_use]
    pub fn new(address: EndpointAddress) -> Self {
        Self {
            address,
            include_host_name_in_comparison: false,
        }
    }

    /// Parse `address` and build a filter over it.
    ///
    /// # Errors
    ///
    /// Returns `AddressError` if the address does not parse.
    pub fn parse(address: &str) -> Result<Self, AddressError> {
        Ok(Self::new(EndpointAddress::parse(address)?))
    }

    #[must_use]
    pub fn with_host_comparison(mut self, include: bool) -> Self {
        self.include_host_name_in_comparison = include;
        self
    }

    #[must_use]
    pub fn address(&self) -> &EndpointAddress {
        &self.address
    }
}

impl MessageFilter for EndpointAddressMessageFilter {
    fn matches(&self, message: &Message) -> bool {
        let Some(to) = message.headers().to.as_deref() else {
            return true;
        };
        if EndpointAddress::is_well_known(to) {
            return true;
        }
        let Ok(destination) = EndpointAddress::parse(to) else {
            return false;
        };
        if self.include_host_name_in_comparison {
            if let (Some(ours), Some(theirs)) = (self.address.host(), destination.host()) {
                if !ours.eq_ignore_ascii_case(theirs) {
                    return false;
                }
            }
        }
        self.address.path().starts_with(destination.path())
    }
}

// ---------------------------------------------------------------------------
// ActionMessageFilter
// ---------------------------------------------------------------------------

/// Matches messages whose action is in a configured set, or every message if
/// the set contains [`WILDCARD_ACTION`].
#[derive(Debug, Clone, Default)]
pub struct ActionMessageFilter {
    actions: BTreeSet<String>,
}

impl ActionMessageFilter {
    #[must_use]
    pub fn new<I, S>(actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            actions: actions.into_iter().map(Into::into).collect(),
        }
    }

    #[must_use]
    pub fn actions(&self) -> &BTreeSet<String> {
        &self.actions
    }

    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.actions.contains(WILDCARD_ACTION)
    }
}

impl MessageFilter for ActionMessageFilter {
    fn matches(&self, message: &Message) -> bool {
        if self.is_wildcard() {
            return true;
        }
        message
            .action()
            .is_some_and(|action| self.actions.contains(action))
    }
}

// ---------------------------------------------------------------------------
// AndMessageFilter
// ---------------------------------------------------------------------------

/// Conjunction of two filters; the right side is only evaluated if the left matches.
#[derive(Clone)]
pub struct AndMessageFilter {
    left: Arc<dyn MessageFilter>,
    right: Arc<dyn MessageFilter>,
}

impl AndMessageFilter {
    #[must_use]
    pub fn new(left: Arc<dyn MessageFilter>, right: Arc<dyn MessageFilter>) -> Self {
        Self { left, right }
    }

    #[must_use]
    pub fn left(&self) -> &Arc<dyn MessageFilter> {
        &self.left
    }

    #[must_use]
    pub fn right(&self) -> &Arc<dyn MessageFilter> {
        &self.right
    }
}

impl fmt::Debug for AndMessageFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("And").field(&self.left).field(&self.right).finish()
    }
}

impl MessageFilter for AndMessageFilter {
    fn matches(&self, message: &Message) -> bool {
        self.left.matches(message) && self.right.matches(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::ANONYMOUS_ADDRESS;
    use crate::message::MessageVersion;

    fn msg(to: Option<&str>, action: &str) -> Message {
        let msg = Message::empty(MessageVersion::default(), action);
        match to {
            Some(to) => msg.with_to(to),
            None => msg,
        }
    }

    #[test]
    fn address_filter_matches_exact_path() {
        let filter = EndpointAddressMessageFilter::parse("/svc").unwrap();
        assert!(filter.matches(&msg(Some("/svc"), "Ping")));
        assert!(filter.matches(&msg(Some("net.mem://anyhost/svc"), "Ping")));
    }

    #[test]
    fn address_filter_prefix_is_destination_of_filter_path() {
        let filter = EndpointAddressMessageFilter::parse("net.mem://host/svc/calc").unwrap();
        assert!(filter.matches(&msg(Some("net.mem://host/svc"), "a")));
        assert!(!filter.matches(&msg(Some("net.mem://host/svc/calc/extra"), "a")));
        assert!(!filter.matches(&msg(Some("net.mem://host/other"), "a")));
    }

    #[test]
    fn address_filter_is_case_sensitive() {
        let filter = EndpointAddressMessageFilter::parse("/Svc").unwrap();
        assert!(!filter.matches(&msg(Some("/svc"), "a")));
    }

    #[test]
    fn address_filter_accepts_anonymous_and_missing_destination() {
        let filter = EndpointAddressMessageFilter::parse("/svc").unwrap();
        assert!(filter.matches(&msg(Some(ANONYMOUS_ADDRESS), "a")));
        assert!(filter.matches(&msg(None, "a")));
    }

    #[test]
    fn address_filter_host_comparison_is_opt_in() {
        let lax = EndpointAddressMessageFilter::parse("net.mem://node-a/svc").unwrap();
        let strict = lax.clone().with_host_comparison(true);
        let other_host = msg(Some("net.mem://node-b/svc"), "a");
        assert!(lax.matches(&other_host));
        assert!(!strict.matches(&other_host));
        assert!(strict.matches(&msg(Some("net.mem://NODE-A/svc"), "a")));
    }

    #[test]
    fn action_filter_exact_and_wildcard() {
        let filter = ActionMessageFilter::new(["Ping", "Echo"]);
        assert!(filter.matches(&msg(None, "Ping")));
        assert!(!filter.matches(&msg(None, "ping")));

        let wildcard = ActionMessageFilter::new(["Ping", WILDCARD_ACTION]);
        assert!(wildcard.is_wildcard());
        assert!(wildcard.matches(&msg(None, "Anything")));
    }

    #[test]
    fn and_filter_requires_both() {
        let and = AndMessageFilter::new(
            Arc::new(EndpointAddressMessageFilter::parse("/svc").unwrap()),
            Arc::new(ActionMessageFilter::new(["Ping"])),
        );
        assert!(and.matches(&msg(Some("/svc"), "Ping")));
        assert!(!and.matches(&msg(Some("/svc"), "Pong")));
        assert!(!and.matches(&msg(Some("/other"), "Ping")));
    }

    #[test]
    fn identity_not_structure() {
        let a: Arc<dyn MessageFilter> = Arc::new(ActionMessageFilter::new(["x"]));
        let b: Arc<dyn MessageFilter> = Arc::new(ActionMessageFilter::new(["x"]));
        assert!(same_filter(&a, &a.clone()));
        assert!(!same_filter(&a, &b));
    }

    #[test]
    fn match_all_and_none() {
        let m = msg(None, "a");
        assert!(MatchAllMessageFilter.matches(&m));
        assert!(!MatchNoneMessageFilter.matches(&m));
    }
}
