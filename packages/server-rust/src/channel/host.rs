//! Hooks the owning service host exposes to its channel dispatchers.

use hostwire_core::Message;

use super::transport::Channel;

/// The service host a channel dispatcher is attached to.
pub trait ServiceHost: Send + Sync {
    fn name(&self) -> &str;

    /// A message matched no endpoint. Return `true` to claim it; otherwise the
    /// dispatcher answers with an addressing fault where the channel allows.
    fn on_unknown_message(&self, _channel: &dyn Channel, _message: &Message) -> bool {
        false
    }
}
