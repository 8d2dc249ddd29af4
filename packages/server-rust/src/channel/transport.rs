//! Transport seams consumed by the dispatcher: listeners, channels, request contexts.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hostwire_core::Message;
use tokio::sync::watch;

use crate::error::TransportError;

/// Message exchange pattern of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelShape {
    /// Request/reply: each request carries its own reply context.
    Reply,
    /// One-way input only; nothing is ever sent back.
    Input,
    /// Datagrams in, replies sent as ordinary messages on the same channel.
    Duplex,
}

/// Lifecycle of a listener or channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommunicationState {
    Created,
    Opening,
    Opened,
    Closing,
    Closed,
    Faulted,
}

impl CommunicationState {
    /// Closing, Closed or Faulted.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closing | Self::Closed | Self::Faulted)
    }
}

/// A received request awaiting at most one reply.
#[async_trait]
pub trait RequestContext: Send + fmt::Debug {
    /// The request message; `None` once taken.
    fn take_request(&mut self) -> Option<Message>;

    /// # Errors
    ///
    /// Returns `TransportError::AlreadyReplied` on a second reply, or a
    /// transport failure.
    async fn reply(&mut self, message: Message, timeout: Duration) -> Result<(), TransportError>;

    /// Complete the request without replying.
    fn close(&mut self);

    fn abort(&mut self);
}

/// An accepted transport channel.
///
/// The `try_receive*` methods return `Ok(None)` once the channel is closed or
/// the peer hung up, and `TransportError::Timeout` when nothing arrived in time.
#[async_trait]
pub trait Channel: Send + Sync + fmt::Debug {
    fn shape(&self) -> ChannelShape;

    /// Session id for sessionful channels.
    fn session_id(&self) -> Option<&str>;

    fn state(&self) -> CommunicationState;

    /// State change notifications (`Opened`, `Closed`, `Faulted`).
    fn subscribe(&self) -> watch::Receiver<CommunicationState>;

    /// # Errors
    ///
    /// Returns `TransportError` if the channel cannot be opened in time.
    async fn open(&self, timeout: Duration) -> Result<(), TransportError>;

    /// # Errors
    ///
    /// Returns `TransportError` if the channel cannot be closed in time.
    async fn close(&self, timeout: Duration) -> Result<(), TransportError>;

    fn abort(&self);

    /// Receive the next request on a [`ChannelShape::Reply`] channel.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Timeout` or a transport failure.
    async fn try_receive_request(
        &self,
        timeout: Duration,
    ) -> Result<Option<Box<dyn RequestContext>>, TransportError>;

    /// Receive the next message on an input or duplex channel.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Timeout` or a transport failure.
    async fn try_receive(&self, timeout: Duration) -> Result<Option<Message>, TransportError>;

    /// # Errors
    ///
    /// Returns `TransportError` if the message cannot be sent.
    async fn send(&self, message: Message, timeout: Duration) -> Result<(), TransportError>;
}

/// Source of inbound channels.
#[async_trait]
pub trait ChannelListener: Send + Sync + fmt::Debug {
    fn uri(&self) -> &str;

    fn state(&self) -> CommunicationState;

    /// # Errors
    ///
    /// Returns `TransportError` if the listener cannot be opened in time.
    async fn open(&self, timeout: Duration) -> Result<(), TransportError>;

    /// # Errors
    ///
    /// Returns `TransportError` if the listener cannot be closed in time.
    async fn close(&self, timeout: Duration) -> Result<(), TransportError>;

    fn abort(&self);

    /// Wait for the next channel; `None` once the listener is closed.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` on an accept failure.
    async fn accept_channel(&self) -> Result<Option<Arc<dyn Channel>>, TransportError>;
}
