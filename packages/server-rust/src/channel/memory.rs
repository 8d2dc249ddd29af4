//! In-process transport over tokio channels.
//!
//! A [`MemoryListener`] hands out [`MemoryConnector`]s; each `connect` creates
//! a server-side [`MemoryChannel`] (delivered through `accept_channel`) and the
//! matching [`MemoryClient`]. Channels count replies and sends so callers can
//! observe exactly what went back over the wire.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hostwire_core::Message;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_util::sync::CancellationToken;

use super::transport::{Channel, ChannelListener, ChannelShape, CommunicationState, RequestContext};
use crate::error::TransportError;

/// Inbound queue depth per channel.
const INBOUND_CAPACITY: usize = 64;

enum Envelope {
    Request(Message, oneshot::Sender<Message>),
    Datagram(Message),
}

// ---------------------------------------------------------------------------
// ChannelStats
// ---------------------------------------------------------------------------

/// What the server side sent back on a channel.
#[derive(Debug, Default)]
pub struct ChannelStats {
    replies: AtomicUsize,
    sends: AtomicUsize,
    closed_without_reply: AtomicUsize,
}

impl ChannelStats {
    /// Replies sent through request contexts.
    #[must_use]
    pub fn replies(&self) -> usize {
        self.replies.load(Ordering::SeqCst)
    }

    /// Messages sent with `Channel::send`.
    #[must_use]
    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    /// Requests completed with no reply at all.
    #[must_use]
    pub fn closed_without_reply(&self) -> usize {
        self.closed_without_reply.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// MemoryListener / MemoryConnector
// ---------------------------------------------------------------------------

/// Listener whose channels are created by [`MemoryConnector::connect`].
#[derive(Debug)]
pub struct MemoryListener {
    uri: String,
    state: watch::Sender<CommunicationState>,
    pending_tx: mpsc::UnboundedSender<Arc<MemoryChannel>>,
    pending_rx: Mutex<mpsc::UnboundedReceiver<Arc<MemoryChannel>>>,
    shutdown: CancellationToken,
}

impl MemoryListener {
    #[must_use]
    pub fn new(uri: impl Into<String>) -> Self {
        let (pending_tx, pending_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(CommunicationState::Created);
        Self {
            uri: uri.into(),
            state,
            pending_tx,
            pending_rx: Mutex::new(pending_rx),
            shutdown: CancellationToken::new(),
        }
    }

    /// Client-side handle for opening channels to this listener.
    #[must_use]
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            pending: self.pending_tx.clone(),
            listener_state: self.state.subscribe(),
        }
    }
}

#[async_trait]
impl ChannelListener for MemoryListener {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn state(&self) -> CommunicationState {
        *self.state.borrow()
    }

    async fn open(&self, _timeout: Duration) -> Result<(), TransportError> {
        match ChannelListener::state(self) {
            CommunicationState::Created => {
                self.state.send_replace(CommunicationState::Opened);
                Ok(())
            }
            CommunicationState::Opened => Ok(()),
            _ => Err(TransportError::Closed),
        }
    }

    async fn close(&self, _timeout: Duration) -> Result<(), TransportError> {
        self.shutdown.cancel();
        self.state.send_replace(CommunicationState::Closed);
        Ok(())
    }

    fn abort(&self) {
        self.shutdown.cancel();
        self.state.send_replace(CommunicationState::Closed);
    }

    async fn accept_channel(&self) -> Result<Option<Arc<dyn Channel>>, TransportError> {
        if ChannelListener::state(self).is_terminal() {
            return Ok(None);
        }
        let mut pending = self.pending_rx.lock().await;
        tokio::select! {
            () = self.shutdown.cancelled() => Ok(None),
            next = pending.recv() => Ok(next.map(|channel| channel as Arc<dyn Channel>)),
        }
    }
}

/// Opens channels to a [`MemoryListener`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    pending: mpsc::UnboundedSender<Arc<MemoryChannel>>,
    listener_state: watch::Receiver<CommunicationState>,
}

impl MemoryConnector {
    /// Open a channel of the given shape. `session_id` makes it sessionful.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Closed` if the listener is closed.
    pub fn connect(
        &self,
        shape: ChannelShape,
        session_id: Option<&str>,
    ) -> Result<MemoryClient, TransportError> {
        if self.listener_state.borrow().is_terminal() {
            return Err(TransportError::Closed);
        }
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(CommunicationState::Created);
        let channel = Arc::new(MemoryChannel {
            shape,
            session_id: session_id.map(str::to_string),
            state,
            inbound: Mutex::new(inbound_rx),
            outbound: outbound_tx,
            shutdown: CancellationToken::new(),
            stats: Arc::new(ChannelStats::default()),
        });
        self.pending
            .send(Arc::clone(&channel))
            .map_err(|_| TransportError::Closed)?;
        Ok(MemoryClient {
            inbound: inbound_tx,
            outbound: outbound_rx,
            channel,
        })
    }
}

// ---------------------------------------------------------------------------
// MemoryChannel
// ---------------------------------------------------------------------------

/// Server side of an in-memory channel.
#[derive(Debug)]
pub struct MemoryChannel {
    shape: ChannelShape,
    session_id: Option<String>,
    state: watch::Sender<CommunicationState>,
    inbound: Mutex<mpsc::Receiver<Envelope>>,
    outbound: mpsc::UnboundedSender<Message>,
    shutdown: CancellationToken,
    stats: Arc<ChannelStats>,
}

impl MemoryChannel {
    #[must_use]
    pub fn stats(&self) -> &Arc<ChannelStats> {
        &self.stats
    }

    async fn next_envelope(&self, timeout: Duration) -> Result<Option<Envelope>, TransportError> {
        if Channel::state(self).is_terminal() {
            return Ok(None);
        }
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            () = self.shutdown.cancelled() => Ok(None),
            received = tokio::time::timeout(timeout, inbound.recv()) => match received {
                Ok(envelope) => Ok(envelope),
                Err(_) => Err(TransportError::Timeout {
                    operation: "receive",
                    timeout,
                }),
            },
        }
    }

    fn finish(&self) {
        self.shutdown.cancel();
        self.state.send_replace(CommunicationState::Closed);
    }
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Request(message, _) => f.debug_tuple("Request").field(message).finish(),
            Self::Datagram(message) => f.debug_tuple("Datagram").field(message).finish(),
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn shape(&self) -> ChannelShape {
        self.shape
    }

    fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    fn state(&self) -> CommunicationState {
        *self.state.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<CommunicationState> {
        self.state.subscribe()
    }

    async fn open(&self, _timeout: Duration) -> Result<(), TransportError> {
        match Channel::state(self) {
            CommunicationState::Created => {
                self.state.send_replace(CommunicationState::Opened);
                Ok(())
            }
            CommunicationState::Opened => Ok(()),
            _ => Err(TransportError::Closed),
        }
    }

    async fn close(&self, _timeout: Duration) -> Result<(), TransportError> {
        if Channel::state(self) != CommunicationState::Closed {
            self.state.send_replace(CommunicationState::Closing);
            self.finish();
        }
        Ok(())
    }

    fn abort(&self) {
        self.finish();
    }

    async fn try_receive_request(
        &self,
        timeout: Duration,
    ) -> Result<Option<Box<dyn RequestContext>>, TransportError> {
        Ok(self.next_envelope(timeout).await?.map(|envelope| {
            let (request, reply_to) = match envelope {
                Envelope::Request(message, reply_to) => (message, Some(reply_to)),
                Envelope::Datagram(message) => (message, None),
            };
            Box::new(MemoryRequestContext {
                request: Some(request),
                reply_to,
                stats: Arc::clone(&self.stats),
            }) as Box<dyn RequestContext>
        }))
    }

    async fn try_receive(&self, timeout: Duration) -> Result<Option<Message>, TransportError> {
        Ok(self
            .next_envelope(timeout)
            .await?
            .map(|envelope| match envelope {
                Envelope::Request(message, _) | Envelope::Datagram(message) => message,
            }))
    }

    async fn send(&self, message: Message, _timeout: Duration) -> Result<(), TransportError> {
        if Channel::state(self) != CommunicationState::Opened {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send(message)
            .map_err(|_| TransportError::Communication("peer went away".to_string()))?;
        self.stats.sends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Reply handle for one request on a [`MemoryChannel`].
#[derive(Debug)]
pub struct MemoryRequestContext {
    request: Option<Message>,
    reply_to: Option<oneshot::Sender<Message>>,
    stats: Arc<ChannelStats>,
}

#[async_trait]
impl RequestContext for MemoryRequestContext {
    fn take_request(&mut self) -> Option<Message> {
        self.request.take()
    }

    async fn reply(&mut self, message: Message, _timeout: Duration) -> Result<(), TransportError> {
        let reply_to = self.reply_to.take().ok_or(TransportError::AlreadyReplied)?;
        self.stats.replies.fetch_add(1, Ordering::SeqCst);
        reply_to
            .send(message)
            .map_err(|_| TransportError::Communication("requester went away".to_string()))
    }

    fn close(&mut self) {
        if self.reply_to.take().is_some() {
            self.stats.closed_without_reply.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn abort(&mut self) {
        self.reply_to = None;
    }
}

// ---------------------------------------------------------------------------
// MemoryClient
// ---------------------------------------------------------------------------

/// Client side of an in-memory channel.
#[derive(Debug)]
pub struct MemoryClient {
    inbound: mpsc::Sender<Envelope>,
    outbound: mpsc::UnboundedReceiver<Message>,
    channel: Arc<MemoryChannel>,
}

impl MemoryClient {
    /// Send a request and wait for its reply; `None` if the server completed
    /// the request without replying.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Closed` if the channel is gone.
    pub async fn request(&self, message: Message) -> Result<Option<Message>, TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inbound
            .send(Envelope::Request(message, reply_tx))
            .await
            .map_err(|_| TransportError::Closed)?;
        Ok(reply_rx.await.ok())
    }

    /// Send a one-way message.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Closed` if the channel is gone.
    pub async fn send(&self, message: Message) -> Result<(), TransportError> {
        self.inbound
            .send(Envelope::Datagram(message))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Next message the server sent on a duplex channel.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Timeout` if nothing arrives in time.
    pub async fn receive(&mut self, timeout: Duration) -> Result<Option<Message>, TransportError> {
        tokio::time::timeout(timeout, self.outbound.recv())
            .await
            .map_err(|_| TransportError::Timeout {
                operation: "receive",
                timeout,
            })
    }

    /// Server-side channel state.
    #[must_use]
    pub fn server_state(&self) -> CommunicationState {
        Channel::state(self.channel.as_ref())
    }

    /// Watch the server-side channel state.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<CommunicationState> {
        self.channel.subscribe()
    }

    #[must_use]
    pub fn stats(&self) -> &Arc<ChannelStats> {
        self.channel.stats()
    }

    /// Hang up; the server sees end-of-session on its next receive.
    pub fn close(self) {
        drop(self);
    }
}
