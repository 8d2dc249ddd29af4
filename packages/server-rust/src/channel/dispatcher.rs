//! Channel dispatcher: owns one listener, accepts channels up to the session
//! cap, and feeds every received message to the matching endpoint's pipeline.
//!
//! Lifecycle follows the deferred pattern:
//! 1. `new()` -- allocates shared state; endpoints and handlers are added in `Setup`
//! 2. `open()` -- validates endpoints, freezes routing, opens the listener,
//!    and spawns the accept loop
//! 3. `close()` -- stops accepting, waits (bounded) for channel pumps, then
//!    aborts whatever is left

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use hostwire_core::{AndMessageFilter, Message, MessageFilterTable};
use parking_lot::Mutex;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::host::ServiceHost;
use super::lifecycle::{DispatcherState, LifecycleController};
use super::registry::{ChannelHandle, ChannelRegistry};
use super::transport::{
    Channel, ChannelListener, ChannelShape, CommunicationState, RequestContext,
};
use crate::dispatcher::config::DispatcherConfig;
use crate::dispatcher::endpoint::EndpointDispatcher;
use crate::dispatcher::fault::{
    action_not_supported, destination_unreachable, ErrorHandler, SessionShutdownHandler,
};
use crate::error::{ConfigError, DispatchError, TransportError};
use crate::pipeline::context::{correlate_reply, ProcessingContext, ReplyTarget};
use crate::pipeline::processor::RequestProcessor;

/// One received unit of work.
enum Inbound {
    Request(Box<dyn RequestContext>),
    Message(Message),
}

/// Routing state frozen when the dispatcher opens.
struct Routing {
    table: MessageFilterTable<usize>,
    processors: Vec<Arc<RequestProcessor>>,
}

/// Accept loop and message router for one listener.
pub struct ChannelDispatcher {
    listener: Arc<dyn ChannelListener>,
    config: DispatcherConfig,
    lifecycle: LifecycleController,
    endpoints: Mutex<Vec<Arc<EndpointDispatcher>>>,
    error_handlers: Mutex<Vec<Arc<dyn ErrorHandler>>>,
    shutdown_handlers: Mutex<Vec<Arc<dyn SessionShutdownHandler>>>,
    host: Mutex<Option<Arc<dyn ServiceHost>>>,
    routing: OnceLock<Routing>,
    registry: ChannelRegistry,
    sessions: Arc<Semaphore>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    next_call_id: AtomicU64,
    this: Weak<ChannelDispatcher>,
}

impl ChannelDispatcher {
    #[must_use]
    pub fn new(listener: Arc<dyn ChannelListener>, config: DispatcherConfig) -> Arc<Self> {
        let sessions = Arc::new(Semaphore::new(config.max_concurrent_sessions.max(1)));
        Arc::new_cyclic(|this| Self {
            listener,
            config,
            lifecycle: LifecycleController::new(),
            endpoints: Mutex::new(Vec::new()),
            error_handlers: Mutex::new(Vec::new()),
            shutdown_handlers: Mutex::new(Vec::new()),
            host: Mutex::new(None),
            routing: OnceLock::new(),
            registry: ChannelRegistry::new(),
            sessions,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            next_call_id: AtomicU64::new(1),
            this: this.clone(),
        })
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn state(&self) -> DispatcherState {
        self.lifecycle.state()
    }

    /// Receiver notified on every lifecycle transition.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<DispatcherState> {
        self.lifecycle.subscribe()
    }

    #[must_use]
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    #[must_use]
    pub fn listener(&self) -> &Arc<dyn ChannelListener> {
        &self.listener
    }

    #[must_use]
    pub fn endpoints(&self) -> Vec<Arc<EndpointDispatcher>> {
        self.endpoints.lock().clone()
    }

    #[must_use]
    pub fn host(&self) -> Option<Arc<dyn ServiceHost>> {
        self.host.lock().clone()
    }

    /// Request processors, one per endpoint in registration order. Empty
    /// until the dispatcher opens.
    #[must_use]
    pub fn processors(&self) -> Vec<Arc<RequestProcessor>> {
        self.routing
            .get()
            .map(|routing| routing.processors.clone())
            .unwrap_or_default()
    }

    /// Live channels, accepted and not yet closed.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.registry.count()
    }

    #[must_use]
    pub fn channels(&self) -> Vec<Arc<ChannelHandle>> {
        self.registry.channels()
    }

    #[must_use]
    pub fn in_flight_requests(&self) -> u64 {
        self.lifecycle.in_flight_count()
    }

    // -----------------------------------------------------------------------
    // Setup-time configuration
    // -----------------------------------------------------------------------

    fn ensure_setup(&self) -> Result<(), ConfigError> {
        match self.lifecycle.state() {
            DispatcherState::Setup => Ok(()),
            state => Err(ConfigError::InvalidState { state }),
        }
    }

    /// Take ownership of `endpoint` and bind it to this dispatcher.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidState` once the dispatcher has opened.
    pub fn add_endpoint(
        &self,
        mut endpoint: EndpointDispatcher,
    ) -> Result<Arc<EndpointDispatcher>, ConfigError> {
        self.ensure_setup()?;
        endpoint.set_channel_dispatcher(self.this.clone());
        let endpoint = Arc::new(endpoint);
        self.endpoints.lock().push(Arc::clone(&endpoint));
        debug!(endpoint = %endpoint.name(), "endpoint added");
        Ok(endpoint)
    }

    /// # Errors
    ///
    /// Returns `ConfigError::InvalidState` once the dispatcher has opened and
    /// `ConfigError::ForeignEndpoint` if `endpoint` was not added here.
    pub fn remove_endpoint(&self, endpoint: &Arc<EndpointDispatcher>) -> Result<(), ConfigError> {
        self.ensure_setup()?;
        let mut endpoints = self.endpoints.lock();
        let idx = endpoints
            .iter()
            .position(|candidate| Arc::ptr_eq(candidate, endpoint))
            .ok_or(ConfigError::ForeignEndpoint)?;
        endpoints.remove(idx);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `ConfigError::InvalidState` once the dispatcher has opened.
    pub fn add_error_handler(&self, handler: Arc<dyn ErrorHandler>) -> Result<(), ConfigError> {
        self.ensure_setup()?;
        self.error_handlers.lock().push(handler);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `ConfigError::InvalidState` once the dispatcher has opened.
    pub fn add_session_shutdown_handler(
        &self,
        handler: Arc<dyn SessionShutdownHandler>,
    ) -> Result<(), ConfigError> {
        self.ensure_setup()?;
        self.shutdown_handlers.lock().push(handler);
        Ok(())
    }

    /// Called by the owning service host.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::AlreadyAttached` if a host is already attached.
    pub fn attach(&self, host: Arc<dyn ServiceHost>) -> Result<(), ConfigError> {
        let mut slot = self.host.lock();
        if let Some(existing) = slot.as_ref() {
            return Err(ConfigError::AlreadyAttached {
                host: existing.name().to_string(),
            });
        }
        info!(host = host.name(), "attached to service host");
        *slot = Some(host);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `ConfigError::NotAttached` unless `host` is the attached host.
    pub fn detach(&self, host: &Arc<dyn ServiceHost>) -> Result<(), ConfigError> {
        let mut slot = self.host.lock();
        match slot.as_ref() {
            Some(current) if std::ptr::addr_eq(Arc::as_ptr(current), Arc::as_ptr(host)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(ConfigError::NotAttached),
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Validate endpoints, freeze routing, open the listener, and start
    /// accepting channels.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Configuration` for invalid endpoints or a call
    /// outside `Setup`, and `DispatchError::Transport` if the listener fails
    /// to open. The dispatcher stays in `Setup` on error.
    pub async fn open(self: &Arc<Self>) -> Result<(), DispatchError> {
        self.ensure_setup()?;

        let endpoints = self.endpoints();
        for endpoint in &endpoints {
            endpoint.validate()?;
        }
        let table = build_table(&endpoints)?;
        let error_handlers = self.error_handlers.lock().clone();
        let shutdown_handlers = self.shutdown_handlers.lock().clone();
        let processors: Vec<_> = endpoints
            .iter()
            .map(|endpoint| {
                Arc::new(RequestProcessor::new(
                    Arc::clone(endpoint),
                    self.config.clone(),
                    error_handlers.clone(),
                    shutdown_handlers.clone(),
                ))
            })
            .collect();
        for processor in &processors {
            processor.instance_manager().validate()?;
        }

        if self.listener.state() != CommunicationState::Opened {
            self.listener.open(self.config.timeouts.open).await?;
        }

        if self.routing.set(Routing { table, processors }).is_err() {
            return Err(ConfigError::InvalidState {
                state: self.lifecycle.state(),
            }
            .into());
        }
        self.lifecycle
            .transition(DispatcherState::Setup, DispatcherState::Running)
            .map_err(|state| ConfigError::InvalidState { state })?;

        info!(
            uri = self.listener.uri(),
            endpoints = endpoints.len(),
            max_sessions = self.config.max_concurrent_sessions,
            "channel dispatcher opened"
        );
        let this = Arc::clone(self);
        self.tasks.spawn(this.accept_loop());
        Ok(())
    }

    /// Stop accepting, let channel pumps finish within the close timeout,
    /// then abort the listener and any channel still open.
    ///
    /// Closing a dispatcher that never opened moves it straight to `Stopped`.
    /// Repeated calls are no-ops.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Timeout` if pumps were still running when the
    /// close timeout expired. The dispatcher is `Stopped` either way.
    pub async fn close(&self) -> Result<(), TransportError> {
        match self.lifecycle.state() {
            DispatcherState::Setup => {
                if self
                    .lifecycle
                    .transition(DispatcherState::Setup, DispatcherState::Stopped)
                    .is_ok()
                {
                    return Ok(());
                }
            }
            DispatcherState::Running => {}
            DispatcherState::Stopping | DispatcherState::Stopped => return Ok(()),
        }
        if self
            .lifecycle
            .transition(DispatcherState::Running, DispatcherState::Stopping)
            .is_err()
        {
            return Ok(());
        }

        self.shutdown.cancel();
        self.tasks.close();
        let timeout = self.config.timeouts.close;
        let drained = tokio::time::timeout(timeout, self.tasks.wait())
            .await
            .is_ok();
        if !drained {
            warn!(
                ?timeout,
                channels = self.registry.count(),
                "channels did not close in time, aborting"
            );
        }

        self.teardown(timeout).await;
        if drained {
            Ok(())
        } else {
            Err(TransportError::Timeout {
                operation: "close",
                timeout,
            })
        }
    }

    /// Hard stop: cancel everything and abort channels without waiting.
    pub fn abort(&self) {
        if self
            .lifecycle
            .transition(DispatcherState::Setup, DispatcherState::Stopped)
            .is_ok()
        {
            return;
        }
        if self
            .lifecycle
            .transition(DispatcherState::Running, DispatcherState::Stopping)
            .is_err()
        {
            return;
        }
        self.shutdown.cancel();
        self.tasks.close();
        for handle in self.registry.drain_all() {
            handle.channel.abort();
        }
        self.listener.abort();
        self.drain_instances();
        let _ = self
            .lifecycle
            .transition(DispatcherState::Stopping, DispatcherState::Stopped);
    }

    async fn teardown(&self, timeout: std::time::Duration) {
        for handle in self.registry.drain_all() {
            debug!(channel = handle.id.0, "aborting channel left open at shutdown");
            handle.channel.abort();
        }
        if let Err(err) = self.listener.close(timeout).await {
            warn!(error = %err, "listener did not close cleanly, aborting");
            self.listener.abort();
        }
        self.drain_instances();
        let _ = self
            .lifecycle
            .transition(DispatcherState::Stopping, DispatcherState::Stopped);
        info!(uri = self.listener.uri(), "channel dispatcher stopped");
    }

    fn drain_instances(&self) {
        let closed: usize = self
            .processors()
            .iter()
            .map(|processor| processor.instance_manager().drain())
            .sum();
        if closed > 0 {
            debug!(contexts = closed, "closed retained instance contexts");
        }
    }

    // -----------------------------------------------------------------------
    // Accept loop and channel pumps
    // -----------------------------------------------------------------------

    async fn accept_loop(self: Arc<Self>) {
        debug!("accept loop started");
        loop {
            let permit = tokio::select! {
                () = self.shutdown.cancelled() => break,
                permit = Arc::clone(&self.sessions).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let accepted = tokio::select! {
                () = self.shutdown.cancelled() => break,
                accepted = self.listener.accept_channel() => accepted,
            };
            let channel = match accepted {
                Ok(Some(channel)) => channel,
                Ok(None) => {
                    debug!("listener stopped producing channels");
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    continue;
                }
            };
            if let Err(err) = channel.open(self.config.timeouts.open).await {
                warn!(error = %err, "accepted channel failed to open");
                channel.abort();
                continue;
            }

            let handle = self.registry.register(channel);
            debug!(
                channel = handle.id.0,
                shape = ?handle.shape,
                session_id = ?handle.session_id,
                "channel accepted"
            );
            let this = Arc::clone(&self);
            self.tasks.spawn(this.pump(handle, permit));
        }
        debug!("accept loop exited");
    }

    /// Receive and process messages until the channel ends.
    ///
    /// Session channels and synchronous mode process inline, preserving
    /// receipt order. Sessionless channels in asynchronous mode run up to
    /// `max_concurrent_calls` requests at once.
    async fn pump(self: Arc<Self>, handle: Arc<ChannelHandle>, _session: OwnedSemaphorePermit) {
        let channel = Arc::clone(&handle.channel);
        let inline = self.config.receive_synchronously || handle.session_id.is_some();
        let calls = Arc::new(Semaphore::new(self.config.max_concurrent_calls.max(1)));

        loop {
            let received = tokio::select! {
                () = self.shutdown.cancelled() => break,
                received = self.receive(&channel) => received,
            };
            let inbound = match received {
                Ok(Some(inbound)) => inbound,
                Ok(None) => break,
                Err(TransportError::Timeout { .. }) => {
                    debug!(channel = handle.id.0, "receive timed out, closing channel");
                    break;
                }
                Err(err) => {
                    warn!(channel = handle.id.0, error = %err, "receive failed, aborting channel");
                    channel.abort();
                    break;
                }
            };

            if inline {
                if let Err(err) = self.dispatch(&channel, inbound).await {
                    warn!(channel = handle.id.0, error = %err, "request failed, aborting channel");
                    channel.abort();
                    break;
                }
                continue;
            }

            let permit = tokio::select! {
                () = self.shutdown.cancelled() => break,
                permit = Arc::clone(&calls).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let this = Arc::clone(&self);
            let call_channel = Arc::clone(&channel);
            let id = handle.id.0;
            self.tasks.spawn(async move {
                let _permit = permit;
                if let Err(err) = this.dispatch(&call_channel, inbound).await {
                    warn!(channel = id, error = %err, "request failed, aborting channel");
                    call_channel.abort();
                }
            });
        }

        if !channel.state().is_terminal() {
            if let Err(err) = channel.close(self.config.timeouts.close).await {
                warn!(channel = handle.id.0, error = %err, "channel close failed, aborting");
                channel.abort();
            }
        }
        self.registry.remove(handle.id);
        // Sessionless channels share one context; only `drain` closes it.
        if let Some(session_id) = handle.session_id.as_deref() {
            for processor in self.processors() {
                processor.instance_manager().session_closed(Some(session_id));
            }
        }
        debug!(channel = handle.id.0, "channel removed");
    }

    async fn receive(&self, channel: &Arc<dyn Channel>) -> Result<Option<Inbound>, TransportError> {
        let timeout = self.config.timeouts.receive;
        match channel.shape() {
            ChannelShape::Reply => Ok(channel
                .try_receive_request(timeout)
                .await?
                .map(Inbound::Request)),
            ChannelShape::Input | ChannelShape::Duplex => {
                Ok(channel.try_receive(timeout).await?.map(Inbound::Message))
            }
        }
    }

    async fn dispatch(&self, channel: &Arc<dyn Channel>, inbound: Inbound) -> Result<(), DispatchError> {
        match inbound {
            Inbound::Request(request) => self.process_request(channel, request).await,
            Inbound::Message(message) => self.process_input(channel, message).await,
        }
    }

    // -----------------------------------------------------------------------
    // Request entry points
    // -----------------------------------------------------------------------

    /// Process one request received on a request/reply channel.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::AmbiguousMatch` if endpoint selection is
    /// ambiguous, or the pipeline's unhandled error.
    pub async fn process_request(
        &self,
        channel: &Arc<dyn Channel>,
        mut request: Box<dyn RequestContext>,
    ) -> Result<(), DispatchError> {
        let Some(message) = request.take_request() else {
            request.close();
            return Ok(());
        };
        self.process_message(channel, message, ReplyTarget::Request(request))
            .await
    }

    /// Process one message received on an input or duplex channel. Replies on
    /// duplex channels go back as ordinary sends.
    ///
    /// # Errors
    ///
    /// Same as [`process_request`](Self::process_request).
    pub async fn process_input(
        &self,
        channel: &Arc<dyn Channel>,
        message: Message,
    ) -> Result<(), DispatchError> {
        let target = match channel.shape() {
            ChannelShape::Duplex => ReplyTarget::Channel,
            ChannelShape::Reply | ChannelShape::Input => ReplyTarget::None,
        };
        self.process_message(channel, message, target).await
    }

    async fn process_message(
        &self,
        channel: &Arc<dyn Channel>,
        message: Message,
        target: ReplyTarget,
    ) -> Result<(), DispatchError> {
        let _in_flight = self.lifecycle.in_flight_guard();
        let processor = match self.route(&message) {
            Ok(Some(processor)) => processor,
            Ok(None) => {
                self.unknown_message(channel, message, target).await;
                return Ok(());
            }
            Err(err) => {
                error!(error = %err, action = ?message.action(), "endpoint selection failed");
                return Err(err);
            }
        };

        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        debug!(call_id, endpoint = %processor.endpoint().name(), action = ?message.action(), "message routed");
        let mut cx = ProcessingContext::new(
            call_id,
            message,
            self.config.message_version,
            Arc::clone(channel),
            target,
        )
        .with_cancellation(self.shutdown.child_token());
        processor.process(&mut cx).await
    }

    // -----------------------------------------------------------------------
    // Endpoint selection
    // -----------------------------------------------------------------------

    fn route(&self, message: &Message) -> Result<Option<Arc<RequestProcessor>>, DispatchError> {
        let Some(routing) = self.routing.get() else {
            return Ok(None);
        };
        Ok(routing
            .table
            .try_get_best_match(message)?
            .and_then(|&idx| routing.processors.get(idx).cloned()))
    }

    /// The endpoint whose address and contract filters both match, preferring
    /// the highest filter priority.
    ///
    /// Before `open` the table is built on the fly from the current endpoints.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::AmbiguousMatch` when two endpoints match at the
    /// top priority, and `DispatchError::Configuration` if an endpoint lacks a
    /// filter before the dispatcher opened.
    pub fn find_endpoint_dispatcher(
        &self,
        message: &Message,
    ) -> Result<Option<Arc<EndpointDispatcher>>, DispatchError> {
        if self.routing.get().is_some() {
            return Ok(self
                .route(message)?
                .map(|processor| Arc::clone(processor.endpoint())));
        }
        let endpoints = self.endpoints();
        let table = build_table(&endpoints)?;
        Ok(table
            .try_get_best_match(message)?
            .and_then(|&idx| endpoints.get(idx).cloned()))
    }

    /// Let the host claim an unroutable message, else answer with an
    /// addressing fault where the channel can carry one.
    async fn unknown_message(
        &self,
        channel: &Arc<dyn Channel>,
        message: Message,
        mut target: ReplyTarget,
    ) {
        if let Some(host) = self.host() {
            if host.on_unknown_message(channel.as_ref(), &message) {
                debug!(action = ?message.action(), "unknown message claimed by host");
                return;
            }
        }

        let version = self.config.message_version;
        let address_matched = self.endpoints().iter().any(|endpoint| {
            endpoint
                .address_filter()
                .is_some_and(|filter| filter.matches(&message))
        });
        debug!(
            to = ?message.headers().to,
            action = ?message.action(),
            address_matched,
            "no endpoint matched message"
        );
        let body = if address_matched {
            action_not_supported(version, message.action().unwrap_or_default())
        } else {
            destination_unreachable(version, message.headers().to.as_deref())
        };

        if !target.can_reply() {
            return;
        }
        let Ok(mut fault) = Message::fault(version, &body, None) else {
            if let ReplyTarget::Request(request) = &mut target {
                request.close();
            }
            return;
        };
        correlate_reply(
            &mut fault,
            message.headers(),
            channel.session_id().is_some(),
            self.config.manual_addressing,
        );
        let timeout = self.config.timeouts.send;
        let sent = match &mut target {
            ReplyTarget::Request(request) => request.reply(fault, timeout).await,
            ReplyTarget::Channel => channel.send(fault, timeout).await,
            ReplyTarget::None => Ok(()),
        };
        if let Err(err) = sent {
            warn!(error = %err, "failed to send unmatched-message fault");
        }
    }
}

impl std::fmt::Debug for ChannelDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelDispatcher")
            .field("uri", &self.listener.uri())
            .field("state", &self.lifecycle.state())
            .field("endpoints", &self.endpoints.lock().len())
            .field("channels", &self.registry.count())
            .finish_non_exhaustive()
    }
}

/// Filter table over `address ∧ contract` per endpoint, keyed by index.
fn build_table(
    endpoints: &[Arc<EndpointDispatcher>],
) -> Result<MessageFilterTable<usize>, ConfigError> {
    let mut table = MessageFilterTable::new();
    for (idx, endpoint) in endpoints.iter().enumerate() {
        let (Some(address), Some(contract)) = (endpoint.address_filter(), endpoint.contract_filter())
        else {
            return Err(ConfigError::MissingFilter {
                endpoint: endpoint.name(),
                kind: if endpoint.address_filter().is_none() {
                    "address"
                } else {
                    "contract"
                },
            });
        };
        let filter = Arc::new(AndMessageFilter::new(Arc::clone(address), Arc::clone(contract)));
        table.add(filter, idx, endpoint.filter_priority())?;
    }
    Ok(table)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
