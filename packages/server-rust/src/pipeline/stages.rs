//! Built-in stages of the four chains.
//!
//! - initialize: [`InitializeInstanceContext`]
//! - process: [`OpenInstanceContext`], [`InvokeOperation`], [`SendReply`]
//! - error: [`HandleError`], [`ProvideFault`], [`SendFault`]
//! - finalize: [`CompleteRequest`], [`CloseTerminatingChannel`],
//!   [`ReleaseInstance`], [`CloseIfIdle`]

use std::sync::Arc;

use async_trait::async_trait;
use hostwire_core::Message;
use tower::ServiceExt;
use tracing::{debug, warn};

use super::context::{correlate_reply, ProcessingContext, ReplyTarget};
use super::stage::Stage;
use crate::dispatcher::config::DispatcherConfig;
use crate::dispatcher::endpoint::EndpointDispatcher;
use crate::dispatcher::fault::{ErrorHandler, ErrorHandling, FaultPolicy, SessionShutdownHandler};
use crate::dispatcher::middleware::{build_invocation_stack, Invocation, InvocationStack};
use crate::error::DispatchError;
use crate::instance::{InstanceContext, InstanceManager};

/// Everything the stages of one endpoint share.
pub struct StageEnv {
    pub endpoint: Arc<EndpointDispatcher>,
    pub instances: Arc<InstanceManager>,
    pub config: DispatcherConfig,
    pub fault_policy: FaultPolicy,
    pub error_handlers: Vec<Arc<dyn ErrorHandler>>,
    pub shutdown_handlers: Vec<Arc<dyn SessionShutdownHandler>>,
    pub stack: InvocationStack,
}

impl StageEnv {
    #[must_use]
    pub fn new(
        endpoint: Arc<EndpointDispatcher>,
        instances: Arc<InstanceManager>,
        config: DispatcherConfig,
    ) -> Self {
        let fault_policy = FaultPolicy::new(
            config.message_version,
            config.include_exception_detail_in_faults,
            config.enable_faults,
        );
        Self {
            endpoint,
            instances,
            config,
            fault_policy,
            error_handlers: Vec::new(),
            shutdown_handlers: Vec::new(),
            stack: build_invocation_stack(),
        }
    }

    /// Correlate, run reply inspectors, and send on the request's reply target.
    async fn send(&self, cx: &mut ProcessingContext, mut message: Message) -> Result<(), DispatchError> {
        correlate_reply(
            &mut message,
            &cx.request_headers,
            cx.session_id.is_some(),
            self.config.manual_addressing,
        );
        let inspectors = self.endpoint.runtime().message_inspectors();
        for (inspector, state) in inspectors.iter().zip(cx.inspector_state.drain(..)) {
            inspector.before_send_reply(&mut message, state);
        }
        let timeout = self.config.timeouts.send;
        match &mut cx.reply_target {
            ReplyTarget::Request(request) => request.reply(message, timeout).await?,
            ReplyTarget::Channel => cx.channel.send(message, timeout).await?,
            ReplyTarget::None => return Ok(()),
        }
        cx.replied = true;
        Ok(())
    }
}

fn instance_context(cx: &ProcessingContext) -> Result<Arc<InstanceContext>, DispatchError> {
    cx.instance_context
        .clone()
        .ok_or_else(|| anyhow::anyhow!("instance context was not initialized").into())
}

// ---------------------------------------------------------------------------
// Initialize chain
// ---------------------------------------------------------------------------

/// Resolves or creates the instance context for the request's session.
pub struct InitializeInstanceContext(pub Arc<StageEnv>);

#[async_trait]
impl Stage for InitializeInstanceContext {
    fn name(&self) -> &'static str {
        "initialize-instance-context"
    }

    async fn process(&self, cx: &mut ProcessingContext) -> Result<bool, DispatchError> {
        let context = self.0.instances.get_or_create_context(cx.session_id.as_deref());
        cx.instance_context = Some(context);
        Ok(false)
    }
}

// ---------------------------------------------------------------------------
// Process chain
// ---------------------------------------------------------------------------

/// Opens the instance context and runs `after_receive_request` inspectors.
pub struct OpenInstanceContext(pub Arc<StageEnv>);

#[async_trait]
impl Stage for OpenInstanceContext {
    fn name(&self) -> &'static str {
        "open-instance-context"
    }

    async fn process(&self, cx: &mut ProcessingContext) -> Result<bool, DispatchError> {
        instance_context(cx)?.open()?;
        let Some(request) = cx.request.as_mut() else {
            return Ok(false);
        };
        let inspectors = self.0.endpoint.runtime().message_inspectors();
        if !inspectors.is_empty() {
            cx.inspector_state = inspectors
                .iter()
                .map(|inspector| inspector.after_receive_request(request))
                .collect();
            cx.request_headers = request.headers().clone();
        }
        Ok(false)
    }
}

/// Selects the operation, decodes parameters, invokes, and builds the reply.
pub struct InvokeOperation(pub Arc<StageEnv>);

#[async_trait]
impl Stage for InvokeOperation {
    fn name(&self) -> &'static str {
        "invoke-operation"
    }

    async fn process(&self, cx: &mut ProcessingContext) -> Result<bool, DispatchError> {
        let env = &self.0;
        let mut request = cx
            .request
            .take()
            .ok_or_else(|| anyhow::anyhow!("request message was already consumed"))?;
        let operation = env
            .endpoint
            .runtime()
            .select_operation(&request)
            .ok_or_else(|| DispatchError::ActionNotSupported {
                action: cx.action().to_string(),
            })?;
        cx.operation = Some(Arc::clone(&operation));
        debug!(operation = operation.name(), "operation selected");

        let context = instance_context(cx)?;
        let _call = tokio::select! {
            call = context.enter_call() => call?,
            () = cx.cancellation.cancelled() => {
                return Err(DispatchError::ObjectDisposed { what: "channel dispatcher" });
            }
        };

        env.instances
            .release_if_configured(&context, operation.release_instance(), true);
        let instance = env
            .instances
            .get_or_create_service_instance(&context, Some(&request))?;
        cx.instance = Some(Arc::clone(&instance));

        let mut inputs = operation.invoker().allocate_inputs();
        operation
            .formatter()
            .deserialize_request(&mut request, &mut inputs)?;
        request.close();

        let correlations: Vec<_> = operation
            .parameter_inspectors()
            .iter()
            .map(|inspector| inspector.before_call(operation.name(), &inputs))
            .collect();

        let output = env
            .stack
            .clone()
            .oneshot(Invocation {
                call_id: cx.call_id,
                operation: Arc::clone(&operation),
                instance,
                inputs,
                timeout: env.config.timeouts.operation,
            })
            .await?;

        for (inspector, correlation) in operation.parameter_inspectors().iter().zip(correlations) {
            inspector.after_call(operation.name(), &output.outputs, &output.result, correlation);
        }

        if !operation.is_one_way() {
            cx.reply = Some(operation.formatter().serialize_reply(
                cx.version,
                operation.reply_action(),
                &output.outputs,
                output.result,
            )?);
        }
        Ok(false)
    }
}

/// Sends the reply built by [`InvokeOperation`], if any.
pub struct SendReply(pub Arc<StageEnv>);

#[async_trait]
impl Stage for SendReply {
    fn name(&self) -> &'static str {
        "send-reply"
    }

    async fn process(&self, cx: &mut ProcessingContext) -> Result<bool, DispatchError> {
        let Some(reply) = cx.reply.take() else {
            return Ok(false);
        };
        if cx.is_one_way() || cx.replied {
            return Ok(false);
        }
        self.0.send(cx, reply).await?;
        Ok(false)
    }
}

// ---------------------------------------------------------------------------
// Error chain
// ---------------------------------------------------------------------------

/// Runs error handlers in registration order until one claims the error.
pub struct HandleError(pub Arc<StageEnv>);

#[async_trait]
impl Stage for HandleError {
    fn name(&self) -> &'static str {
        "handle-error"
    }

    async fn process(&self, cx: &mut ProcessingContext) -> Result<bool, DispatchError> {
        let Some(error) = cx.error.as_ref() else {
            return Ok(false);
        };
        for handler in &self.0.error_handlers {
            match handler.handle_error(error) {
                ErrorHandling::Unhandled => continue,
                ErrorHandling::Handled => {
                    cx.handled = true;
                    break;
                }
                ErrorHandling::Shutdown => {
                    cx.handled = true;
                    cx.terminate_session = true;
                    for shutdown in &self.0.shutdown_handlers {
                        shutdown.session_shutdown(cx.session_id.as_deref());
                    }
                    break;
                }
            }
        }
        Ok(false)
    }
}

/// Turns the error into a fault message through the fault policy.
pub struct ProvideFault(pub Arc<StageEnv>);

#[async_trait]
impl Stage for ProvideFault {
    fn name(&self) -> &'static str {
        "provide-fault"
    }

    async fn process(&self, cx: &mut ProcessingContext) -> Result<bool, DispatchError> {
        let Some(error) = cx.error.as_ref() else {
            return Ok(false);
        };
        let env = &self.0;
        cx.fault = env
            .fault_policy
            .build_fault(error, cx.operation.as_deref(), &env.error_handlers);
        cx.fault_produced = cx.fault.is_some();
        Ok(false)
    }
}

/// Sends the fault in place of a reply, unless one-way or already replied.
pub struct SendFault(pub Arc<StageEnv>);

#[async_trait]
impl Stage for SendFault {
    fn name(&self) -> &'static str {
        "send-fault"
    }

    async fn process(&self, cx: &mut ProcessingContext) -> Result<bool, DispatchError> {
        let Some(fault) = cx.fault.take() else {
            return Ok(false);
        };
        if cx.is_one_way() || cx.replied || !cx.reply_target.can_reply() {
            return Ok(false);
        }
        self.0.send(cx, fault).await?;
        Ok(false)
    }
}

// ---------------------------------------------------------------------------
// Finalize chain
// ---------------------------------------------------------------------------

/// Completes a request/reply exchange that produced no reply.
pub struct CompleteRequest;

#[async_trait]
impl Stage for CompleteRequest {
    fn name(&self) -> &'static str {
        "complete-request"
    }

    async fn process(&self, cx: &mut ProcessingContext) -> Result<bool, DispatchError> {
        if let ReplyTarget::Request(request) = &mut cx.reply_target {
            if !cx.replied {
                request.close();
            }
        }
        Ok(false)
    }
}

/// Closes the session channel after a terminating operation or a session
/// shutdown requested by an error handler.
pub struct CloseTerminatingChannel(pub Arc<StageEnv>);

#[async_trait]
impl Stage for CloseTerminatingChannel {
    fn name(&self) -> &'static str {
        "close-terminating-channel"
    }

    async fn process(&self, cx: &mut ProcessingContext) -> Result<bool, DispatchError> {
        let terminating = cx.session_id.is_some()
            && cx.operation.as_ref().is_some_and(|op| op.is_terminating());
        if terminating || cx.terminate_session {
            debug!(session_id = ?cx.session_id, "closing session channel");
            if let Err(err) = cx.channel.close(self.0.config.timeouts.close).await {
                warn!(error = %err, "session channel did not close cleanly; aborting");
                cx.channel.abort();
            }
        }
        Ok(false)
    }
}

/// Releases the service instance after the call when the operation asks for it.
pub struct ReleaseInstance(pub Arc<StageEnv>);

#[async_trait]
impl Stage for ReleaseInstance {
    fn name(&self) -> &'static str {
        "release-instance"
    }

    async fn process(&self, cx: &mut ProcessingContext) -> Result<bool, DispatchError> {
        cx.instance = None;
        if let (Some(operation), Some(context)) = (&cx.operation, &cx.instance_context) {
            self.0
                .instances
                .release_if_configured(context, operation.release_instance(), false);
        }
        Ok(false)
    }
}

/// Closes the instance context when its provider no longer needs it.
pub struct CloseIfIdle(pub Arc<StageEnv>);

#[async_trait]
impl Stage for CloseIfIdle {
    fn name(&self) -> &'static str {
        "close-if-idle"
    }

    async fn process(&self, cx: &mut ProcessingContext) -> Result<bool, DispatchError> {
        if let Some(context) = cx.instance_context.take() {
            self.0.instances.close_if_idle(&context);
        }
        Ok(false)
    }
}
