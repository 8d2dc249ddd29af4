//! Per-endpoint request processor: drives one request through the chains.

use std::fmt;
use std::sync::Arc;

use tracing::{error, info_span, warn, Instrument};

use super::context::ProcessingContext;
use super::stage::{Stage, StageChain};
use super::stages::{
    CloseIfIdle, CloseTerminatingChannel, CompleteRequest, HandleError, InitializeInstanceContext,
    InvokeOperation, OpenInstanceContext, ProvideFault, ReleaseInstance, SendFault, SendReply,
    StageEnv,
};
use crate::dispatcher::config::DispatcherConfig;
use crate::dispatcher::endpoint::EndpointDispatcher;
use crate::dispatcher::fault::{ErrorHandler, SessionShutdownHandler};
use crate::error::DispatchError;
use crate::instance::InstanceManager;

/// Runs requests for one endpoint through the initialize, process, error,
/// and finalize chains.
///
/// The chains are built once when the dispatcher opens and never change
/// afterwards; every request gets its own [`ProcessingContext`].
pub struct RequestProcessor {
    env: Arc<StageEnv>,
    initialize: StageChain,
    process: StageChain,
    error: StageChain,
    finalize: StageChain,
}

impl RequestProcessor {
    #[must_use]
    pub fn new(
        endpoint: Arc<EndpointDispatcher>,
        config: DispatcherConfig,
        error_handlers: Vec<Arc<dyn ErrorHandler>>,
        shutdown_handlers: Vec<Arc<dyn SessionShutdownHandler>>,
    ) -> Self {
        let instances = Arc::new(InstanceManager::from_runtime(
            endpoint.name(),
            endpoint.runtime(),
        ));
        let mut env = StageEnv::new(endpoint, instances, config);
        env.error_handlers = error_handlers;
        env.shutdown_handlers = shutdown_handlers;
        let env = Arc::new(env);

        let initialize = StageChain::new(
            "initialize",
            vec![Box::new(InitializeInstanceContext(Arc::clone(&env))) as Box<dyn Stage>],
        );
        let process = StageChain::new(
            "process",
            vec![
                Box::new(OpenInstanceContext(Arc::clone(&env))) as Box<dyn Stage>,
                Box::new(InvokeOperation(Arc::clone(&env))),
                Box::new(SendReply(Arc::clone(&env))),
            ],
        );
        let error = StageChain::new(
            "error",
            vec![
                Box::new(HandleError(Arc::clone(&env))) as Box<dyn Stage>,
                Box::new(ProvideFault(Arc::clone(&env))),
                Box::new(SendFault(Arc::clone(&env))),
            ],
        );
        let finalize = StageChain::new(
            "finalize",
            vec![
                Box::new(CompleteRequest) as Box<dyn Stage>,
                Box::new(CloseTerminatingChannel(Arc::clone(&env))),
                Box::new(ReleaseInstance(Arc::clone(&env))),
                Box::new(CloseIfIdle(Arc::clone(&env))),
            ],
        );

        Self {
            env,
            initialize,
            process,
            error,
            finalize,
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &Arc<EndpointDispatcher> {
        &self.env.endpoint
    }

    #[must_use]
    pub fn instance_manager(&self) -> &Arc<InstanceManager> {
        &self.env.instances
    }

    #[must_use]
    pub fn config(&self) -> &DispatcherConfig {
        &self.env.config
    }

    /// The four chains in execution order.
    #[must_use]
    pub fn chains(&self) -> [&StageChain; 4] {
        [&self.initialize, &self.process, &self.error, &self.finalize]
    }

    /// Process one request to completion.
    ///
    /// Errors raised while processing go through the error chain; the
    /// finalize chain always runs.
    ///
    /// # Errors
    ///
    /// Returns an error from the initialize chain, or a processing error
    /// that no handler claimed and no fault was produced for. The caller
    /// should abort the channel.
    pub async fn process(&self, cx: &mut ProcessingContext) -> Result<(), DispatchError> {
        self.initialize.run(cx).await?;

        let span = info_span!(
            "request",
            call_id = cx.call_id,
            endpoint = %self.env.endpoint.name(),
            action = %cx.action(),
        );
        async {
            if let Err(err) = self.process.run(cx).await {
                cx.error = Some(err);
                if let Err(secondary) = self.error.run(cx).await {
                    warn!(error = %secondary, "error chain failed");
                }
            }
            if let Err(err) = self.finalize.run(cx).await {
                warn!(error = %err, "finalize chain failed");
            }
        }
        .instrument(span)
        .await;

        match cx.error.take() {
            Some(err) if !cx.handled && !cx.fault_produced => {
                error!(call_id = cx.call_id, error = %err, "unhandled dispatch error");
                Err(err)
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for RequestProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestProcessor")
            .field("endpoint", &self.env.endpoint.name())
            .field("initialize", &self.initialize)
            .field("process", &self.process)
            .field("error", &self.error)
            .field("finalize", &self.finalize)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
