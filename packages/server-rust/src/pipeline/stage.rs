//! Stage trait and ordered stage chains.

use async_trait::async_trait;

use super::context::ProcessingContext;
use crate::error::DispatchError;

/// One step of request processing.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns `true` when the request is fully handled and the rest of the
    /// chain must be skipped.
    ///
    /// # Errors
    ///
    /// Any error ends the chain and is handed to the caller.
    async fn process(&self, cx: &mut ProcessingContext) -> Result<bool, DispatchError>;
}

/// Ordered, immutable list of stages.
pub struct StageChain {
    name: &'static str,
    stages: Vec<Box<dyn Stage>>,
}

impl StageChain {
    #[must_use]
    pub fn new(name: &'static str, stages: Vec<Box<dyn Stage>>) -> Self {
        Self { name, stages }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Run stages in order until one reports the request handled.
    ///
    /// # Errors
    ///
    /// Returns the first stage error; later stages do not run.
    pub async fn run(&self, cx: &mut ProcessingContext) -> Result<bool, DispatchError> {
        for stage in &self.stages {
            if stage.process(cx).await? {
                tracing::trace!(chain = self.name, stage = stage.name(), "chain stopped");
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl std::fmt::Debug for StageChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageChain")
            .field("name", &self.name)
            .field("stages", &self.stage_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use hostwire_core::{Message, MessageVersion};

    use super::*;
    use crate::channel::memory::MemoryListener;
    use crate::channel::transport::{ChannelListener, ChannelShape};
    use crate::pipeline::context::ReplyTarget;

    struct Step {
        name: &'static str,
        stop: bool,
        fail: bool,
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Stage for Step {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn process(&self, _cx: &mut ProcessingContext) -> Result<bool, DispatchError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(anyhow::anyhow!("{} failed", self.name).into());
            }
            Ok(self.stop)
        }
    }

    fn step(name: &'static str, stop: bool, fail: bool, runs: &Arc<AtomicUsize>) -> Box<dyn Stage> {
        Box::new(Step {
            name,
            stop,
            fail,
            runs: Arc::clone(runs),
        })
    }

    async fn context() -> ProcessingContext {
        let listener = MemoryListener::new("mem://host/svc");
        listener.open(std::time::Duration::from_secs(1)).await.unwrap();
        let _client = listener.connector().connect(ChannelShape::Input, None).unwrap();
        let channel = listener.accept_channel().await.unwrap().unwrap();
        ProcessingContext::new(
            1,
            Message::empty(MessageVersion::default(), "Ping"),
            MessageVersion::default(),
            channel,
            ReplyTarget::None,
        )
    }

    #[tokio::test]
    async fn runs_in_order_until_handled() {
        let runs = Arc::new(AtomicUsize::new(0));
        let chain = StageChain::new(
            "process",
            vec![
                step("a", false, false, &runs),
                step("b", true, false, &runs),
                step("c", false, false, &runs),
            ],
        );
        assert_eq!(chain.stage_names(), vec!["a", "b", "c"]);
        let mut cx = context().await;
        assert!(chain.run(&mut cx).await.unwrap());
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn error_stops_the_chain() {
        let runs = Arc::new(AtomicUsize::new(0));
        let chain = StageChain::new(
            "process",
            vec![step("a", false, true, &runs), step("b", false, false, &runs)],
        );
        let mut cx = context().await;
        assert!(chain.run(&mut cx).await.is_err());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_chain_is_not_handled() {
        let chain = StageChain::new("finalize", Vec::new());
        let mut cx = context().await;
        assert!(!chain.run(&mut cx).await.unwrap());
    }
}
