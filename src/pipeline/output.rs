use super::stage::{Stage, StageContext, StageError, StageFlow};
use crate::envelope::Envelope;
use crate::publish::Dispatcher;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

/// Output stage: hands each envelope to the injected publisher, one publish
/// per resolved routing key.
///
/// When a [`BufferStage`](super::buffer::BufferStage) sits ahead of it,
/// envelopes are consumed there and published in batches instead; this stage
/// then only serves pipelines with buffering disabled.
pub struct OutputStage {
    dispatcher: Arc<Dispatcher>,
}

impl OutputStage {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl Stage for OutputStage {
    fn name(&self) -> &'static str {
        "output"
    }

    async fn process(
        &self,
        mut envelope: Envelope,
        _: &mut StageContext,
    ) -> Result<StageFlow, StageError> {
        envelope.processed_at = Some(Utc::now());
        self.dispatcher.dispatch(&envelope).await?;
        Ok(StageFlow::Continue(envelope))
    }
}
