use super::stage::{Stage, StageContext, StageError, StageFlow};
use crate::envelope::Envelope;
use async_trait::async_trait;
use std::sync::Arc;

/// Pure predicate deciding whether an envelope continues down the chain.
pub type FilterPredicate = Arc<dyn Fn(&Envelope) -> bool + Send + Sync>;

/// Filter stage: side-effect-free predicate; a non-match consumes the
/// envelope cleanly.
pub struct FilterStage {
    predicate: FilterPredicate,
}

impl FilterStage {
    pub fn new(predicate: FilterPredicate) -> Self {
        Self { predicate }
    }
}

#[async_trait]
impl Stage for FilterStage {
    fn name(&self) -> &'static str {
        "filter"
    }

    async fn process(
        &self,
        envelope: Envelope,
        _: &mut StageContext,
    ) -> Result<StageFlow, StageError> {
        if (self.predicate)(&envelope) {
            Ok(StageFlow::Continue(envelope))
        } else {
            Ok(StageFlow::Consumed)
        }
    }
}
