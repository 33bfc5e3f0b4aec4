use super::stage::{Stage, StageContext, StageError, StageFlow};
use crate::envelope::Envelope;
use crate::event::MarketEvent;
use crate::subscription::Symbol;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

/// Injected type-safe payload normalisation hook.
pub type PayloadNormalizer = Arc<dyn Fn(&mut MarketEvent) + Send + Sync>;

/// Normalisation stage: canonical symbol casing, ingress timestamp backfill,
/// and an optional injected payload normaliser.
///
/// Exchange identifiers are typed ([`crate::exchange::ExchangeId`]) and
/// therefore already canonical lowercase on the wire.
#[derive(Default)]
pub struct TransformStage {
    normalizer: Option<PayloadNormalizer>,
}

impl TransformStage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_normalizer(normalizer: PayloadNormalizer) -> Self {
        Self {
            normalizer: Some(normalizer),
        }
    }
}

#[async_trait]
impl Stage for TransformStage {
    fn name(&self) -> &'static str {
        "transform"
    }

    async fn process(
        &self,
        mut envelope: Envelope,
        _: &mut StageContext,
    ) -> Result<StageFlow, StageError> {
        envelope.event.symbol = Symbol::new(envelope.event.symbol.as_str());

        // Adapters stamp received_time on ingress; backfill if a source left
        // the epoch sentinel.
        if envelope.event.received_time.timestamp_millis() == 0 {
            envelope.event.received_time = Utc::now();
        }

        if let Some(normalizer) = &self.normalizer {
            normalizer(&mut envelope.event);
        }

        Ok(StageFlow::Continue(envelope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeId;
    use crate::event::{test_util, DataKind};
    use crate::exchange::ExchangeId;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_transform_applies_injected_normalizer() {
        let stage = TransformStage::with_normalizer(Arc::new(|event: &mut MarketEvent| {
            if let DataKind::Trade(trade) = &mut event.kind {
                trade.id = format!("binance-{}", trade.id);
            }
        }));

        let event = test_util::market_trade(ExchangeId::Binance, "btcusdt", dec!(100));
        let envelope = Envelope::new(EnvelopeId(1), event);

        let flow = stage
            .process(envelope, &mut StageContext::default())
            .await
            .unwrap();

        let StageFlow::Continue(envelope) = flow else {
            panic!("expected Continue");
        };
        assert_eq!(envelope.event.symbol.as_str(), "BTCUSDT");
        match envelope.event.kind {
            DataKind::Trade(trade) => assert_eq!(trade.id, "binance-1042"),
            other => panic!("expected Trade, got: {other:?}"),
        }
    }
}
