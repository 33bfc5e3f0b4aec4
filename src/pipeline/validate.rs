use super::stage::{Stage, StageContext, StageError, StageFlow};
use crate::envelope::Envelope;
use crate::event::MarketEvent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Validation stage tolerances. Events with an exchange time outside
/// `[now - max_age, now + max_future_drift]` are rejected, guarding against
/// clock skew and stale replays.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ValidateConfig {
    pub max_future_drift_ms: i64,
    pub max_age_ms: i64,
}

impl Default for ValidateConfig {
    fn default() -> Self {
        Self {
            max_future_drift_ms: 60_000,
            max_age_ms: 300_000,
        }
    }
}

/// Pre-stage contract check on every envelope.
#[derive(Debug, Default)]
pub struct ValidateStage {
    config: ValidateConfig,
}

impl ValidateStage {
    pub fn new(config: ValidateConfig) -> Self {
        Self { config }
    }

    fn check(&self, event: &MarketEvent, now: DateTime<Utc>) -> Result<(), StageError> {
        if event.symbol.as_str().is_empty() {
            return Err(StageError::Validation("symbol is empty".to_string()));
        }

        let drift_ms = event.exchange_time.timestamp_millis() - now.timestamp_millis();
        if drift_ms > self.config.max_future_drift_ms {
            return Err(StageError::Validation(format!(
                "event time {}ms ahead of ingest clock (max {}ms)",
                drift_ms, self.config.max_future_drift_ms
            )));
        }

        if -drift_ms > self.config.max_age_ms {
            return Err(StageError::Validation(format!(
                "event time {}ms behind ingest clock (max {}ms)",
                -drift_ms, self.config.max_age_ms
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl Stage for ValidateStage {
    fn name(&self) -> &'static str {
        "validate"
    }

    async fn process(
        &self,
        envelope: Envelope,
        _: &mut StageContext,
    ) -> Result<StageFlow, StageError> {
        self.check(&envelope.event, Utc::now())?;
        Ok(StageFlow::Continue(envelope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::test_util;
    use crate::exchange::ExchangeId;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn event_with_offset_ms(now: DateTime<Utc>, offset_ms: i64) -> MarketEvent {
        let mut event = test_util::market_trade(ExchangeId::Binance, "BTCUSDT", dec!(100));
        event.exchange_time = now + Duration::milliseconds(offset_ms);
        event
    }

    #[test]
    fn test_event_time_boundaries() {
        struct TestCase {
            input: i64,
            expected: bool,
        }

        let cases = vec![
            TestCase {
                // TC0: exactly at the future drift tolerance
                input: 60_000,
                expected: true,
            },
            TestCase {
                // TC1: one millisecond beyond the future drift tolerance
                input: 60_001,
                expected: false,
            },
            TestCase {
                // TC2: exactly at the staleness tolerance
                input: -300_000,
                expected: true,
            },
            TestCase {
                // TC3: one millisecond beyond the staleness tolerance
                input: -300_001,
                expected: false,
            },
            TestCase {
                // TC4: present time
                input: 0,
                expected: true,
            },
        ];

        let stage = ValidateStage::new(ValidateConfig::default());
        let now = Utc::now();

        for (index, test) in cases.into_iter().enumerate() {
            let event = event_with_offset_ms(now, test.input);
            let actual = stage.check(&event, now).is_ok();
            assert_eq!(actual, test.expected, "TC{index} failed at {}ms", test.input);
        }
    }

    #[test]
    fn test_empty_symbol_rejected() {
        let stage = ValidateStage::new(ValidateConfig::default());
        let now = Utc::now();
        let mut event = event_with_offset_ms(now, 0);
        event.symbol = crate::subscription::Symbol::new("");

        assert!(matches!(
            stage.check(&event, now),
            Err(StageError::Validation(_))
        ));
    }
}
