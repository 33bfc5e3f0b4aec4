use crate::cache::CacheConfig;
use crate::connection::backoff::RetryPolicy;
use crate::exchange::AdapterConfig;
use crate::fanout::server::FanoutConfig;
use crate::pipeline::buffer::BufferConfig;
use crate::pipeline::router::RouterConfig;
use crate::pipeline::stage::StageConfig;
use crate::pipeline::validate::ValidateConfig;
use crate::pipeline::{ErrorHandling, PerformanceConfig};
use crate::subscription::registry::SubscriptionPolicy;
use serde::{Deserialize, Serialize};

/// Per-stage configuration overrides, keyed by stage kind.
#[derive(Clone, PartialEq, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct StageConfigs {
    pub validate: StageConfig,
    pub transform: StageConfig,
    pub filter: StageConfig,
    pub router: StageConfig,
    pub buffer: StageConfig,
    pub output: StageConfig,
}

/// Pipeline section of the service configuration.
#[derive(Clone, PartialEq, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub stages: StageConfigs,
    pub validation: ValidateConfig,
    pub error_handling: ErrorHandling,
    pub performance: PerformanceConfig,
}

/// Full typed configuration surface of the service.
///
/// Loading this from a file is the host's concern; the core only defines the
/// shape and defaults.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Topic prefix for the default `{prefix}-market-data-{exchange}` topics.
    pub topic_prefix: String,
    /// Ingest source id stamped on published message attributes.
    pub source_id: String,
    pub adapter: AdapterConfig,
    pub retry: RetryPolicy,
    pub subscriptions: SubscriptionPolicy,
    pub pipeline: PipelineConfig,
    pub buffer: BufferConfig,
    pub router: RouterConfig,
    pub fanout: FanoutConfig,
    pub cache: CacheConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "feedline".to_string(),
            source_id: "feedline-ingest".to_string(),
            adapter: AdapterConfig::default(),
            retry: RetryPolicy::default(),
            subscriptions: SubscriptionPolicy::default(),
            pipeline: PipelineConfig::default(),
            buffer: BufferConfig::default(),
            router: RouterConfig::default(),
            fanout: FanoutConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_deserialisable_from_empty_document() {
        let config = serde_json::from_str::<ServiceConfig>("{}").unwrap();
        assert_eq!(config, ServiceConfig::default());
    }

    #[test]
    fn test_partial_override_keeps_defaults() {
        let input = r#"{
            "topic_prefix": "prod",
            "retry": {"initial_delay_ms": 250, "jitter": false},
            "buffer": {"max_size": 64, "strategy": "drop"},
            "subscriptions": {"max_subscriptions": 5}
        }"#;

        let config = serde_json::from_str::<ServiceConfig>(input).unwrap();
        assert_eq!(config.topic_prefix, "prod");
        assert_eq!(config.retry.initial_delay_ms, 250);
        assert!(!config.retry.jitter);
        // Untouched sections keep their defaults.
        assert_eq!(config.retry.max_delay_ms, RetryPolicy::default().max_delay_ms);
        assert_eq!(config.buffer.max_size, 64);
        assert_eq!(config.subscriptions.max_subscriptions, 5);
        assert_eq!(config.fanout, FanoutConfig::default());
    }
}
