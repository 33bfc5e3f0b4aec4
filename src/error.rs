use crate::codec::CodecError;
use crate::connection::ConnectionError;
use crate::fanout::FanoutError;
use crate::pipeline::PipelineError;
use crate::publish::PublishError;
use crate::subscription::SubscriptionError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

/// Top-level error generated by `feedline` components.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("CodecError: {0}")]
    Codec(#[from] CodecError),

    #[error("ConnectionError: {0}")]
    Connection(#[from] ConnectionError),

    #[error("SubscriptionError: {0}")]
    Subscription(#[from] SubscriptionError),

    #[error("PipelineError: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("PublishError: {0}")]
    Publish(#[from] PublishError),

    #[error("FanoutError: {0}")]
    Fanout(#[from] FanoutError),

    #[error("adapter is in an invalid state for this operation: {0}")]
    InvalidState(String),
}

impl DataError {
    /// Whether the error should cease ingress rather than be retried.
    /// Transport failures recover locally with backoff; misconfiguration and
    /// invalid state do not.
    pub fn is_terminal(&self) -> bool {
        match self {
            DataError::Codec(_) | DataError::InvalidState(_) => true,
            DataError::Connection(_) | DataError::Pipeline(_) | DataError::Publish(_) => false,
            DataError::Subscription(error) => !error.is_retryable(),
            DataError::Fanout(_) => false,
        }
    }
}

/// User-visible structured error record emitted on event streams.
#[derive(Clone, PartialEq, Debug, Serialize)]
pub struct ErrorRecord {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    pub timestamp: DateTime<Utc>,
    pub context: HashMap<String, String>,
}

impl ErrorRecord {
    pub fn new<C, M>(code: C, message: M, retryable: bool) -> Self
    where
        C: Into<String>,
        M: Into<String>,
    {
        Self {
            code: code.into(),
            message: message.into(),
            retryable,
            timestamp: Utc::now(),
            context: HashMap::new(),
        }
    }

    pub fn with_context<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.context.insert(key.into(), value.into());
        self
    }
}

impl From<&SubscriptionError> for ErrorRecord {
    fn from(error: &SubscriptionError) -> Self {
        Self::new(error.kind.to_string(), error.message.clone(), error.is_retryable())
    }
}
