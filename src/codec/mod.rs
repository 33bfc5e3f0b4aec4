use crate::subscription::Subscription;
use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use url::Url;

/// Binance flavoured [`StreamCodec`] implementation.
pub mod binance;

/// Default maximum number of logical streams multiplexed onto one combined
/// WebSocket connection.
pub const DEFAULT_MAX_STREAMS: usize = 1024;

/// Exchange wire stream name (eg/ "btcusdt@trade"). Lowercase on the wire.
#[derive(
    Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, From, Deserialize, Serialize,
)]
#[from(forward)]
pub struct StreamName(String);

impl StreamName {
    pub fn new<S>(name: S) -> Self
    where
        S: Into<String>,
    {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for StreamName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Bidirectional mapping between logical [`Subscription`]s and exchange wire
/// [`StreamName`]s.
///
/// `parse` is the left inverse of `build` modulo symbol casing: for every
/// supported [`Subscription`] `s`, `parse(build(s)) == Some(s)`. Unknown wire
/// formats yield `None` rather than an error so that frames racing an
/// unsubscribe can be dropped silently.
pub trait StreamCodec
where
    Self: Send + Sync,
{
    /// Build the wire [`StreamName`] for the provided [`Subscription`].
    fn build(&self, subscription: &Subscription) -> Result<StreamName, CodecError>;

    /// Parse a wire stream name back into the logical [`Subscription`] it
    /// represents, or `None` if the name is not recognised.
    fn parse(&self, name: &str) -> Option<Subscription>;

    /// Whether the provided wire stream name is well formed for this codec.
    fn validate(&self, name: &str) -> bool {
        self.parse(name).is_some()
    }
}

/// Build a combined-stream connection URL in the form
/// `{base}/stream?streams={name1}/{name2}/...`.
///
/// Duplicate names are removed (first occurrence wins, order preserved). An
/// empty stream set and a set exceeding `max_streams` are both refused.
pub fn combined_stream_url(
    base: &str,
    names: &[StreamName],
    max_streams: usize,
) -> Result<Url, CodecError> {
    let mut seen = HashSet::with_capacity(names.len());
    let unique = names
        .iter()
        .filter(|name| seen.insert(name.as_str()))
        .map(StreamName::as_str)
        .collect::<Vec<_>>();

    if unique.is_empty() {
        return Err(CodecError::EmptyStreamSet);
    }

    if unique.len() > max_streams {
        return Err(CodecError::TooManyStreams {
            count: unique.len(),
            max: max_streams,
        });
    }

    let url = format!(
        "{}/stream?streams={}",
        base.trim_end_matches('/'),
        unique.join("/")
    );

    Ok(Url::parse(&url)?)
}

/// Errors generated by a [`StreamCodec`] or combined URL construction.
#[derive(Clone, Eq, PartialEq, Debug, Error)]
pub enum CodecError {
    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("unsupported data type: {0}")]
    UnsupportedDataType(String),

    #[error("invalid kline interval: {0}")]
    InvalidInterval(String),

    #[error("TooManyStreams: {count} > {max}")]
    TooManyStreams { count: usize, max: usize },

    #[error("cannot build a combined stream URL from an empty stream set")]
    EmptyStreamSet,

    #[error("error parsing Url: {0}")]
    UrlParse(#[from] url::ParseError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(names: &[&str]) -> Vec<StreamName> {
        names.iter().copied().map(StreamName::from).collect()
    }

    #[test]
    fn test_combined_stream_url_dedupes_preserving_order() {
        let url = combined_stream_url(
            "wss://stream.example:9443",
            &names(&[
                "btcusdt@trade",
                "btcusdt@trade",
                "ethusdt@trade",
                "bnbusdt@kline_1m",
            ]),
            DEFAULT_MAX_STREAMS,
        )
        .unwrap();

        assert_eq!(
            url.as_str(),
            "wss://stream.example:9443/stream?streams=btcusdt@trade/ethusdt@trade/bnbusdt@kline_1m"
        );
    }

    #[test]
    fn test_combined_stream_url_refuses_empty_set() {
        let actual = combined_stream_url("wss://stream.example:9443", &[], DEFAULT_MAX_STREAMS);
        assert_eq!(actual, Err(CodecError::EmptyStreamSet));
    }

    #[test]
    fn test_combined_stream_url_enforces_max_streams_boundary() {
        let at_cap = (0..1024)
            .map(|index| StreamName::new(format!("sym{index}@trade")))
            .collect::<Vec<_>>();
        assert!(combined_stream_url("wss://h", &at_cap, DEFAULT_MAX_STREAMS).is_ok());

        let above_cap = (0..1025)
            .map(|index| StreamName::new(format!("sym{index}@trade")))
            .collect::<Vec<_>>();
        assert_eq!(
            combined_stream_url("wss://h", &above_cap, DEFAULT_MAX_STREAMS),
            Err(CodecError::TooManyStreams {
                count: 1025,
                max: 1024
            })
        );
    }

    #[test]
    fn test_combined_stream_url_rejects_oversized_set_without_url() {
        let oversized = (0..2000)
            .map(|index| StreamName::new(format!("sym{index}@trade")))
            .collect::<Vec<_>>();

        match combined_stream_url("wss://h", &oversized, DEFAULT_MAX_STREAMS) {
            Err(CodecError::TooManyStreams { count, max }) => {
                assert_eq!(count, 2000);
                assert_eq!(max, 1024);
            }
            other => panic!("expected TooManyStreams, got: {other:?}"),
        }
    }

    #[test]
    fn test_combined_stream_url_trims_trailing_base_slash() {
        let url = combined_stream_url(
            "wss://stream.example:9443/",
            &names(&["btcusdt@trade"]),
            DEFAULT_MAX_STREAMS,
        )
        .unwrap();

        assert_eq!(
            url.as_str(),
            "wss://stream.example:9443/stream?streams=btcusdt@trade"
        );
    }
}
