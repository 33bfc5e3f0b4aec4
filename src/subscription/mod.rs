use crate::{codec::StreamName, connection::ConnectionId};
use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Authoritative registry of active logical subscriptions for an adapter.
pub mod registry;

/// Normalised ticker symbol (eg/ "BTCUSDT").
///
/// Uppercase internally; exchange codecs lowercase it where the wire format
/// requires (eg/ Binance stream names).
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Deserialize, Serialize)]
#[serde(from = "String")]
pub struct Symbol(String);

impl Symbol {
    pub fn new<S>(symbol: S) -> Self
    where
        S: Into<String>,
    {
        Self(symbol.into().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Hand-written rather than derived: construction normalises the case.
impl From<String> for Symbol {
    fn from(symbol: String) -> Self {
        Self::new(symbol)
    }
}

impl From<&str> for Symbol {
    fn from(symbol: &str) -> Self {
        Self::new(symbol)
    }
}

impl AsRef<str> for Symbol {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Candlestick interval supported by the kline data type.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Deserialize, Serialize,
)]
#[serde(try_from = "String", into = "String")]
pub enum Interval {
    #[display("1m")]
    M1,
    #[display("3m")]
    M3,
    #[display("5m")]
    M5,
    #[display("15m")]
    M15,
    #[display("30m")]
    M30,
    #[display("1h")]
    H1,
    #[display("2h")]
    H2,
    #[display("4h")]
    H4,
    #[display("6h")]
    H6,
    #[display("8h")]
    H8,
    #[display("12h")]
    H12,
    #[display("1d")]
    D1,
    #[display("3d")]
    D3,
    #[display("1w")]
    W1,
    #[display("1M")]
    Mo1,
}

impl Interval {
    /// All supported intervals, in ascending duration order.
    pub const ALL: [Interval; 15] = [
        Interval::M1,
        Interval::M3,
        Interval::M5,
        Interval::M15,
        Interval::M30,
        Interval::H1,
        Interval::H2,
        Interval::H4,
        Interval::H6,
        Interval::H8,
        Interval::H12,
        Interval::D1,
        Interval::D3,
        Interval::W1,
        Interval::Mo1,
    ];
}

#[derive(Clone, Eq, PartialEq, Debug, Error)]
#[error("unknown kline interval: {0}")]
pub struct ParseIntervalError(pub String);

impl FromStr for Interval {
    type Err = ParseIntervalError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Interval::ALL
            .into_iter()
            .find(|interval| interval.to_string() == input)
            .ok_or_else(|| ParseIntervalError(input.to_owned()))
    }
}

impl TryFrom<String> for Interval {
    type Error = ParseIntervalError;

    fn try_from(input: String) -> Result<Self, Self::Error> {
        Interval::from_str(&input)
    }
}

impl From<Interval> for String {
    fn from(interval: Interval) -> Self {
        interval.to_string()
    }
}

/// Order book depth levels supported by the depth data type.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize)]
pub enum DepthLevels {
    Five,
    Ten,
    Twenty,
}

impl DepthLevels {
    pub fn as_u16(&self) -> u16 {
        match self {
            DepthLevels::Five => 5,
            DepthLevels::Ten => 10,
            DepthLevels::Twenty => 20,
        }
    }

    pub fn from_u16(levels: u16) -> Option<Self> {
        match levels {
            5 => Some(DepthLevels::Five),
            10 => Some(DepthLevels::Ten),
            20 => Some(DepthLevels::Twenty),
            _ => None,
        }
    }
}

/// Order book update speed supported by the depth data type.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize)]
pub enum UpdateSpeed {
    Ms100,
    Ms1000,
}

impl UpdateSpeed {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateSpeed::Ms100 => "100ms",
            UpdateSpeed::Ms1000 => "1000ms",
        }
    }
}

/// Optional parameters qualifying a depth subscription. Renders as the
/// canonical params digest (eg/ "20@100ms", empty when unqualified).
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Deserialize, Serialize,
)]
pub struct DepthParams {
    pub levels: Option<DepthLevels>,
    pub speed: Option<UpdateSpeed>,
}

// Hand-written rather than derived: both parts are conditional.
impl std::fmt::Display for DepthParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(levels) = self.levels {
            write!(f, "{}", levels.as_u16())?;
        }
        if let Some(speed) = self.speed {
            write!(f, "@{}", speed.as_str())?;
        }
        Ok(())
    }
}

/// Normalised market data type of a [`Subscription`].
///
/// The canonical string form (eg/ "trade", "kline_1m", "depth20@100ms")
/// doubles as the parameter digest used in [`SubscriptionKey`]s and fan-out
/// frames.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Deserialize, Serialize,
)]
#[serde(try_from = "String", into = "String")]
pub enum DataType {
    #[display("trade")]
    Trade,
    #[display("ticker")]
    Ticker,
    #[display("kline_{_0}")]
    Kline(Interval),
    #[display("depth{_0}")]
    Depth(DepthParams),
}

/// Parameter-free class of a [`DataType`]. Used by validation blacklists and
/// capability checks where the parameters are irrelevant.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Deserialize, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DataTypeKind {
    #[display("trade")]
    Trade,
    #[display("ticker")]
    Ticker,
    #[display("kline")]
    Kline,
    #[display("depth")]
    Depth,
}

impl DataType {
    pub fn kind(&self) -> DataTypeKind {
        match self {
            DataType::Trade => DataTypeKind::Trade,
            DataType::Ticker => DataTypeKind::Ticker,
            DataType::Kline(_) => DataTypeKind::Kline,
            DataType::Depth(_) => DataTypeKind::Depth,
        }
    }

    /// Canonical digest of the parameters carried by this [`DataType`]. Empty
    /// for parameter-free types.
    pub fn params_digest(&self) -> String {
        match self {
            DataType::Trade | DataType::Ticker => String::new(),
            DataType::Kline(interval) => interval.to_string(),
            DataType::Depth(params) => params.to_string(),
        }
    }
}

#[derive(Clone, Eq, PartialEq, Debug, Error)]
#[error("unknown data type: {0}")]
pub struct ParseDataTypeError(pub String);

impl FromStr for DataType {
    type Err = ParseDataTypeError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "trade" => return Ok(DataType::Trade),
            "ticker" => return Ok(DataType::Ticker),
            _ => {}
        }

        if let Some(interval) = input.strip_prefix("kline_") {
            return interval
                .parse()
                .map(DataType::Kline)
                .map_err(|_| ParseDataTypeError(input.to_owned()));
        }

        if let Some(rest) = input.strip_prefix("depth") {
            let (levels_part, speed_part) = match rest.split_once('@') {
                Some((levels, speed)) => (levels, Some(speed)),
                None => (rest, None),
            };

            let levels = if levels_part.is_empty() {
                None
            } else {
                let levels = levels_part
                    .parse::<u16>()
                    .ok()
                    .and_then(DepthLevels::from_u16)
                    .ok_or_else(|| ParseDataTypeError(input.to_owned()))?;
                Some(levels)
            };

            let speed = match speed_part {
                None => None,
                Some("100ms") => Some(UpdateSpeed::Ms100),
                Some("1000ms") => Some(UpdateSpeed::Ms1000),
                Some(_) => return Err(ParseDataTypeError(input.to_owned())),
            };

            return Ok(DataType::Depth(DepthParams { levels, speed }));
        }

        Err(ParseDataTypeError(input.to_owned()))
    }
}

impl TryFrom<String> for DataType {
    type Error = ParseDataTypeError;

    fn try_from(input: String) -> Result<Self, Self::Error> {
        DataType::from_str(&input)
    }
}

impl From<DataType> for String {
    fn from(data_type: DataType) -> Self {
        data_type.to_string()
    }
}

/// Logical market data subscription for a single `(Symbol, DataType)` pair.
#[derive(
    Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Deserialize, Serialize,
)]
#[display("{symbol}|{data_type}")]
pub struct Subscription {
    pub symbol: Symbol,
    #[serde(rename = "type")]
    pub data_type: DataType,
}

impl Subscription {
    pub fn new<S>(symbol: S, data_type: DataType) -> Self
    where
        S: Into<Symbol>,
    {
        Self {
            symbol: symbol.into(),
            data_type,
        }
    }

    /// Unique key identifying this [`Subscription`] within an adapter.
    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey::from_parts(&self.symbol, &self.data_type)
    }
}

impl<S> From<(S, DataType)> for Subscription
where
    S: Into<Symbol>,
{
    fn from((symbol, data_type): (S, DataType)) -> Self {
        Self::new(symbol, data_type)
    }
}

/// Registry key in the form `SYMBOL:kind[:params]` (eg/ "BTCUSDT:kline:1m").
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Deserialize, Serialize)]
pub struct SubscriptionKey(String);

impl SubscriptionKey {
    pub fn from_parts(symbol: &Symbol, data_type: &DataType) -> Self {
        let digest = data_type.params_digest();
        if digest.is_empty() {
            Self(format!("{}:{}", symbol, data_type.kind()))
        } else {
            Self(format!("{}:{}:{}", symbol, data_type.kind(), digest))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for SubscriptionKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lifecycle state of a [`SubscriptionRecord`].
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Pending,
    Active,
    Paused,
    Failed,
    Cancelled,
}

/// Bookkeeping for one active logical subscription held by the
/// [`SubscriptionRegistry`](registry::SubscriptionRegistry).
#[derive(Clone, Debug)]
pub struct SubscriptionRecord {
    pub subscription: Subscription,
    pub key: SubscriptionKey,
    pub stream: StreamName,
    pub connection: ConnectionId,
    pub state: SubscriptionState,
    pub subscribed_at: DateTime<Utc>,
    pub last_active_at: Option<DateTime<Utc>>,
    pub message_count: u64,
    pub error_count: u64,
    pub last_error: Option<SubscriptionError>,
}

/// Classified subscription failure. `retryable` is derived from the kind,
/// never assigned ad hoc.
#[derive(Clone, Eq, PartialEq, Debug, Error, Deserialize, Serialize)]
#[error("{kind}: {message}")]
pub struct SubscriptionError {
    pub kind: SubscriptionErrorKind,
    pub message: String,
}

impl SubscriptionError {
    pub fn new<S>(kind: SubscriptionErrorKind, message: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Deserialize, Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionErrorKind {
    #[display("INVALID_STREAM_NAME")]
    InvalidStreamName,
    #[display("UNSUPPORTED_DATA_TYPE")]
    UnsupportedDataType,
    #[display("SYMBOL_NOT_FOUND")]
    SymbolNotFound,
    #[display("CONNECTION_NOT_AVAILABLE")]
    ConnectionNotAvailable,
    #[display("MAX_STREAMS_EXCEEDED")]
    MaxStreamsExceeded,
    #[display("SUBSCRIPTION_TIMEOUT")]
    SubscriptionTimeout,
    #[display("NETWORK_ERROR")]
    NetworkError,
    #[display("UNKNOWN_ERROR")]
    UnknownError,
}

impl SubscriptionErrorKind {
    /// Whether a failure of this kind is worth retrying. Policy and validation
    /// rejections are final; transport-shaped failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SubscriptionErrorKind::ConnectionNotAvailable
                | SubscriptionErrorKind::SubscriptionTimeout
                | SubscriptionErrorKind::NetworkError
        )
    }
}
