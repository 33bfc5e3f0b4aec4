use crate::exchange::ExchangeId;
use crate::subscription::{DataType, DepthParams, Interval, Symbol};
use chrono::{DateTime, Utc};
use derive_more::{Constructor, Display, From};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Normalised market event. Immutable once emitted by an adapter.
///
/// All numeric price and quantity fields are [`Decimal`]s parsed from the
/// exchange's decimal strings, preserving precision through to publish.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct MarketEvent {
    pub exchange: ExchangeId,
    pub symbol: Symbol,
    pub exchange_time: DateTime<Utc>,
    pub received_time: DateTime<Utc>,
    pub kind: DataKind,
}

impl MarketEvent {
    /// The subscription-facing [`DataType`] of this event.
    pub fn data_type(&self) -> DataType {
        self.kind.data_type()
    }

    /// Scalar price of this event, where the payload has one. Used by fan-out
    /// price-range filters; `None` admits the event by that dimension.
    pub fn price(&self) -> Option<Decimal> {
        match &self.kind {
            DataKind::Trade(trade) => Some(trade.price),
            DataKind::Ticker(ticker) => Some(ticker.last),
            DataKind::Candle(candle) => Some(candle.close),
            DataKind::OrderBook(_) => None,
        }
    }
}

/// Defines the payload variant of a [`MarketEvent`].
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub enum DataKind {
    Trade(PublicTrade),
    Ticker(Ticker),
    Candle(Candle),
    OrderBook(OrderBookUpdate),
}

impl DataKind {
    pub fn data_type(&self) -> DataType {
        match self {
            DataKind::Trade(_) => DataType::Trade,
            DataKind::Ticker(_) => DataType::Ticker,
            DataKind::Candle(candle) => DataType::Kline(candle.interval),
            DataKind::OrderBook(_) => DataType::Depth(DepthParams::default()),
        }
    }
}

/// Side of a trade, from the taker's perspective.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Deserialize, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    #[display("buy")]
    Buy,
    #[display("sell")]
    Sell,
}

/// Normalised public trade.
#[derive(Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
pub struct PublicTrade {
    pub id: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub side: Side,
    pub time: DateTime<Utc>,
}

/// Normalised 24h rolling window ticker.
#[derive(Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
pub struct Ticker {
    pub last: Decimal,
    pub bid: Decimal,
    pub ask: Decimal,
    pub volume: Decimal,
    pub price_change: Decimal,
    pub price_change_pct: Decimal,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub window_open: DateTime<Utc>,
    pub window_close: DateTime<Utc>,
}

/// Normalised OHLCV candle.
#[derive(Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
pub struct Candle {
    pub interval: Interval,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub trade_count: u64,
    /// Whether this candle window has closed.
    pub closed: bool,
}

/// Normalised order book level update or snapshot.
#[derive(Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
pub struct OrderBookUpdate {
    pub first_update_id: Option<u64>,
    pub last_update_id: u64,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
    pub snapshot: bool,
}

/// Normalised order book [`Level`].
#[derive(Clone, Copy, Eq, PartialEq, Debug, Constructor, From, Deserialize, Serialize)]
pub struct Level {
    pub price: Decimal,
    pub quantity: Decimal,
}

#[cfg(test)]
pub mod test_util {
    use super::*;
    use rust_decimal_macros::dec;

    /// Build a [`MarketEvent`] of [`DataKind::Trade`] for the provided symbol.
    pub fn market_trade(exchange: ExchangeId, symbol: &str, price: Decimal) -> MarketEvent {
        let now = Utc::now();
        MarketEvent {
            exchange,
            symbol: Symbol::new(symbol),
            exchange_time: now,
            received_time: now,
            kind: DataKind::Trade(PublicTrade {
                id: "1042".to_string(),
                price,
                quantity: dec!(0.5),
                side: Side::Buy,
                time: now,
            }),
        }
    }

    /// Build a [`MarketEvent`] of [`DataKind::Ticker`] for the provided symbol.
    pub fn market_ticker(exchange: ExchangeId, symbol: &str, last: Decimal) -> MarketEvent {
        let now = Utc::now();
        MarketEvent {
            exchange,
            symbol: Symbol::new(symbol),
            exchange_time: now,
            received_time: now,
            kind: DataKind::Ticker(Ticker {
                last,
                bid: last - dec!(0.5),
                ask: last + dec!(0.5),
                volume: dec!(1000),
                price_change: dec!(10),
                price_change_pct: dec!(0.1),
                open: last - dec!(10),
                high: last + dec!(20),
                low: last - dec!(20),
                window_open: now,
                window_close: now,
            }),
        }
    }
}
