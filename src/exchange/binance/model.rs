use crate::event::{
    Candle, DataKind, Level, MarketEvent, OrderBookUpdate, PublicTrade, Side, Ticker,
};
use crate::exchange::de::{de_side_from_buyer_is_maker, de_u64_epoch_ms_as_datetime_utc};
use crate::exchange::ExchangeId;
use crate::subscription::{Interval, Symbol};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// `Binance` combined stream envelope wrapping every inbound data frame.
///
/// See docs: <https://binance-docs.github.io/apidocs/spot/en/#websocket-market-streams>
#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct BinancePayload {
    pub stream: String,
    pub data: BinanceMessage,
}

/// `Binance` message variants that could be received over the combined
/// stream WebSocket, dispatched by the `e` event type discriminator.
#[derive(Clone, PartialEq, Debug, Deserialize)]
#[serde(tag = "e")]
pub enum BinanceMessage {
    #[serde(rename = "trade")]
    Trade(BinanceTrade),
    #[serde(rename = "24hrTicker")]
    Ticker(BinanceTicker),
    #[serde(rename = "kline")]
    Kline(BinanceKline),
    #[serde(rename = "depthUpdate")]
    DepthUpdate(BinanceDepthUpdate),
}

impl From<(ExchangeId, BinanceMessage)> for MarketEvent {
    fn from((exchange_id, message): (ExchangeId, BinanceMessage)) -> Self {
        match message {
            BinanceMessage::Trade(trade) => MarketEvent::from((exchange_id, trade)),
            BinanceMessage::Ticker(ticker) => MarketEvent::from((exchange_id, ticker)),
            BinanceMessage::Kline(kline) => MarketEvent::from((exchange_id, kline)),
            BinanceMessage::DepthUpdate(update) => MarketEvent::from((exchange_id, update)),
        }
    }
}

/// `Binance` real-time trade message.
///
/// See docs: <https://binance-docs.github.io/apidocs/spot/en/#trade-streams>
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct BinanceTrade {
    #[serde(alias = "E", deserialize_with = "de_u64_epoch_ms_as_datetime_utc")]
    pub event_time: DateTime<Utc>,
    #[serde(alias = "s")]
    pub symbol: String,
    #[serde(alias = "t")]
    pub id: u64,
    #[serde(alias = "p")]
    pub price: Decimal,
    #[serde(alias = "q")]
    pub quantity: Decimal,
    #[serde(alias = "T", deserialize_with = "de_u64_epoch_ms_as_datetime_utc")]
    pub time: DateTime<Utc>,
    #[serde(alias = "m", deserialize_with = "de_side_from_buyer_is_maker")]
    pub side: Side,
}

impl From<(ExchangeId, BinanceTrade)> for MarketEvent {
    fn from((exchange_id, trade): (ExchangeId, BinanceTrade)) -> Self {
        Self {
            exchange: exchange_id,
            symbol: Symbol::new(trade.symbol),
            exchange_time: trade.event_time,
            received_time: Utc::now(),
            kind: DataKind::Trade(PublicTrade {
                id: trade.id.to_string(),
                price: trade.price,
                quantity: trade.quantity,
                side: trade.side,
                time: trade.time,
            }),
        }
    }
}

/// `Binance` 24h rolling window ticker message.
///
/// See docs: <https://binance-docs.github.io/apidocs/spot/en/#individual-symbol-ticker-streams>
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct BinanceTicker {
    #[serde(alias = "E", deserialize_with = "de_u64_epoch_ms_as_datetime_utc")]
    pub event_time: DateTime<Utc>,
    #[serde(alias = "s")]
    pub symbol: String,
    #[serde(alias = "p")]
    pub price_change: Decimal,
    #[serde(alias = "P")]
    pub price_change_pct: Decimal,
    #[serde(alias = "c")]
    pub last: Decimal,
    #[serde(alias = "b")]
    pub bid: Decimal,
    #[serde(alias = "a")]
    pub ask: Decimal,
    #[serde(alias = "o")]
    pub open: Decimal,
    #[serde(alias = "h")]
    pub high: Decimal,
    #[serde(alias = "l")]
    pub low: Decimal,
    #[serde(alias = "v")]
    pub volume: Decimal,
    #[serde(alias = "O", deserialize_with = "de_u64_epoch_ms_as_datetime_utc")]
    pub window_open: DateTime<Utc>,
    #[serde(alias = "C", deserialize_with = "de_u64_epoch_ms_as_datetime_utc")]
    pub window_close: DateTime<Utc>,
}

impl From<(ExchangeId, BinanceTicker)> for MarketEvent {
    fn from((exchange_id, ticker): (ExchangeId, BinanceTicker)) -> Self {
        Self {
            exchange: exchange_id,
            symbol: Symbol::new(ticker.symbol),
            exchange_time: ticker.event_time,
            received_time: Utc::now(),
            kind: DataKind::Ticker(Ticker {
                last: ticker.last,
                bid: ticker.bid,
                ask: ticker.ask,
                volume: ticker.volume,
                price_change: ticker.price_change,
                price_change_pct: ticker.price_change_pct,
                open: ticker.open,
                high: ticker.high,
                low: ticker.low,
                window_open: ticker.window_open,
                window_close: ticker.window_close,
            }),
        }
    }
}

/// `Binance` kline event message.
///
/// See docs: <https://binance-docs.github.io/apidocs/spot/en/#kline-candlestick-streams>
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct BinanceKline {
    #[serde(alias = "E", deserialize_with = "de_u64_epoch_ms_as_datetime_utc")]
    pub event_time: DateTime<Utc>,
    #[serde(alias = "s")]
    pub symbol: String,
    #[serde(alias = "k")]
    pub kline: BinanceKlineData,
}

/// Inner candle of a [`BinanceKline`] message.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct BinanceKlineData {
    #[serde(alias = "t", deserialize_with = "de_u64_epoch_ms_as_datetime_utc")]
    pub start_time: DateTime<Utc>,
    #[serde(alias = "T", deserialize_with = "de_u64_epoch_ms_as_datetime_utc")]
    pub end_time: DateTime<Utc>,
    #[serde(alias = "i")]
    pub interval: Interval,
    #[serde(alias = "o")]
    pub open: Decimal,
    #[serde(alias = "c")]
    pub close: Decimal,
    #[serde(alias = "h")]
    pub high: Decimal,
    #[serde(alias = "l")]
    pub low: Decimal,
    #[serde(alias = "v")]
    pub volume: Decimal,
    #[serde(alias = "n")]
    pub trade_count: u64,
    #[serde(alias = "x")]
    pub closed: bool,
}

impl From<(ExchangeId, BinanceKline)> for MarketEvent {
    fn from((exchange_id, kline): (ExchangeId, BinanceKline)) -> Self {
        let candle = kline.kline;
        Self {
            exchange: exchange_id,
            symbol: Symbol::new(kline.symbol),
            exchange_time: kline.event_time,
            received_time: Utc::now(),
            kind: DataKind::Candle(Candle {
                interval: candle.interval,
                start_time: candle.start_time,
                end_time: candle.end_time,
                open: candle.open,
                high: candle.high,
                low: candle.low,
                close: candle.close,
                volume: candle.volume,
                trade_count: candle.trade_count,
                closed: candle.closed,
            }),
        }
    }
}

/// `Binance` order book level update message.
///
/// See docs: <https://binance-docs.github.io/apidocs/spot/en/#diff-depth-stream>
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct BinanceDepthUpdate {
    #[serde(alias = "E", deserialize_with = "de_u64_epoch_ms_as_datetime_utc")]
    pub event_time: DateTime<Utc>,
    #[serde(alias = "s")]
    pub symbol: String,
    #[serde(alias = "U")]
    pub first_update_id: u64,
    #[serde(alias = "u")]
    pub last_update_id: u64,
    #[serde(alias = "b")]
    pub bids: Vec<BinanceLevel>,
    #[serde(alias = "a")]
    pub asks: Vec<BinanceLevel>,
}

/// `Binance` order book level in wire form `["price", "quantity"]`.
#[derive(Clone, Copy, PartialEq, Debug, Deserialize, Serialize)]
pub struct BinanceLevel(pub Decimal, pub Decimal);

impl From<BinanceLevel> for Level {
    fn from(level: BinanceLevel) -> Self {
        Level::new(level.0, level.1)
    }
}

impl From<(ExchangeId, BinanceDepthUpdate)> for MarketEvent {
    fn from((exchange_id, update): (ExchangeId, BinanceDepthUpdate)) -> Self {
        Self {
            exchange: exchange_id,
            symbol: Symbol::new(update.symbol),
            exchange_time: update.event_time,
            received_time: Utc::now(),
            kind: DataKind::OrderBook(OrderBookUpdate {
                first_update_id: Some(update.first_update_id),
                last_update_id: update.last_update_id,
                bids: update.bids.into_iter().map(Level::from).collect(),
                asks: update.asks.into_iter().map(Level::from).collect(),
                snapshot: false,
            }),
        }
    }
}
