use crate::event::MarketEvent;
use crate::exchange::ExchangeId;
use crate::subscription::{DataType, Symbol};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Inclusive price bounds applied to events carrying a scalar price.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PriceRange {
    pub min: Option<Decimal>,
    pub max: Option<Decimal>,
}

impl PriceRange {
    fn admits(&self, price: Decimal) -> bool {
        self.min.map_or(true, |min| price >= min) && self.max.map_or(true, |max| price <= max)
    }
}

/// Multi-dimensional per-client filter with whitelist semantics: every
/// present dimension must admit the record.
///
/// The price range applies only to events with a scalar price field; an
/// event without one (eg/ a depth update) is admitted by that dimension.
#[derive(Clone, PartialEq, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientFilter {
    pub symbols: Option<Vec<Symbol>>,
    pub data_types: Option<Vec<DataType>>,
    pub exchanges: Option<Vec<ExchangeId>>,
    pub price_range: Option<PriceRange>,
}

impl ClientFilter {
    pub fn admits(&self, event: &MarketEvent) -> bool {
        if let Some(symbols) = &self.symbols {
            if !symbols.contains(&event.symbol) {
                return false;
            }
        }

        if let Some(data_types) = &self.data_types {
            if !data_types.contains(&event.data_type()) {
                return false;
            }
        }

        if let Some(exchanges) = &self.exchanges {
            if !exchanges.contains(&event.exchange) {
                return false;
            }
        }

        if let Some(price_range) = &self.price_range {
            if let Some(price) = event.price() {
                if !price_range.admits(price) {
                    return false;
                }
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::test_util;
    use rust_decimal_macros::dec;

    #[test]
    fn test_empty_filter_admits_everything() {
        let filter = ClientFilter::default();
        let event = test_util::market_trade(ExchangeId::Binance, "BTCUSDT", dec!(100));
        assert!(filter.admits(&event));
    }

    #[test]
    fn test_each_dimension_is_a_whitelist() {
        let event = test_util::market_trade(ExchangeId::Binance, "BTCUSDT", dec!(100));

        struct TestCase {
            input: ClientFilter,
            expected: bool,
        }

        let cases = vec![
            TestCase {
                // TC0: symbol whitelist admits
                input: ClientFilter {
                    symbols: Some(vec![Symbol::new("BTCUSDT"), Symbol::new("ETHUSDT")]),
                    ..ClientFilter::default()
                },
                expected: true,
            },
            TestCase {
                // TC1: symbol whitelist excludes
                input: ClientFilter {
                    symbols: Some(vec![Symbol::new("ETHUSDT")]),
                    ..ClientFilter::default()
                },
                expected: false,
            },
            TestCase {
                // TC2: data type whitelist excludes
                input: ClientFilter {
                    data_types: Some(vec![DataType::Ticker]),
                    ..ClientFilter::default()
                },
                expected: false,
            },
            TestCase {
                // TC3: exchange whitelist admits
                input: ClientFilter {
                    exchanges: Some(vec![ExchangeId::Binance]),
                    ..ClientFilter::default()
                },
                expected: true,
            },
            TestCase {
                // TC4: all dimensions must admit
                input: ClientFilter {
                    symbols: Some(vec![Symbol::new("BTCUSDT")]),
                    exchanges: Some(vec![ExchangeId::Okx]),
                    ..ClientFilter::default()
                },
                expected: false,
            },
        ];

        for (index, test) in cases.into_iter().enumerate() {
            assert_eq!(test.input.admits(&event), test.expected, "TC{index} failed");
        }
    }

    #[test]
    fn test_price_range_bounds_are_inclusive() {
        let filter = ClientFilter {
            price_range: Some(PriceRange {
                min: Some(dec!(50)),
                max: Some(dec!(100)),
            }),
            ..ClientFilter::default()
        };

        struct TestCase {
            input: Decimal,
            expected: bool,
        }

        let cases = vec![
            TestCase {
                input: dec!(50),
                expected: true,
            },
            TestCase {
                input: dec!(100),
                expected: true,
            },
            TestCase {
                input: dec!(49.99),
                expected: false,
            },
            TestCase {
                input: dec!(100.01),
                expected: false,
            },
        ];

        for (index, test) in cases.into_iter().enumerate() {
            let event = test_util::market_trade(ExchangeId::Binance, "BTCUSDT", test.input);
            assert_eq!(filter.admits(&event), test.expected, "TC{index} failed");
        }
    }

    #[test]
    fn test_price_range_admits_events_without_scalar_price() {
        use crate::event::{DataKind, Level, OrderBookUpdate};

        let filter = ClientFilter {
            price_range: Some(PriceRange {
                min: Some(dec!(1_000_000)),
                max: None,
            }),
            ..ClientFilter::default()
        };

        let mut event = test_util::market_trade(ExchangeId::Binance, "BTCUSDT", dec!(1));
        event.kind = DataKind::OrderBook(OrderBookUpdate {
            first_update_id: None,
            last_update_id: 1,
            bids: vec![Level::new(dec!(1), dec!(1))],
            asks: vec![],
            snapshot: false,
        });

        // No scalar price: the price dimension admits.
        assert!(filter.admits(&event));
    }
}
