use super::{CodecError, StreamCodec, StreamName};
use crate::subscription::{DataType, DepthLevels, DepthParams, Subscription, Symbol, UpdateSpeed};
use serde::{Deserialize, Serialize};

/// Binance combined-stream name codec.
///
/// Wire formats:
/// - `{symbol}@trade`
/// - `{symbol}@ticker`
/// - `{symbol}@depth[{levels}][@{speed}]`
/// - `{symbol}@kline_{interval}`
///
/// Symbols are `[A-Za-z0-9]+`, lowercased on the wire and uppercased
/// internally.
///
/// See docs: <https://binance-docs.github.io/apidocs/spot/en/#websocket-market-streams>
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Deserialize, Serialize)]
pub struct BinanceStreamCodec;

impl BinanceStreamCodec {
    fn validate_symbol(symbol: &Symbol) -> Result<(), CodecError> {
        let valid = !symbol.as_str().is_empty()
            && symbol
                .as_str()
                .chars()
                .all(|char| char.is_ascii_alphanumeric());

        if valid {
            Ok(())
        } else {
            Err(CodecError::InvalidSymbol(symbol.to_string()))
        }
    }
}

impl StreamCodec for BinanceStreamCodec {
    fn build(&self, subscription: &Subscription) -> Result<StreamName, CodecError> {
        Self::validate_symbol(&subscription.symbol)?;
        let symbol = subscription.symbol.as_str().to_lowercase();

        let name = match &subscription.data_type {
            DataType::Trade => format!("{symbol}@trade"),
            DataType::Ticker => format!("{symbol}@ticker"),
            DataType::Kline(interval) => format!("{symbol}@kline_{interval}"),
            DataType::Depth(params) => format!("{symbol}@depth{params}"),
        };

        Ok(StreamName::new(name))
    }

    fn parse(&self, name: &str) -> Option<Subscription> {
        let (symbol, suffix) = name.split_once('@')?;

        if symbol.is_empty() || !symbol.chars().all(|char| char.is_ascii_alphanumeric()) {
            return None;
        }

        let data_type = match suffix {
            "trade" => DataType::Trade,
            "ticker" => DataType::Ticker,
            _ => {
                if let Some(interval) = suffix.strip_prefix("kline_") {
                    DataType::Kline(interval.parse().ok()?)
                } else if let Some(rest) = suffix.strip_prefix("depth") {
                    let (levels_part, speed_part) = match rest.split_once('@') {
                        Some((levels, speed)) => (levels, Some(speed)),
                        None => (rest, None),
                    };

                    let levels = if levels_part.is_empty() {
                        None
                    } else {
                        Some(DepthLevels::from_u16(levels_part.parse().ok()?)?)
                    };

                    let speed = match speed_part {
                        None => None,
                        Some("100ms") => Some(UpdateSpeed::Ms100),
                        Some("1000ms") => Some(UpdateSpeed::Ms1000),
                        Some(_) => return None,
                    };

                    DataType::Depth(DepthParams { levels, speed })
                } else {
                    return None;
                }
            }
        };

        Some(Subscription::new(symbol, data_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::Interval;
    use std::str::FromStr;

    #[test]
    fn test_build_trade_stream() {
        let codec = BinanceStreamCodec;
        let subscription = Subscription::new("BTCUSDT", DataType::Trade);

        let name = codec.build(&subscription).unwrap();
        assert_eq!(name.as_str(), "btcusdt@trade");
        assert!(codec.validate(name.as_str()));
        assert_eq!(codec.parse(name.as_str()), Some(subscription));
    }

    #[test]
    fn test_build_stream_names() {
        struct TestCase {
            input: Subscription,
            expected: &'static str,
        }

        let cases = vec![
            TestCase {
                // TC0: ticker stream
                input: Subscription::new("ETHUSDT", DataType::Ticker),
                expected: "ethusdt@ticker",
            },
            TestCase {
                // TC1: kline stream carries the interval suffix
                input: Subscription::new("BNBUSDT", DataType::Kline(Interval::M1)),
                expected: "bnbusdt@kline_1m",
            },
            TestCase {
                // TC2: monthly kline keeps the uppercase M
                input: Subscription::new("BTCUSDT", DataType::Kline(Interval::Mo1)),
                expected: "btcusdt@kline_1M",
            },
            TestCase {
                // TC3: bare depth stream
                input: Subscription::new("BTCUSDT", DataType::Depth(DepthParams::default())),
                expected: "btcusdt@depth",
            },
            TestCase {
                // TC4: partial depth with levels and update speed
                input: Subscription::new(
                    "BTCUSDT",
                    DataType::Depth(DepthParams {
                        levels: Some(DepthLevels::Twenty),
                        speed: Some(UpdateSpeed::Ms100),
                    }),
                ),
                expected: "btcusdt@depth20@100ms",
            },
        ];

        for (index, test) in cases.into_iter().enumerate() {
            let actual = BinanceStreamCodec.build(&test.input).unwrap();
            assert_eq!(actual.as_str(), test.expected, "TC{index} failed");
        }
    }

    #[test]
    fn test_parse_is_left_inverse_of_build() {
        let codec = BinanceStreamCodec;

        let subscriptions = vec![
            Subscription::new("BTCUSDT", DataType::Trade),
            Subscription::new("ETHUSDT", DataType::Ticker),
            Subscription::new("BNBUSDT", DataType::Kline(Interval::H4)),
            Subscription::new("BTCUSDT", DataType::Kline(Interval::W1)),
            Subscription::new(
                "SOLUSDT",
                DataType::Depth(DepthParams {
                    levels: Some(DepthLevels::Five),
                    speed: None,
                }),
            ),
            Subscription::new(
                "XRPUSDT",
                DataType::Depth(DepthParams {
                    levels: None,
                    speed: Some(UpdateSpeed::Ms1000),
                }),
            ),
        ];

        for subscription in subscriptions {
            let name = codec.build(&subscription).unwrap();
            assert!(codec.validate(name.as_str()), "{name} failed validate");
            assert_eq!(
                codec.parse(name.as_str()),
                Some(subscription.clone()),
                "{name} failed round trip"
            );
        }
    }

    #[test]
    fn test_build_supports_every_interval() {
        for interval in Interval::ALL {
            let subscription = Subscription::new("BTCUSDT", DataType::Kline(interval));
            let name = BinanceStreamCodec.build(&subscription).unwrap();
            assert_eq!(name.as_str(), format!("btcusdt@kline_{interval}"));
            assert_eq!(BinanceStreamCodec.parse(name.as_str()), Some(subscription));
        }
    }

    #[test]
    fn test_build_rejects_invalid_symbol() {
        for symbol in ["BTC-USDT", "BTC/USDT", "BTC USDT", ""] {
            let subscription = Subscription {
                symbol: Symbol::new(symbol),
                data_type: DataType::Trade,
            };
            assert!(
                matches!(
                    BinanceStreamCodec.build(&subscription),
                    Err(CodecError::InvalidSymbol(_))
                ),
                "expected {symbol:?} to be rejected"
            );
        }
    }

    #[test]
    fn test_parse_unknown_formats_return_none() {
        struct TestCase {
            input: &'static str,
        }

        let cases = vec![
            TestCase { input: "" },
            TestCase { input: "btcusdt" },
            TestCase {
                input: "btcusdt@aggTrade",
            },
            TestCase {
                input: "btcusdt@kline_7m",
            },
            TestCase {
                input: "btcusdt@depth15",
            },
            TestCase {
                input: "btcusdt@depth20@50ms",
            },
            TestCase {
                input: "btc-usdt@trade",
            },
            TestCase { input: "@trade" },
        ];

        for (index, test) in cases.into_iter().enumerate() {
            assert_eq!(
                BinanceStreamCodec.parse(test.input),
                None,
                "TC{index} failed for {:?}",
                test.input
            );
            assert!(!BinanceStreamCodec.validate(test.input), "TC{index} failed");
        }
    }

    #[test]
    fn test_parse_uppercases_symbol() {
        let parsed = BinanceStreamCodec.parse("btcusdt@trade").unwrap();
        assert_eq!(parsed.symbol.as_str(), "BTCUSDT");
        assert_eq!(DataType::from_str("trade").unwrap(), parsed.data_type);
    }
}
