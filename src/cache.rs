use crate::event::MarketEvent;
use crate::exchange::ExchangeId;
use crate::subscription::{DataType, Symbol};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Last-value cache configuration. In-memory only, size- and TTL-capped.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: usize,
    /// Entries older than this are dropped on read. `None` disables expiry.
    pub ttl_ms: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            ttl_ms: Some(60_000),
        }
    }
}

#[derive(Clone, Eq, PartialEq, Hash, Debug)]
struct CacheKey {
    exchange: ExchangeId,
    symbol: Symbol,
    data_type: DataType,
}

struct CacheEntry {
    event: MarketEvent,
    stored_at: DateTime<Utc>,
}

/// In-process last-value cache keyed by `(exchange, symbol, data type)`.
/// Secondary sink on processed events; never a durable store.
pub struct LastValueCache {
    config: CacheConfig,
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl LastValueCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Store the latest value for the event's key, evicting the stalest
    /// entry when the size cap is hit.
    pub fn insert(&self, event: &MarketEvent) {
        let key = CacheKey {
            exchange: event.exchange,
            symbol: event.symbol.clone(),
            data_type: event.data_type(),
        };

        let mut entries = self.entries.lock();

        if entries.len() >= self.config.max_entries && !entries.contains_key(&key) {
            if let Some(evict) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.stored_at)
                .map(|(key, _)| key.clone())
            {
                entries.remove(&evict);
            }
        }

        entries.insert(
            key,
            CacheEntry {
                event: event.clone(),
                stored_at: Utc::now(),
            },
        );
    }

    /// Fetch the latest value for a key, dropping it when expired.
    pub fn get(
        &self,
        exchange: ExchangeId,
        symbol: &Symbol,
        data_type: &DataType,
    ) -> Option<MarketEvent> {
        let key = CacheKey {
            exchange,
            symbol: symbol.clone(),
            data_type: *data_type,
        };

        let mut entries = self.entries.lock();
        let entry = entries.get(&key)?;

        if let Some(ttl_ms) = self.config.ttl_ms {
            let age_ms = (Utc::now() - entry.stored_at).num_milliseconds();
            if age_ms > ttl_ms as i64 {
                entries.remove(&key);
                return None;
            }
        }

        Some(entry.event.clone())
    }

    /// Snapshot of every live cached event.
    pub fn snapshot(&self) -> Vec<MarketEvent> {
        let now = Utc::now();
        self.entries
            .lock()
            .values()
            .filter(|entry| match self.config.ttl_ms {
                Some(ttl_ms) => (now - entry.stored_at).num_milliseconds() <= ttl_ms as i64,
                None => true,
            })
            .map(|entry| entry.event.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::test_util;
    use rust_decimal_macros::dec;

    #[test]
    fn test_insert_overwrites_last_value_per_key() {
        let cache = LastValueCache::new(CacheConfig::default());

        cache.insert(&test_util::market_trade(ExchangeId::Binance, "BTCUSDT", dec!(100)));
        cache.insert(&test_util::market_trade(ExchangeId::Binance, "BTCUSDT", dec!(101)));

        assert_eq!(cache.len(), 1);
        let cached = cache
            .get(ExchangeId::Binance, &Symbol::new("BTCUSDT"), &DataType::Trade)
            .unwrap();
        assert_eq!(cached.price(), Some(dec!(101)));
    }

    #[test]
    fn test_keys_are_exchange_symbol_type_scoped() {
        let cache = LastValueCache::new(CacheConfig::default());

        cache.insert(&test_util::market_trade(ExchangeId::Binance, "BTCUSDT", dec!(100)));
        cache.insert(&test_util::market_trade(ExchangeId::Okx, "BTCUSDT", dec!(200)));
        cache.insert(&test_util::market_ticker(ExchangeId::Binance, "BTCUSDT", dec!(300)));

        assert_eq!(cache.len(), 3);
        assert_eq!(
            cache
                .get(ExchangeId::Okx, &Symbol::new("BTCUSDT"), &DataType::Trade)
                .unwrap()
                .price(),
            Some(dec!(200))
        );
        assert!(cache
            .get(ExchangeId::Kraken, &Symbol::new("BTCUSDT"), &DataType::Trade)
            .is_none());
    }

    #[test]
    fn test_size_cap_evicts_stalest_entry() {
        let cache = LastValueCache::new(CacheConfig {
            max_entries: 2,
            ttl_ms: None,
        });

        cache.insert(&test_util::market_trade(ExchangeId::Binance, "AAAUSDT", dec!(1)));
        cache.insert(&test_util::market_trade(ExchangeId::Binance, "BBBUSDT", dec!(2)));
        cache.insert(&test_util::market_trade(ExchangeId::Binance, "CCCUSDT", dec!(3)));

        assert_eq!(cache.len(), 2);
        assert!(cache
            .get(ExchangeId::Binance, &Symbol::new("AAAUSDT"), &DataType::Trade)
            .is_none());
        assert!(cache
            .get(ExchangeId::Binance, &Symbol::new("CCCUSDT"), &DataType::Trade)
            .is_some());
    }

    #[test]
    fn test_zero_ttl_expires_on_read() {
        let cache = LastValueCache::new(CacheConfig {
            max_entries: 10,
            ttl_ms: Some(0),
        });

        cache.insert(&test_util::market_trade(ExchangeId::Binance, "BTCUSDT", dec!(100)));
        std::thread::sleep(std::time::Duration::from_millis(5));

        assert!(cache
            .get(ExchangeId::Binance, &Symbol::new("BTCUSDT"), &DataType::Trade)
            .is_none());
        // The expired entry was dropped, not retained.
        assert!(cache.is_empty());
    }
}
