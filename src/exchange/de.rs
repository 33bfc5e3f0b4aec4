use crate::event::Side;
use chrono::{DateTime, Utc};
use serde::de::{Deserialize, Deserializer};
use std::time::Duration;

/// Deserialize a `String` as the desired type.
pub fn de_str<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let data = String::deserialize(deserializer)?;
    data.parse::<T>().map_err(serde::de::Error::custom)
}

/// Deserialize a `u64` as milliseconds since the epoch into a
/// `DateTime<Utc>`.
pub fn de_u64_epoch_ms_as_datetime_utc<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let epoch_ms = u64::deserialize(deserializer)?;
    Ok(epoch_ms_to_datetime_utc(epoch_ms))
}

/// Deserialize a Binance `"m"` buyer-is-maker field into a taker [`Side`].
///
/// buyer_is_maker == true means the maker was on the buy side, so the taker
/// sold.
pub fn de_side_from_buyer_is_maker<'de, D>(deserializer: D) -> Result<Side, D::Error>
where
    D: Deserializer<'de>,
{
    let buyer_is_maker = bool::deserialize(deserializer)?;
    Ok(if buyer_is_maker { Side::Sell } else { Side::Buy })
}

/// Determine the `DateTime<Utc>` from the provided `u64` milliseconds since
/// the epoch.
pub fn epoch_ms_to_datetime_utc(epoch_ms: u64) -> DateTime<Utc> {
    DateTime::<Utc>::from(std::time::UNIX_EPOCH + Duration::from_millis(epoch_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_ms_to_datetime_utc() {
        let datetime = epoch_ms_to_datetime_utc(1_672_515_782_136);
        assert_eq!(datetime.timestamp_millis(), 1_672_515_782_136);
    }

    #[test]
    fn test_de_side_from_buyer_is_maker() {
        #[derive(serde::Deserialize)]
        struct Probe {
            #[serde(deserialize_with = "de_side_from_buyer_is_maker")]
            side: Side,
        }

        let sell: Probe = serde_json::from_str(r#"{"side": true}"#).unwrap();
        assert_eq!(sell.side, Side::Sell);

        let buy: Probe = serde_json::from_str(r#"{"side": false}"#).unwrap();
        assert_eq!(buy.side, Side::Buy);
    }
}
