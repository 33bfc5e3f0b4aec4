use super::filter::ClientFilter;
use crate::event::MarketEvent;
use crate::subscription::{DataType, Symbol};
use serde::{Deserialize, Serialize};

/// One `(symbol, type)` pair of a subscribe or unsubscribe request.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Deserialize, Serialize)]
pub struct SubscriptionRequest {
    pub symbol: Symbol,
    #[serde(rename = "type")]
    pub data_type: DataType,
}

/// Frames received from fan-out clients: JSON `{type, payload}`.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe(SubscriptionRequest),
    Unsubscribe(SubscriptionRequest),
    Filter(ClientFilter),
    Ping,
}

/// Acknowledgement of a subscription change.
#[derive(Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
pub struct SubscriptionAck {
    pub symbol: Symbol,
    #[serde(rename = "type")]
    pub data_type: DataType,
    pub subscribed: bool,
    /// Number of active subscriptions after the change.
    pub active: usize,
}

/// Structured error frame payload.
#[derive(Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
pub struct FrameError {
    pub code: String,
    pub message: String,
}

/// Frames pushed to fan-out clients: JSON `{type, payload}`.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerFrame {
    MarketData(MarketEvent),
    SubscriptionAck(SubscriptionAck),
    Error(FrameError),
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::Interval;

    #[test]
    fn test_client_frame_wire_format() {
        let input = r#"{"type":"subscribe","payload":{"symbol":"btcusdt","type":"kline_1m"}}"#;
        let frame = serde_json::from_str::<ClientFrame>(input).unwrap();

        assert_eq!(
            frame,
            ClientFrame::Subscribe(SubscriptionRequest {
                symbol: Symbol::new("BTCUSDT"),
                data_type: DataType::Kline(Interval::M1),
            })
        );
    }

    #[test]
    fn test_ping_frame_has_no_payload() {
        let frame = serde_json::from_str::<ClientFrame>(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(frame, ClientFrame::Ping);

        let pong = serde_json::to_string(&ServerFrame::Pong).unwrap();
        assert_eq!(pong, r#"{"type":"pong"}"#);
    }

    #[test]
    fn test_server_frame_type_tags() {
        let ack = ServerFrame::SubscriptionAck(SubscriptionAck {
            symbol: Symbol::new("BTCUSDT"),
            data_type: DataType::Trade,
            subscribed: true,
            active: 1,
        });
        let json = serde_json::to_string(&ack).unwrap();
        assert!(json.starts_with(r#"{"type":"subscription_ack""#), "json: {json}");
        assert!(json.contains(r#""symbol":"BTCUSDT""#));
        assert!(json.contains(r#""type":"trade""#));
    }
}
