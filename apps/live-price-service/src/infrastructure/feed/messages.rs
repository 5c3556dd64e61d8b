//! Push Feed Wire Messages
//!
//! JSON publish/subscribe message model spoken by the push feed.
//!
//! # Outbound
//!
//! ```json
//! {"type":"subscribe","symbol":["AAPL","MSFT"]}
//! {"type":"unsubscribe","symbol":["AAPL"]}
//! {"type":"ping"}
//! ```
//!
//! # Inbound
//!
//! ```json
//! {"type":"trade","data":[{"s":"AAPL","p":187.25,"v":100,"t":1700000000000}]}
//! {"type":"ping"}
//! {"type":"pong"}
//! {"type":"error","msg":"invalid token"}
//! ```

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::price::{PriceRecord, PriceRecordError, PriceSource};
use crate::domain::subscription::Symbol;

// =============================================================================
// Outbound
// =============================================================================

/// Client → server control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    /// Start streaming the listed symbols.
    Subscribe {
        /// Symbols to add.
        symbol: Vec<Symbol>,
    },
    /// Stop streaming the listed symbols.
    Unsubscribe {
        /// Symbols to remove.
        symbol: Vec<Symbol>,
    },
    /// Application-level heartbeat.
    Ping,
}

impl ControlMessage {
    /// Subscribe message for a batch of symbols.
    #[must_use]
    pub fn subscribe(symbols: &[Symbol]) -> Self {
        Self::Subscribe {
            symbol: symbols.to_vec(),
        }
    }

    /// Unsubscribe message for a batch of symbols.
    #[must_use]
    pub fn unsubscribe(symbols: &[Symbol]) -> Self {
        Self::Unsubscribe {
            symbol: symbols.to_vec(),
        }
    }
}

// =============================================================================
// Inbound
// =============================================================================

/// One executed trade inside a `trade` frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TradeItem {
    /// Symbol.
    #[serde(rename = "s")]
    pub symbol: Symbol,
    /// Trade price.
    #[serde(rename = "p")]
    pub price: Decimal,
    /// Trade size; fractional sizes are truncated.
    #[serde(rename = "v", default)]
    pub volume: f64,
    /// Event time in milliseconds since the epoch.
    #[serde(rename = "t")]
    pub timestamp: i64,
}

impl TradeItem {
    /// Convert into a stream-sourced `PriceRecord`.
    ///
    /// # Errors
    ///
    /// Returns `PriceRecordError` if the item fails record validation.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn into_record(self) -> Result<PriceRecord, PriceRecordError> {
        let volume = if self.volume.is_finite() && self.volume > 0.0 {
            self.volume as u64
        } else {
            0
        };
        PriceRecord::new(
            self.symbol,
            self.price,
            volume,
            self.timestamp,
            PriceSource::Stream,
        )
    }
}

/// Server → client message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Batch of trades.
    Trade(Vec<serde_json::Value>),
    /// Server heartbeat request.
    Ping,
    /// Server heartbeat reply.
    Pong,
    /// Server-reported error.
    Error(String),
    /// Any other message type; ignored.
    Unknown(String),
}

/// Body of an `error` frame.
#[derive(Debug, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub msg: String,
}

/// Body of a `trade` frame. Items stay raw so one bad item cannot sink the
/// whole frame.
#[derive(Debug, Deserialize)]
pub(crate) struct TradeBody {
    #[serde(default)]
    pub data: Vec<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn control_messages_serialize_to_wire_shape() {
        let subscribe = ControlMessage::subscribe(&["AAPL".to_string(), "MSFT".to_string()]);
        assert_eq!(
            serde_json::to_string(&subscribe).unwrap(),
            r#"{"type":"subscribe","symbol":["AAPL","MSFT"]}"#
        );

        let unsubscribe = ControlMessage::unsubscribe(&["AAPL".to_string()]);
        assert_eq!(
            serde_json::to_string(&unsubscribe).unwrap(),
            r#"{"type":"unsubscribe","symbol":["AAPL"]}"#
        );

        assert_eq!(
            serde_json::to_string(&ControlMessage::Ping).unwrap(),
            r#"{"type":"ping"}"#
        );
    }

    #[test]
    fn trade_item_converts_to_stream_record() {
        let item: TradeItem =
            serde_json::from_str(r#"{"s":"AAPL","p":187.25,"v":12.9,"t":1700000000000}"#)
                .unwrap();
        let record = item.into_record().unwrap();

        assert_eq!(record.symbol(), "AAPL");
        assert_eq!(record.price(), Decimal::from_str("187.25").unwrap());
        assert_eq!(record.volume(), 12);
        assert_eq!(record.source(), PriceSource::Stream);
    }

    #[test]
    fn trade_item_without_volume_defaults_to_zero() {
        let item: TradeItem = serde_json::from_str(r#"{"s":"BTC","p":1,"t":5}"#).unwrap();
        assert_eq!(item.into_record().unwrap().volume(), 0);
    }

    #[test]
    fn trade_item_with_zero_price_is_invalid() {
        let item: TradeItem = serde_json::from_str(r#"{"s":"AAPL","p":0,"v":1,"t":5}"#).unwrap();
        assert!(item.into_record().is_err());
    }
}
