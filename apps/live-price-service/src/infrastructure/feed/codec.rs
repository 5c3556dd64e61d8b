//! Feed Codec
//!
//! JSON encoding and decoding for push feed frames. Frames are single JSON
//! objects discriminated by a `type` field. Trade items are decoded one at a
//! time so a malformed item is reported without discarding its siblings.

use crate::domain::price::PriceRecord;

use super::messages::{ControlMessage, ErrorBody, InboundMessage, TradeBody, TradeItem};

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame is valid JSON but not an object with a `type` field.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

/// Outcome of decoding the items of one `trade` frame.
#[derive(Debug, Default)]
pub struct DecodedTrades {
    /// Items that produced valid records.
    pub records: Vec<PriceRecord>,
    /// Reasons for each item that was skipped.
    pub rejected: Vec<String>,
}

/// JSON codec for the push feed.
#[derive(Debug, Default, Clone)]
pub struct FeedCodec;

impl FeedCodec {
    /// Create a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Encode a control message.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self, message: &ControlMessage) -> Result<String, CodecError> {
        Ok(serde_json::to_string(message)?)
    }

    /// Decode one text frame.
    ///
    /// Unknown `type` values decode to `InboundMessage::Unknown`.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not a JSON object with a string
    /// `type` field, or a known frame has the wrong shape.
    pub fn decode(&self, text: &str) -> Result<InboundMessage, CodecError> {
        let trimmed = text.trim();
        if !trimmed.starts_with('{') {
            return Err(CodecError::InvalidFormat(format!(
                "expected JSON object, got: {}",
                preview(trimmed)
            )));
        }

        let value: serde_json::Value = serde_json::from_str(trimmed)?;
        let Some(kind) = value.get("type").and_then(serde_json::Value::as_str) else {
            return Err(CodecError::InvalidFormat(format!(
                "missing type field: {}",
                preview(trimmed)
            )));
        };

        let message = match kind {
            "trade" => {
                let body: TradeBody = serde_json::from_value(value)?;
                InboundMessage::Trade(body.data)
            }
            "ping" => InboundMessage::Ping,
            "pong" => InboundMessage::Pong,
            "error" => {
                let body: ErrorBody = serde_json::from_value(value)?;
                InboundMessage::Error(body.msg)
            }
            other => InboundMessage::Unknown(other.to_string()),
        };
        Ok(message)
    }

    /// Decode the raw items of a `trade` frame into records.
    #[must_use]
    pub fn decode_trades(&self, items: Vec<serde_json::Value>) -> DecodedTrades {
        let mut decoded = DecodedTrades {
            records: Vec::with_capacity(items.len()),
            rejected: Vec::new(),
        };

        for item in items {
            let result = serde_json::from_value::<TradeItem>(item)
                .map_err(|e| e.to_string())
                .and_then(|trade| trade.into_record().map_err(|e| e.to_string()));
            match result {
                Ok(record) => decoded.records.push(record),
                Err(reason) => decoded.rejected.push(reason),
            }
        }
        decoded
    }
}

fn preview(text: &str) -> String {
    text.chars().take(50).collect()
}
