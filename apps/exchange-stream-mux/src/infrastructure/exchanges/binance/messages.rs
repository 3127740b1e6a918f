//! Binance Wire Format
//!
//! Types for deserializing Binance WebSocket stream messages. Binance
//! sends either a combined-stream envelope or a bare event object:
//!
//! ```json
//! {"stream": "btcusdt@ticker", "data": {"e": "24hrTicker", ...}}
//! {"e": "24hrTicker", "s": "BTCUSDT", ...}
//! ```
//!
//! Event objects carry their type in the `e` field; numeric fields arrive
//! as decimal strings. Control acknowledgements (`{"result":null,"id":1}`)
//! carry no event type and decode to nothing.
//!
//! # References
//!
//! - [WebSocket Streams](https://developers.binance.com/docs/binance-spot-api-docs/web-socket-streams)

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::super::DecodeError;

// =============================================================================
// Control Messages (outbound)
// =============================================================================

/// Subscribe/unsubscribe control request.
///
/// # Wire Format (JSON)
/// ```json
/// {"method": "SUBSCRIBE", "params": ["btcusdt@ticker"], "id": 1}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlRequest {
    /// `"SUBSCRIBE"` or `"UNSUBSCRIBE"`.
    pub method: &'static str,
    /// Stream topic names, e.g. `"btcusdt@ticker"`.
    pub params: Vec<String>,
    /// Request id; Binance echoes it in the acknowledgement.
    pub id: u64,
}

// =============================================================================
// Event Messages (inbound)
// =============================================================================

/// 24h rolling ticker event (`"e": "24hrTicker"`).
///
/// # Wire Format (JSON)
/// ```json
/// {
///   "e": "24hrTicker",
///   "s": "BTCUSDT",
///   "p": "120.50",
///   "P": "0.19",
///   "c": "65000.12",
///   "h": "65500.00",
///   "l": "64000.00",
///   "v": "12345.678",
///   "b": "65000.10",
///   "a": "65000.14"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TickerEvent {
    /// Vendor symbol, e.g. `"BTCUSDT"`.
    #[serde(rename = "s")]
    pub symbol: String,

    /// Last traded price.
    #[serde(rename = "c", with = "rust_decimal::serde::str")]
    pub last_price: Decimal,

    /// Absolute 24h price change.
    #[serde(rename = "p", with = "rust_decimal::serde::str")]
    pub price_change: Decimal,

    /// Percent 24h price change.
    #[serde(rename = "P", with = "rust_decimal::serde::str")]
    pub price_change_percent: Decimal,

    /// 24h high price.
    #[serde(rename = "h", with = "rust_decimal::serde::str")]
    pub high: Decimal,

    /// 24h low price.
    #[serde(rename = "l", with = "rust_decimal::serde::str")]
    pub low: Decimal,

    /// 24h base asset volume.
    #[serde(rename = "v", with = "rust_decimal::serde::str")]
    pub volume: Decimal,

    /// Best bid price.
    #[serde(rename = "b", with = "rust_decimal::serde::str")]
    pub bid: Decimal,

    /// Best ask price.
    #[serde(rename = "a", with = "rust_decimal::serde::str")]
    pub ask: Decimal,
}

/// Raw trade event (`"e": "trade"`).
///
/// # Wire Format (JSON)
/// ```json
/// {
///   "e": "trade",
///   "s": "BTCUSDT",
///   "t": 12345,
///   "p": "65000.12",
///   "q": "0.014",
///   "T": 1700000000123,
///   "m": true
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TradeEvent {
    /// Vendor symbol.
    #[serde(rename = "s")]
    pub symbol: String,

    /// Trade id, unique per symbol.
    #[serde(rename = "t")]
    pub trade_id: i64,

    /// Execution price.
    #[serde(rename = "p", with = "rust_decimal::serde::str")]
    pub price: Decimal,

    /// Executed quantity.
    #[serde(rename = "q", with = "rust_decimal::serde::str")]
    pub quantity: Decimal,

    /// Trade time, epoch milliseconds.
    #[serde(rename = "T")]
    pub trade_time: i64,

    /// Whether the buyer was the maker (true means the taker sold).
    #[serde(rename = "m")]
    pub is_buyer_maker: bool,
}

/// Incremental depth update (`"e": "depthUpdate"`).
///
/// Bid/ask levels arrive as `[price, quantity]` string pairs; a zero
/// quantity removes the level.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DepthEvent {
    /// Vendor symbol.
    #[serde(rename = "s")]
    pub symbol: String,

    /// Updated bid levels.
    #[serde(rename = "b")]
    pub bids: Vec<[String; 2]>,

    /// Updated ask levels.
    #[serde(rename = "a")]
    pub asks: Vec<[String; 2]>,
}

/// Kline event wrapper (`"e": "kline"`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KlineEvent {
    /// Vendor symbol.
    #[serde(rename = "s")]
    pub symbol: String,

    /// Candle payload.
    #[serde(rename = "k")]
    pub kline: KlinePayload,
}

/// Candle payload inside a kline event.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KlinePayload {
    /// Interval label, e.g. `"1m"`.
    #[serde(rename = "i")]
    pub interval: String,

    /// Open price.
    #[serde(rename = "o", with = "rust_decimal::serde::str")]
    pub open: Decimal,

    /// High price.
    #[serde(rename = "h", with = "rust_decimal::serde::str")]
    pub high: Decimal,

    /// Low price.
    #[serde(rename = "l", with = "rust_decimal::serde::str")]
    pub low: Decimal,

    /// Close price (latest while the candle is forming).
    #[serde(rename = "c", with = "rust_decimal::serde::str")]
    pub close: Decimal,

    /// Base asset volume.
    #[serde(rename = "v", with = "rust_decimal::serde::str")]
    pub volume: Decimal,

    /// Whether the candle is closed.
    #[serde(rename = "x")]
    pub is_closed: bool,
}

/// One decoded Binance event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinanceEvent {
    /// 24h ticker update.
    Ticker(TickerEvent),
    /// Executed trade.
    Trade(TradeEvent),
    /// Order book delta.
    Depth(DepthEvent),
    /// Candle update.
    Kline(KlineEvent),
}

// =============================================================================
// Frame Decoding
// =============================================================================

/// Decode one inbound text frame into zero or more events.
///
/// Unwraps the combined-stream envelope when present, then dispatches on
/// the `e` event type. Control acknowledgements and unknown event types
/// decode to an empty vector.
///
/// # Errors
///
/// Returns an error when the frame is not valid JSON or a recognized
/// event fails field-level parsing.
pub fn decode_frame(text: &str) -> Result<Vec<BinanceEvent>, DecodeError> {
    let value: serde_json::Value = serde_json::from_str(text)?;

    // Combined-stream envelope: {"stream": "...", "data": {...}}
    let event = if value.get("stream").is_some() {
        value
            .get("data")
            .cloned()
            .ok_or(DecodeError::MissingField("data"))?
    } else {
        value
    };

    let Some(event_type) = event
        .get("e")
        .and_then(serde_json::Value::as_str)
        .map(str::to_owned)
    else {
        // Control acknowledgements carry no event type.
        return Ok(vec![]);
    };

    let decoded = match event_type.as_str() {
        "24hrTicker" => BinanceEvent::Ticker(serde_json::from_value(event)?),
        "trade" => BinanceEvent::Trade(serde_json::from_value(event)?),
        "depthUpdate" => BinanceEvent::Depth(serde_json::from_value(event)?),
        "kline" => BinanceEvent::Kline(serde_json::from_value(event)?),
        _ => return Ok(vec![]),
    };

    Ok(vec![decoded])
}
