//! Kraken Wire Format (v1)
//!
//! Kraken's public WebSocket feed frames data messages as JSON **arrays**
//! whose last two elements are the channel name and the pair:
//!
//! ```json
//! [42, {"c": ["65000.12", "0.01"], ...}, "ticker", "XBT/USD"]
//! [42, [["65000.12", "0.014", "1700000000.123456", "b", "l", ""]], "trade", "XBT/USD"]
//! ```
//!
//! JSON **objects** are connection and status messages (`systemStatus`,
//! `subscriptionStatus`, `heartbeat`) and never carry market data. Book
//! frames may hold two payload objects when both sides changed in one
//! update, which is why everything between the channel id and the channel
//! name is treated as payload.
//!
//! Numeric fields arrive as decimal strings positioned inside arrays, so
//! decoding works on `serde_json::Value` rather than derived structs.
//!
//! Kraken does not flag candle completion; `closed` stays `false` on this
//! venue and consumers infer completion from the interval end.
//!
//! # References
//!
//! - [Kraken WebSocket API v1](https://docs.kraken.com/api/docs/websocket-v1/ticker)

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::super::DecodeError;

// =============================================================================
// Control Messages (outbound)
// =============================================================================

/// Subscribe/unsubscribe control request.
///
/// # Wire Format (JSON)
/// ```json
/// {"event": "subscribe", "pair": ["XBT/USD"], "subscription": {"name": "book", "depth": 10}}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscribeRequest {
    /// `"subscribe"` or `"unsubscribe"`.
    pub event: &'static str,
    /// Vendor pair strings, e.g. `"XBT/USD"`.
    pub pair: Vec<String>,
    /// Channel to open or close.
    pub subscription: ChannelSpec,
}

/// Channel selector inside a control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChannelSpec {
    /// Channel name: `ticker`, `trade`, `book`, or `ohlc`.
    pub name: &'static str,
    /// Book depth parameter (book channel only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<u32>,
    /// Candle interval in minutes (ohlc channel only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<u32>,
}

// =============================================================================
// Inbound Messages
// =============================================================================

/// Connection/status object frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StatusEvent {
    /// Event name: `systemStatus`, `subscriptionStatus`, `heartbeat`, ...
    pub event: String,
    /// Status value for system/subscription events.
    #[serde(default)]
    pub status: Option<String>,
    /// Pair the event refers to, when applicable.
    #[serde(default)]
    pub pair: Option<String>,
    /// Error detail for rejected subscriptions.
    #[serde(default, rename = "errorMessage")]
    pub error_message: Option<String>,
}

/// Decoded ticker payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickerUpdate {
    /// Last trade price (`c[0]`).
    pub last: Decimal,
    /// Best bid price (`b[0]`).
    pub bid: Decimal,
    /// Best ask price (`a[0]`).
    pub ask: Decimal,
    /// 24h high (`h[1]`).
    pub high_24h: Decimal,
    /// 24h low (`l[1]`).
    pub low_24h: Decimal,
    /// 24h volume (`v[1]`).
    pub volume_24h: Decimal,
    /// Price 24h ago (`o[1]`).
    pub open_24h: Decimal,
}

/// One decoded trade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeUpdate {
    /// Execution price.
    pub price: Decimal,
    /// Executed volume.
    pub volume: Decimal,
    /// Execution time.
    pub time: DateTime<Utc>,
    /// Aggressor side marker: `"b"` or `"s"`.
    pub side: String,
}

/// One decoded book level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookLevel {
    /// Price of the level.
    pub price: Decimal,
    /// Resting volume at the level (zero removes it).
    pub volume: Decimal,
}

/// Decoded book payload (delta or snapshot).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BookUpdate {
    /// Changed bid levels.
    pub bids: Vec<BookLevel>,
    /// Changed ask levels.
    pub asks: Vec<BookLevel>,
    /// Whether this was the initial snapshot (`bs`/`as` keys).
    pub snapshot: bool,
}

/// Decoded candle payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OhlcUpdate {
    /// Open price.
    pub open: Decimal,
    /// High price.
    pub high: Decimal,
    /// Low price.
    pub low: Decimal,
    /// Close price so far.
    pub close: Decimal,
    /// Volume so far.
    pub volume: Decimal,
    /// Interval label derived from the channel name, e.g. `"1m"`.
    pub interval: String,
}

/// One decoded Kraken message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KrakenMessage {
    /// Ticker update for a pair.
    Ticker {
        /// Vendor pair.
        pair: String,
        /// Payload.
        ticker: TickerUpdate,
    },
    /// Batch of trades for a pair.
    Trades {
        /// Vendor pair.
        pair: String,
        /// Payload, in venue order.
        trades: Vec<TradeUpdate>,
    },
    /// Book delta or snapshot for a pair.
    Book {
        /// Vendor pair.
        pair: String,
        /// Payload.
        book: BookUpdate,
    },
    /// Candle update for a pair.
    Ohlc {
        /// Vendor pair.
        pair: String,
        /// Payload.
        candle: OhlcUpdate,
    },
    /// Connection/status event.
    Status(StatusEvent),
}

// =============================================================================
// Frame Decoding
// =============================================================================

/// Decode one inbound text frame.
///
/// Returns `Ok(None)` for data frames on channels this crate does not
/// consume.
///
/// # Errors
///
/// Returns an error for invalid JSON or a frame that does not match the
/// vendor protocol shape; callers drop the frame and keep reading.
pub fn decode_frame(text: &str) -> Result<Option<KrakenMessage>, DecodeError> {
    let value: Value = serde_json::from_str(text)?;
    match value {
        Value::Object(_) => {
            let status: StatusEvent = serde_json::from_value(value)?;
            Ok(Some(KrakenMessage::Status(status)))
        }
        Value::Array(items) => decode_data_frame(&items),
        _ => Err(DecodeError::InvalidFrame(
            "expected JSON object or array".to_string(),
        )),
    }
}

fn decode_data_frame(items: &[Value]) -> Result<Option<KrakenMessage>, DecodeError> {
    if items.len() < 4 {
        return Err(DecodeError::InvalidFrame(format!(
            "data frame with {} elements",
            items.len()
        )));
    }

    let pair = items[items.len() - 1]
        .as_str()
        .ok_or_else(|| DecodeError::InvalidFrame("pair is not a string".to_string()))?
        .to_string();
    let channel = items[items.len() - 2]
        .as_str()
        .ok_or_else(|| DecodeError::InvalidFrame("channel name is not a string".to_string()))?;
    let payloads = &items[1..items.len() - 2];

    if channel == "ticker" {
        let payload = single_payload(payloads)?;
        Ok(Some(KrakenMessage::Ticker {
            pair,
            ticker: decode_ticker(payload)?,
        }))
    } else if channel == "trade" {
        let payload = single_payload(payloads)?;
        Ok(Some(KrakenMessage::Trades {
            pair,
            trades: decode_trades(payload)?,
        }))
    } else if channel.starts_with("book") {
        Ok(Some(KrakenMessage::Book {
            pair,
            book: decode_book(payloads)?,
        }))
    } else if let Some(minutes) = channel.strip_prefix("ohlc-") {
        let payload = single_payload(payloads)?;
        Ok(Some(KrakenMessage::Ohlc {
            pair,
            candle: decode_ohlc(payload, minutes)?,
        }))
    } else {
        Ok(None)
    }
}

fn single_payload(payloads: &[Value]) -> Result<&Value, DecodeError> {
    match payloads {
        [payload] => Ok(payload),
        other => Err(DecodeError::InvalidFrame(format!(
            "expected one payload element, got {}",
            other.len()
        ))),
    }
}

fn decode_ticker(payload: &Value) -> Result<TickerUpdate, DecodeError> {
    Ok(TickerUpdate {
        last: indexed_decimal(payload, "c", 0)?,
        bid: indexed_decimal(payload, "b", 0)?,
        ask: indexed_decimal(payload, "a", 0)?,
        high_24h: indexed_decimal(payload, "h", 1)?,
        low_24h: indexed_decimal(payload, "l", 1)?,
        volume_24h: indexed_decimal(payload, "v", 1)?,
        open_24h: indexed_decimal(payload, "o", 1)?,
    })
}

fn decode_trades(payload: &Value) -> Result<Vec<TradeUpdate>, DecodeError> {
    let rows = payload
        .as_array()
        .ok_or_else(|| DecodeError::InvalidFrame("trade payload is not an array".to_string()))?;

    rows.iter()
        .map(|row| {
            let row = row
                .as_array()
                .filter(|r| r.len() >= 4)
                .ok_or_else(|| DecodeError::InvalidFrame("trade row too short".to_string()))?;
            Ok(TradeUpdate {
                price: decimal(&row[0])?,
                volume: decimal(&row[1])?,
                time: timestamp_secs(&row[2])?,
                side: row[3]
                    .as_str()
                    .ok_or_else(|| {
                        DecodeError::InvalidFrame("trade side is not a string".to_string())
                    })?
                    .to_string(),
            })
        })
        .collect()
}

fn decode_book(payloads: &[Value]) -> Result<BookUpdate, DecodeError> {
    let mut book = BookUpdate::default();

    // Both-sides updates arrive as two payload objects in one frame.
    for payload in payloads {
        let object = payload
            .as_object()
            .ok_or_else(|| DecodeError::InvalidFrame("book payload is not an object".to_string()))?;

        if let Some(levels) = object.get("bs") {
            book.snapshot = true;
            book.bids.extend(decode_book_levels(levels)?);
        }
        if let Some(levels) = object.get("as") {
            book.snapshot = true;
            book.asks.extend(decode_book_levels(levels)?);
        }
        if let Some(levels) = object.get("b") {
            book.bids.extend(decode_book_levels(levels)?);
        }
        if let Some(levels) = object.get("a") {
            book.asks.extend(decode_book_levels(levels)?);
        }
    }

    Ok(book)
}

fn decode_book_levels(levels: &Value) -> Result<Vec<BookLevel>, DecodeError> {
    let rows = levels
        .as_array()
        .ok_or_else(|| DecodeError::InvalidFrame("book levels are not an array".to_string()))?;

    rows.iter()
        .map(|row| {
            let row = row
                .as_array()
                .filter(|r| r.len() >= 2)
                .ok_or_else(|| DecodeError::InvalidFrame("book level too short".to_string()))?;
            Ok(BookLevel {
                price: decimal(&row[0])?,
                volume: decimal(&row[1])?,
            })
        })
        .collect()
}

fn decode_ohlc(payload: &Value, minutes: &str) -> Result<OhlcUpdate, DecodeError> {
    let row = payload
        .as_array()
        .filter(|r| r.len() >= 8)
        .ok_or_else(|| DecodeError::InvalidFrame("ohlc payload too short".to_string()))?;

    Ok(OhlcUpdate {
        open: decimal(&row[2])?,
        high: decimal(&row[3])?,
        low: decimal(&row[4])?,
        close: decimal(&row[5])?,
        volume: decimal(&row[7])?,
        interval: format!("{minutes}m"),
    })
}

/// Decimal positioned at `object[key][index]`.
fn indexed_decimal(object: &Value, key: &str, index: usize) -> Result<Decimal, DecodeError> {
    let value = object
        .get(key)
        .and_then(|array| array.get(index))
        .ok_or_else(|| DecodeError::InvalidFrame(format!("missing ticker field {key}[{index}]")))?;
    decimal(value)
}

fn decimal(value: &Value) -> Result<Decimal, DecodeError> {
    match value {
        Value::String(s) => Ok(s.parse::<Decimal>()?),
        Value::Number(n) => Ok(n.to_string().parse::<Decimal>()?),
        _ => Err(DecodeError::InvalidFrame(
            "expected numeric value".to_string(),
        )),
    }
}

/// Timestamp encoded as decimal seconds, e.g. `"1700000000.123456"`.
fn timestamp_secs(value: &Value) -> Result<DateTime<Utc>, DecodeError> {
    let secs = match value {
        Value::String(s) => s.parse::<f64>().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
    .ok_or_else(|| DecodeError::InvalidFrame("bad timestamp".to_string()))?;

    #[allow(clippy::cast_possible_truncation)]
    let millis = (secs * 1000.0) as i64;
    DateTime::from_timestamp_millis(millis).ok_or(DecodeError::InvalidTimestamp(millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_ticker_frame() {
        let frame = r#"[340,{"a":["65000.14","1","1.000"],"b":["65000.10","2","2.000"],"c":["65000.12","0.01"],"v":["120.5","4500.1"],"p":["64900.0","64800.0"],"t":[100,2000],"l":["64000.00","63900.00"],"h":["65500.00","65600.00"],"o":["64880.00","64500.00"]},"ticker","XBT/USD"]"#;

        let message = decode_frame(frame).unwrap().unwrap();
        match message {
            KrakenMessage::Ticker { pair, ticker } => {
                assert_eq!(pair, "XBT/USD");
                assert_eq!(ticker.last.to_string(), "65000.12");
                assert_eq!(ticker.high_24h.to_string(), "65600.00");
                assert_eq!(ticker.open_24h.to_string(), "64500.00");
            }
            other => panic!("expected ticker, got {other:?}"),
        }
    }

    #[test]
    fn decode_trade_frame_with_batch() {
        let frame = r#"[337,[["65000.12","0.014","1700000000.123456","b","l",""],["65000.50","0.100","1700000000.223456","s","m",""]],"trade","XBT/USD"]"#;

        let message = decode_frame(frame).unwrap().unwrap();
        match message {
            KrakenMessage::Trades { pair, trades } => {
                assert_eq!(pair, "XBT/USD");
                assert_eq!(trades.len(), 2);
                assert_eq!(trades[0].side, "b");
                assert_eq!(trades[1].price.to_string(), "65000.50");
            }
            other => panic!("expected trades, got {other:?}"),
        }
    }

    #[test]
    fn decode_book_update_with_both_sides() {
        // Both-sides updates carry two payload objects.
        let frame = r#"[336,{"a":[["65001.00","1.25","1700000000.1"]]},{"b":[["64999.00","0.50","1700000000.1"]]},"book-10","XBT/USD"]"#;

        let message = decode_frame(frame).unwrap().unwrap();
        match message {
            KrakenMessage::Book { book, .. } => {
                assert!(!book.snapshot);
                assert_eq!(book.asks.len(), 1);
                assert_eq!(book.bids.len(), 1);
                assert_eq!(book.bids[0].price.to_string(), "64999.00");
            }
            other => panic!("expected book, got {other:?}"),
        }
    }

    #[test]
    fn decode_book_snapshot() {
        let frame = r#"[336,{"bs":[["64999.00","0.50","1700000000.1"]],"as":[["65001.00","1.25","1700000000.1"]]},"book-10","XBT/USD"]"#;

        let message = decode_frame(frame).unwrap().unwrap();
        match message {
            KrakenMessage::Book { book, .. } => {
                assert!(book.snapshot);
                assert_eq!(book.bids.len(), 1);
                assert_eq!(book.asks.len(), 1);
            }
            other => panic!("expected book, got {other:?}"),
        }
    }

    #[test]
    fn decode_ohlc_frame() {
        let frame = r#"[343,["1700000000.000000","1700000060.000000","64900.0","65100.0","64880.0","65000.1","64990.3","32.5",18],"ohlc-1","XBT/USD"]"#;

        let message = decode_frame(frame).unwrap().unwrap();
        match message {
            KrakenMessage::Ohlc { candle, .. } => {
                assert_eq!(candle.interval, "1m");
                assert_eq!(candle.close.to_string(), "65000.1");
                assert_eq!(candle.volume.to_string(), "32.5");
            }
            other => panic!("expected ohlc, got {other:?}"),
        }
    }

    #[test]
    fn decode_status_objects() {
        let heartbeat = decode_frame(r#"{"event":"heartbeat"}"#).unwrap().unwrap();
        assert!(matches!(
            heartbeat,
            KrakenMessage::Status(StatusEvent { ref event, .. }) if event == "heartbeat"
        ));

        let sub = decode_frame(
            r#"{"event":"subscriptionStatus","status":"subscribed","pair":"XBT/USD","channelName":"ticker"}"#,
        )
        .unwrap()
        .unwrap();
        match sub {
            KrakenMessage::Status(status) => {
                assert_eq!(status.status.as_deref(), Some("subscribed"));
                assert_eq!(status.pair.as_deref(), Some("XBT/USD"));
            }
            other => panic!("expected status, got {other:?}"),
        }
    }

    #[test]
    fn unknown_channel_decodes_to_none() {
        let frame = r#"[99,{"x":"y"},"spread","XBT/USD"]"#;
        assert!(decode_frame(frame).unwrap().is_none());
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert!(decode_frame("not json").is_err());
        assert!(decode_frame("[1,2]").is_err());
        assert!(decode_frame(r#"[1,{"c":["bad-price","1"]},"ticker","XBT/USD"]"#).is_err());
        assert!(decode_frame("42").is_err());
    }

    #[test]
    fn subscribe_request_serializes_to_wire_shape() {
        let request = SubscribeRequest {
            event: "subscribe",
            pair: vec!["XBT/USD".to_string()],
            subscription: ChannelSpec {
                name: "book",
                depth: Some(10),
                interval: None,
            },
        };

        let json = serde_json::to_string(&request).unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["event"], "subscribe");
        assert_eq!(value["pair"][0], "XBT/USD");
        assert_eq!(value["subscription"]["name"], "book");
        assert_eq!(value["subscription"]["depth"], 10);
        assert!(value["subscription"].get("interval").is_none());
    }
}
