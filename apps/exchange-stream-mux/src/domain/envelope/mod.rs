//! Normalized Stream Envelope Types
//!
//! The canonical, exchange-agnostic representation of market data. Every
//! connector parses its vendor frames into these types, so downstream
//! consumers never see a vendor wire format.
//!
//! All numeric payload fields are [`rust_decimal::Decimal`] regardless of
//! how the vendor encodes them (string or number). A field that cannot be
//! parsed fails envelope construction for that one message; the connection
//! is unaffected.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Exchange Identity
// =============================================================================

/// Supported market data venues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeId {
    /// Binance combined-stream WebSocket feed.
    Binance,
    /// Kraken public WebSocket feed (v1 protocol).
    Kraken,
}

impl ExchangeId {
    /// All supported venues.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Binance, Self::Kraken]
    }

    /// Lowercase identifier used in logs and envelopes.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Binance => "binance",
            Self::Kraken => "kraken",
        }
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown venue identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown exchange: {0}")]
pub struct UnknownExchange(pub String);

impl FromStr for ExchangeId {
    type Err = UnknownExchange;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "binance" => Ok(Self::Binance),
            "kraken" => Ok(Self::Kraken),
            other => Err(UnknownExchange(other.to_string())),
        }
    }
}

// =============================================================================
// Stream Kinds
// =============================================================================

/// Kinds of market data streams a subscriber can request.
///
/// The kind determines the payload shape and which vendor topics a
/// connector opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Summary quote: last price plus 24h statistics.
    Ticker,
    /// Individual executed trades.
    Trade,
    /// Incremental order book updates.
    Depth,
    /// Candlestick aggregates for a fixed interval.
    Kline,
}

impl StreamKind {
    /// All stream kinds.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Ticker, Self::Trade, Self::Depth, Self::Kline]
    }

    /// Lowercase identifier used in logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ticker => "ticker",
            Self::Trade => "trade",
            Self::Depth => "depth",
            Self::Kline => "kline",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// Aggressor side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    /// Taker bought (aggressive buy).
    Buy,
    /// Taker sold (aggressive sell).
    Sell,
}

/// Summary quote for a symbol: last price plus rolling 24h statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickerData {
    /// Last traded price.
    pub price: Decimal,
    /// Absolute price change over the last 24h.
    pub change_24h: Decimal,
    /// Percent price change over the last 24h.
    pub change_24h_percent: Decimal,
    /// Highest traded price over the last 24h.
    pub high_24h: Decimal,
    /// Lowest traded price over the last 24h.
    pub low_24h: Decimal,
    /// Base asset volume over the last 24h.
    pub volume_24h: Decimal,
    /// Current best bid price.
    pub bid: Decimal,
    /// Current best ask price.
    pub ask: Decimal,
}

/// A single executed trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeData {
    /// Execution price.
    pub price: Decimal,
    /// Executed base asset quantity.
    pub quantity: Decimal,
    /// Aggressor side.
    pub side: TradeSide,
    /// Execution time reported by the venue.
    pub trade_time: DateTime<Utc>,
}

/// One price level of an order book side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthLevel {
    /// Price of the level.
    pub price: Decimal,
    /// Resting quantity at the level (zero removes the level).
    pub quantity: Decimal,
}

/// An incremental order book update.
///
/// Levels are in the order the venue reported them; bids descending and
/// asks ascending by price on both supported venues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthData {
    /// Updated bid levels.
    pub bids: Vec<DepthLevel>,
    /// Updated ask levels.
    pub asks: Vec<DepthLevel>,
}

/// A candlestick aggregate for a fixed interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KlineData {
    /// Open price of the interval.
    pub open: Decimal,
    /// Highest price of the interval.
    pub high: Decimal,
    /// Lowest price of the interval.
    pub low: Decimal,
    /// Latest (or final) price of the interval.
    pub close: Decimal,
    /// Base asset volume of the interval.
    pub volume: Decimal,
    /// Interval label, e.g. `"1m"`.
    pub interval: String,
    /// Whether the interval is closed (final) or still forming.
    pub closed: bool,
}

/// Kind-specific payload of a stream envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamPayload {
    /// Summary quote update.
    Ticker(TickerData),
    /// Executed trade.
    Trade(TradeData),
    /// Order book delta.
    Depth(DepthData),
    /// Candlestick update.
    Kline(KlineData),
}

impl StreamPayload {
    /// The stream kind this payload belongs to.
    #[must_use]
    pub const fn kind(&self) -> StreamKind {
        match self {
            Self::Ticker(_) => StreamKind::Ticker,
            Self::Trade(_) => StreamKind::Trade,
            Self::Depth(_) => StreamKind::Depth,
            Self::Kline(_) => StreamKind::Kline,
        }
    }
}

// =============================================================================
// Stream Envelope
// =============================================================================

/// A normalized, exchange-agnostic market data event.
///
/// Envelopes are immutable values; connectors construct them and the
/// stream manager fans them out by cloning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEnvelope {
    /// Originating venue.
    pub exchange: ExchangeId,
    /// Canonical uppercase asset symbol, e.g. `"BTC"`.
    pub symbol: String,
    /// Stream kind; always consistent with the payload variant.
    pub kind: StreamKind,
    /// Capture time (when the connector parsed the frame).
    pub timestamp: DateTime<Utc>,
    /// Kind-specific payload.
    pub payload: StreamPayload,
}

impl StreamEnvelope {
    /// Build an envelope stamped with the current time.
    ///
    /// The `kind` field is derived from the payload so the two cannot
    /// diverge.
    #[must_use]
    pub fn new(exchange: ExchangeId, symbol: impl Into<String>, payload: StreamPayload) -> Self {
        Self::with_timestamp(exchange, symbol, Utc::now(), payload)
    }

    /// Build an envelope with an explicit capture time.
    #[must_use]
    pub fn with_timestamp(
        exchange: ExchangeId,
        symbol: impl Into<String>,
        timestamp: DateTime<Utc>,
        payload: StreamPayload,
    ) -> Self {
        Self {
            exchange,
            symbol: symbol.into(),
            kind: payload.kind(),
            timestamp,
            payload,
        }
    }
}

// =============================================================================
// Canonical Symbols
// =============================================================================

/// Normalize a caller-supplied symbol to canonical form.
///
/// Canonical symbols are 1-12 ASCII alphanumeric characters, uppercase.
/// Returns `None` for anything else; the stream manager rejects such
/// symbols synchronously instead of creating a vendor subscription it
/// cannot map.
#[must_use]
pub fn canonicalize_symbol(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.len() > 12 {
        return None;
    }
    if !trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(trimmed.to_ascii_uppercase())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_id_round_trips_through_str() {
        for id in ExchangeId::all() {
            assert_eq!(id.as_str().parse::<ExchangeId>().unwrap(), *id);
        }
    }

    #[test]
    fn exchange_id_parse_is_case_insensitive() {
        assert_eq!("Binance".parse::<ExchangeId>().unwrap(), ExchangeId::Binance);
        assert_eq!("KRAKEN".parse::<ExchangeId>().unwrap(), ExchangeId::Kraken);
    }

    #[test]
    fn exchange_id_parse_rejects_unknown() {
        let err = "mtgox".parse::<ExchangeId>().unwrap_err();
        assert_eq!(err, UnknownExchange("mtgox".to_string()));
    }

    #[test]
    fn payload_kind_matches_variant() {
        let depth = StreamPayload::Depth(DepthData {
            bids: vec![],
            asks: vec![],
        });
        assert_eq!(depth.kind(), StreamKind::Depth);
    }

    #[test]
    fn envelope_kind_is_derived_from_payload() {
        let env = StreamEnvelope::new(
            ExchangeId::Binance,
            "BTC",
            StreamPayload::Trade(TradeData {
                price: Decimal::new(650_001_2, 1),
                quantity: Decimal::ONE,
                side: TradeSide::Buy,
                trade_time: Utc::now(),
            }),
        );
        assert_eq!(env.kind, StreamKind::Trade);
        assert_eq!(env.symbol, "BTC");
    }

    #[test]
    fn canonicalize_accepts_plain_symbols() {
        assert_eq!(canonicalize_symbol("btc").as_deref(), Some("BTC"));
        assert_eq!(canonicalize_symbol(" Eth ").as_deref(), Some("ETH"));
        assert_eq!(canonicalize_symbol("1INCH").as_deref(), Some("1INCH"));
    }

    #[test]
    fn canonicalize_rejects_garbage() {
        assert_eq!(canonicalize_symbol(""), None);
        assert_eq!(canonicalize_symbol("BTC/USD"), None);
        assert_eq!(canonicalize_symbol("AVERYLONGSYMBOL"), None);
        assert_eq!(canonicalize_symbol("btc usdt"), None);
    }

    #[test]
    fn stream_kind_all_covers_every_kind() {
        let all = StreamKind::all();
        assert_eq!(all.len(), 4);
        assert!(all.contains(&StreamKind::Ticker));
        assert!(all.contains(&StreamKind::Trade));
        assert!(all.contains(&StreamKind::Depth));
        assert!(all.contains(&StreamKind::Kline));
    }
}
