//! Binance WebSocket Connector
//!
//! Speaks Binance's public market data stream protocol: one shared
//! endpoint, batched `SUBSCRIBE`/`UNSUBSCRIBE` control messages with a
//! numeric request id, and topic names built as
//! `{vendor-symbol}@{stream-suffix}`.
//!
//! # Topics
//!
//! | Kind   | Topic                  |
//! |--------|------------------------|
//! | Ticker | `btcusdt@ticker`       |
//! | Trade  | `btcusdt@trade`        |
//! | Depth  | `btcusdt@depth@100ms`  |
//! | Kline  | `btcusdt@kline_1m`     |

pub mod messages;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;

use self::messages::{BinanceEvent, ControlRequest, decode_frame};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use super::watchdog::{TrafficMonitor, Watchdog, WatchdogConfig, WatchdogEvent};
use super::{ConnectorStats, DecodeError, SubscriptionCommand};
use crate::application::ports::{
    ConnectionState, ConnectorError, ConnectorStatus, EnvelopeSink, ExchangeConnector,
};
use crate::domain::envelope::{
    DepthData, DepthLevel, ExchangeId, KlineData, StreamEnvelope, StreamKind, StreamPayload,
    TickerData, TradeData, TradeSide,
};

/// Binance public market data stream endpoint.
pub const WS_URL: &str = "wss://stream.binance.com:9443/ws";

// =============================================================================
// Symbol Mapping
// =============================================================================

/// Explicit canonical → vendor symbol mappings for the majors.
const SYMBOL_TABLE: &[(&str, &str)] = &[
    ("BTC", "BTCUSDT"),
    ("ETH", "ETHUSDT"),
    ("SOL", "SOLUSDT"),
    ("XRP", "XRPUSDT"),
    ("DOGE", "DOGEUSDT"),
];

/// Quote suffixes recognized when reversing a vendor symbol.
const QUOTE_SUFFIXES: &[&str] = &["USDT", "USDC", "BUSD", "BTC", "ETH", "BNB"];

/// Vendor symbol for a canonical symbol.
///
/// Falls back deterministically to uppercasing and appending the default
/// `USDT` quote asset for symbols not in the explicit table.
#[must_use]
pub fn vendor_symbol(canonical: &str) -> String {
    SYMBOL_TABLE
        .iter()
        .find(|(c, _)| *c == canonical)
        .map_or_else(
            || format!("{}USDT", canonical.to_ascii_uppercase()),
            |(_, vendor)| (*vendor).to_string(),
        )
}

/// Canonical symbol for a vendor symbol, stripping a known quote suffix.
#[must_use]
pub fn canonical_symbol(vendor: &str) -> String {
    let upper = vendor.to_ascii_uppercase();
    for suffix in QUOTE_SUFFIXES {
        if upper.len() > suffix.len() && upper.ends_with(suffix) {
            return upper[..upper.len() - suffix.len()].to_string();
        }
    }
    upper
}

/// Topic name for a canonical symbol and stream kind.
#[must_use]
pub fn stream_topic(canonical: &str, kind: StreamKind) -> String {
    let vendor = vendor_symbol(canonical).to_ascii_lowercase();
    match kind {
        StreamKind::Ticker => format!("{vendor}@ticker"),
        StreamKind::Trade => format!("{vendor}@trade"),
        StreamKind::Depth => format!("{vendor}@depth@100ms"),
        StreamKind::Kline => format!("{vendor}@kline_1m"),
    }
}

// =============================================================================
// Frame → Envelope
// =============================================================================

/// Parse one inbound text frame into zero or more normalized envelopes.
///
/// # Errors
///
/// Returns an error for invalid JSON or a recognized event with a
/// malformed field; callers drop the frame and keep reading.
pub fn parse_frame(text: &str) -> Result<Vec<StreamEnvelope>, DecodeError> {
    decode_frame(text)?
        .into_iter()
        .map(envelope_from_event)
        .collect()
}

fn envelope_from_event(event: BinanceEvent) -> Result<StreamEnvelope, DecodeError> {
    let envelope = match event {
        BinanceEvent::Ticker(ticker) => StreamEnvelope::new(
            ExchangeId::Binance,
            canonical_symbol(&ticker.symbol),
            StreamPayload::Ticker(TickerData {
                price: ticker.last_price,
                change_24h: ticker.price_change,
                change_24h_percent: ticker.price_change_percent,
                high_24h: ticker.high,
                low_24h: ticker.low,
                volume_24h: ticker.volume,
                bid: ticker.bid,
                ask: ticker.ask,
            }),
        ),
        BinanceEvent::Trade(trade) => {
            let trade_time = DateTime::from_timestamp_millis(trade.trade_time)
                .ok_or(DecodeError::InvalidTimestamp(trade.trade_time))?;
            StreamEnvelope::new(
                ExchangeId::Binance,
                canonical_symbol(&trade.symbol),
                StreamPayload::Trade(TradeData {
                    price: trade.price,
                    quantity: trade.quantity,
                    // The buyer being the maker means the taker sold.
                    side: if trade.is_buyer_maker {
                        TradeSide::Sell
                    } else {
                        TradeSide::Buy
                    },
                    trade_time,
                }),
            )
        }
        BinanceEvent::Depth(depth) => StreamEnvelope::new(
            ExchangeId::Binance,
            canonical_symbol(&depth.symbol),
            StreamPayload::Depth(DepthData {
                bids: parse_levels(&depth.bids)?,
                asks: parse_levels(&depth.asks)?,
            }),
        ),
        BinanceEvent::Kline(event) => StreamEnvelope::new(
            ExchangeId::Binance,
            canonical_symbol(&event.symbol),
            StreamPayload::Kline(KlineData {
                open: event.kline.open,
                high: event.kline.high,
                low: event.kline.low,
                close: event.kline.close,
                volume: event.kline.volume,
                interval: event.kline.interval,
                closed: event.kline.is_closed,
            }),
        ),
    };
    Ok(envelope)
}

fn parse_levels(raw: &[[String; 2]]) -> Result<Vec<DepthLevel>, DecodeError> {
    raw.iter()
        .map(|[price, quantity]| {
            Ok(DepthLevel {
                price: price.parse::<Decimal>()?,
                quantity: quantity.parse::<Decimal>()?,
            })
        })
        .collect()
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the Binance connector.
#[derive(Debug, Clone)]
pub struct BinanceConfig {
    /// WebSocket endpoint.
    pub url: String,
    /// Reconnection behavior.
    pub reconnect: ReconnectConfig,
    /// Idle watchdog behavior.
    pub watchdog: WatchdogConfig,
    /// Bound on a single connect attempt.
    pub connect_timeout: Duration,
}

impl Default for BinanceConfig {
    fn default() -> Self {
        Self {
            url: WS_URL.to_string(),
            reconnect: ReconnectConfig::default(),
            watchdog: WatchdogConfig::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

// =============================================================================
// Connector
// =============================================================================

/// One supervised WebSocket connection to Binance.
///
/// Owns its subscription table and connection exclusively; parsed
/// envelopes flow out through the injected [`EnvelopeSink`] only.
pub struct BinanceConnector {
    config: BinanceConfig,
    sink: Arc<dyn EnvelopeSink>,
    cancel: CancellationToken,
    subscriptions: RwLock<HashMap<String, HashSet<StreamKind>>>,
    command_tx: mpsc::UnboundedSender<SubscriptionCommand>,
    command_rx: AsyncMutex<mpsc::UnboundedReceiver<SubscriptionCommand>>,
    connected: AtomicBool,
    request_id: AtomicU64,
    stats: ConnectorStats,
}

impl BinanceConnector {
    /// Create a connector delivering into `sink` until `cancel` fires.
    #[must_use]
    pub fn new(config: BinanceConfig, sink: Arc<dyn EnvelopeSink>, cancel: CancellationToken) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        Self {
            config,
            sink,
            cancel,
            subscriptions: RwLock::new(HashMap::new()),
            command_tx,
            command_rx: AsyncMutex::new(command_rx),
            connected: AtomicBool::new(false),
            request_id: AtomicU64::new(1),
            stats: ConnectorStats::default(),
        }
    }

    /// Snapshot of the subscription table.
    #[must_use]
    pub fn subscriptions(&self) -> HashMap<String, HashSet<StreamKind>> {
        self.subscriptions.read().clone()
    }

    /// Control request that restores every tracked subscription, or `None`
    /// when nothing is tracked. Sent as the first frame after every
    /// successful connect.
    #[must_use]
    pub fn resubscribe_request(&self) -> Option<ControlRequest> {
        let table = self.subscriptions.read();
        if table.is_empty() {
            return None;
        }
        let mut params: Vec<String> = table
            .iter()
            .flat_map(|(symbol, kinds)| kinds.iter().map(|kind| stream_topic(symbol, *kind)))
            .collect();
        params.sort();
        Some(ControlRequest {
            method: "SUBSCRIBE",
            params,
            id: self.next_request_id(),
        })
    }

    fn next_request_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Connect once and stream until the connection drops, the watchdog
    /// declares it dead, or cancellation fires (clean `Ok`).
    async fn connect_and_stream(&self, policy: &mut ReconnectPolicy) -> Result<(), ConnectorError> {
        self.stats.set_state(ConnectionState::Connecting);
        tracing::info!(url = %self.config.url, "connecting to Binance stream");

        let connect = tokio_tungstenite::connect_async(self.config.url.as_str());
        let (ws_stream, _response) = match tokio::time::timeout(self.config.connect_timeout, connect).await
        {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return Err(ConnectorError::Transport(e.to_string())),
            Err(_) => return Err(ConnectorError::ConnectTimeout),
        };

        policy.reset();
        self.stats.set_state(ConnectionState::Connected);
        tracing::info!("connected to Binance stream");

        let (mut write, mut read) = ws_stream.split();

        let mut command_rx = self.command_rx.lock().await;
        // Commands queued while disconnected are stale; the table replay
        // below covers everything they asked for.
        while command_rx.try_recv().is_ok() {}

        if let Some(request) = self.resubscribe_request() {
            tracing::info!(topics = request.params.len(), "restoring subscriptions");
            self.send_request(&mut write, &request).await?;
        }
        self.connected.store(true, Ordering::SeqCst);

        // Idle watchdog for this connection.
        let monitor = Arc::new(TrafficMonitor::new());
        let (watchdog_tx, mut watchdog_rx) = mpsc::channel(8);
        let watchdog_cancel = self.cancel.child_token();
        tokio::spawn(
            Watchdog::new(
                self.config.watchdog.clone(),
                Arc::clone(&monitor),
                watchdog_tx,
                watchdog_cancel.clone(),
            )
            .run(),
        );

        let result = loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = write.close().await;
                    break Ok(());
                }
                event = watchdog_rx.recv() => {
                    match event {
                        Some(WatchdogEvent::SendPing) => {
                            if let Err(e) = write.send(Message::Ping(vec![].into())).await {
                                break Err(ConnectorError::Transport(e.to_string()));
                            }
                        }
                        Some(WatchdogEvent::Dead) | None => break Err(ConnectorError::IdleTimeout),
                    }
                }
                command = command_rx.recv() => {
                    if let Some(command) = command {
                        if let Err(e) = self.send_command(&mut write, command).await {
                            break Err(e);
                        }
                    }
                }
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            monitor.record();
                            self.handle_frame(&text);
                        }
                        Some(Ok(Message::Ping(data))) => {
                            monitor.record();
                            if let Err(e) = write.send(Message::Pong(data)).await {
                                break Err(ConnectorError::Transport(e.to_string()));
                            }
                        }
                        Some(Ok(Message::Pong(_))) => monitor.record(),
                        Some(Ok(Message::Close(_))) => {
                            tracing::info!("server sent close frame");
                            break Err(ConnectorError::ConnectionClosed);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break Err(ConnectorError::Transport(e.to_string())),
                        None => break Err(ConnectorError::ConnectionClosed),
                    }
                }
            }
        };

        watchdog_cancel.cancel();
        self.connected.store(false, Ordering::SeqCst);
        result
    }

    /// Parse one frame and feed the resulting envelopes into the sink.
    /// Malformed frames are dropped; the loop continues.
    fn handle_frame(&self, text: &str) {
        match parse_frame(text) {
            Ok(envelopes) => {
                for envelope in envelopes {
                    self.stats.record_parsed();
                    if let Err(error) = self.sink.on_envelope(&envelope) {
                        tracing::error!(symbol = %envelope.symbol, %error, "sink rejected envelope");
                    }
                }
            }
            Err(error) => {
                self.stats.record_dropped();
                tracing::debug!(%error, frame_len = text.len(), "dropped unparseable frame");
            }
        }
    }

    /// Turn a queued subscription command into a vendor control message.
    async fn send_command<W>(
        &self,
        write: &mut W,
        command: SubscriptionCommand,
    ) -> Result<(), ConnectorError>
    where
        W: SinkExt<Message> + Unpin,
        W::Error: std::fmt::Display,
    {
        let (method, symbol, kinds) = match command {
            SubscriptionCommand::Subscribe { symbol, kinds } => ("SUBSCRIBE", symbol, kinds),
            SubscriptionCommand::Unsubscribe { symbol, kinds } => ("UNSUBSCRIBE", symbol, kinds),
        };
        let request = ControlRequest {
            method,
            params: kinds
                .iter()
                .map(|kind| stream_topic(&symbol, *kind))
                .collect(),
            id: self.next_request_id(),
        };
        self.send_request(write, &request).await
    }

    async fn send_request<W>(&self, write: &mut W, request: &ControlRequest) -> Result<(), ConnectorError>
    where
        W: SinkExt<Message> + Unpin,
        W::Error: std::fmt::Display,
    {
        let json = serde_json::to_string(request)
            .map_err(|e| ConnectorError::Transport(format!("failed to serialize request: {e}")))?;
        tracing::debug!(method = request.method, topics = ?request.params, "sending control message");
        write
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| ConnectorError::Transport(format!("failed to send request: {e}")))
    }
}

#[async_trait]
impl ExchangeConnector for BinanceConnector {
    fn exchange(&self) -> ExchangeId {
        ExchangeId::Binance
    }

    async fn run(self: Arc<Self>) -> Result<(), ConnectorError> {
        let mut policy = ReconnectPolicy::new(self.config.reconnect.clone());

        loop {
            if self.cancel.is_cancelled() {
                self.stats.set_state(ConnectionState::Stopped);
                tracing::info!("Binance connector cancelled");
                return Ok(());
            }

            match self.connect_and_stream(&mut policy).await {
                Ok(()) => {
                    self.stats.set_state(ConnectionState::Stopped);
                    tracing::info!("Binance connector cancelled, connection closed");
                    return Ok(());
                }
                Err(error) => {
                    self.stats.set_state(ConnectionState::Disconnected);
                    tracing::warn!(%error, "Binance connection lost");

                    if let Some(delay) = policy.next_delay() {
                        self.stats.record_reconnect();
                        tracing::info!(
                            attempt = policy.attempt_count(),
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            "reconnecting to Binance stream"
                        );
                        tokio::select! {
                            () = self.cancel.cancelled() => {
                                self.stats.set_state(ConnectionState::Stopped);
                                return Ok(());
                            }
                            () = tokio::time::sleep(delay) => {}
                        }
                    } else {
                        return Err(ConnectorError::MaxReconnectAttemptsExceeded);
                    }
                }
            }
        }
    }

    fn subscribe(&self, symbol: &str, kinds: &[StreamKind]) {
        let added: Vec<StreamKind> = {
            let mut table = self.subscriptions.write();
            let entry = table.entry(symbol.to_string()).or_default();
            kinds.iter().copied().filter(|kind| entry.insert(*kind)).collect()
        };
        if added.is_empty() {
            return;
        }
        tracing::debug!(symbol, kinds = ?added, "tracking Binance subscription");
        if self.connected.load(Ordering::SeqCst) {
            let _ = self.command_tx.send(SubscriptionCommand::Subscribe {
                symbol: symbol.to_string(),
                kinds: added,
            });
        }
    }

    fn unsubscribe(&self, symbol: &str, kinds: &[StreamKind]) {
        let removed: Vec<StreamKind> = {
            let mut table = self.subscriptions.write();
            let Some(entry) = table.get_mut(symbol) else {
                return;
            };
            let removed: Vec<StreamKind> =
                kinds.iter().copied().filter(|kind| entry.remove(kind)).collect();
            if entry.is_empty() {
                table.remove(symbol);
            }
            removed
        };
        if removed.is_empty() {
            return;
        }
        tracing::debug!(symbol, kinds = ?removed, "dropping Binance subscription");
        if self.connected.load(Ordering::SeqCst) {
            let _ = self.command_tx.send(SubscriptionCommand::Unsubscribe {
                symbol: symbol.to_string(),
                kinds: removed,
            });
        }
    }

    fn status(&self) -> ConnectorStatus {
        self.stats.snapshot(self.subscriptions.read().len())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::application::ports::SinkError;

    struct NullSink;

    impl EnvelopeSink for NullSink {
        fn on_envelope(&self, _envelope: &StreamEnvelope) -> Result<(), SinkError> {
            Ok(())
        }
    }

    fn connector() -> BinanceConnector {
        BinanceConnector::new(
            BinanceConfig::default(),
            Arc::new(NullSink),
            CancellationToken::new(),
        )
    }

    #[test]
    fn vendor_symbol_uses_table_then_fallback() {
        assert_eq!(vendor_symbol("BTC"), "BTCUSDT");
        assert_eq!(vendor_symbol("PEPE"), "PEPEUSDT");
    }

    #[test]
    fn canonical_symbol_strips_known_quotes() {
        assert_eq!(canonical_symbol("BTCUSDT"), "BTC");
        assert_eq!(canonical_symbol("ETHBTC"), "ETH");
        assert_eq!(canonical_symbol("WEIRD"), "WEIRD");
    }

    #[test_case(StreamKind::Ticker, "btcusdt@ticker")]
    #[test_case(StreamKind::Trade, "btcusdt@trade")]
    #[test_case(StreamKind::Depth, "btcusdt@depth@100ms")]
    #[test_case(StreamKind::Kline, "btcusdt@kline_1m")]
    fn stream_topics_match_vendor_naming(kind: StreamKind, expected: &str) {
        assert_eq!(stream_topic("BTC", kind), expected);
    }

    #[test]
    fn ticker_frame_becomes_normalized_envelope() {
        let frame = r#"{"e":"24hrTicker","s":"BTCUSDT","p":"120.50","P":"0.19","c":"65000.12","h":"65500.00","l":"64000.00","v":"12345.678","b":"65000.10","a":"65000.14"}"#;

        let envelopes = parse_frame(frame).unwrap();
        assert_eq!(envelopes.len(), 1);
        let envelope = &envelopes[0];
        assert_eq!(envelope.exchange, ExchangeId::Binance);
        assert_eq!(envelope.symbol, "BTC");
        assert_eq!(envelope.kind, StreamKind::Ticker);
        match &envelope.payload {
            StreamPayload::Ticker(data) => {
                assert_eq!(data.price.to_string(), "65000.12");
                assert_eq!(data.high_24h.to_string(), "65500.00");
            }
            other => panic!("expected ticker payload, got {other:?}"),
        }
    }

    #[test]
    fn buyer_maker_flag_maps_to_sell_side() {
        let frame = r#"{"e":"trade","s":"BTCUSDT","t":9,"p":"65000.12","q":"0.5","T":1700000000123,"m":true}"#;

        let envelopes = parse_frame(frame).unwrap();
        match &envelopes[0].payload {
            StreamPayload::Trade(data) => assert_eq!(data.side, TradeSide::Sell),
            other => panic!("expected trade payload, got {other:?}"),
        }
    }

    #[test]
    fn depth_levels_are_parsed_to_decimals() {
        let frame = r#"{"e":"depthUpdate","s":"BTCUSDT","b":[["64999.00","0.5"]],"a":[["65001.00","0"]]}"#;

        let envelopes = parse_frame(frame).unwrap();
        match &envelopes[0].payload {
            StreamPayload::Depth(data) => {
                assert_eq!(data.bids[0].price.to_string(), "64999.00");
                assert_eq!(data.asks[0].quantity, Decimal::ZERO);
            }
            other => panic!("expected depth payload, got {other:?}"),
        }
    }

    #[test]
    fn malformed_frame_is_isolated_from_later_frames() {
        assert!(parse_frame(r#"{"e":"24hrTicker","s":"BTCUSDT","c":"oops"}"#).is_err());

        // A subsequent valid frame still parses.
        let frame = r#"{"e":"trade","s":"BTCUSDT","t":1,"p":"65000.12","q":"1","T":1700000000123,"m":false}"#;
        assert_eq!(parse_frame(frame).unwrap().len(), 1);
    }

    #[test]
    fn subscribe_is_idempotent_and_additive() {
        let connector = connector();
        connector.subscribe("BTC", &[StreamKind::Ticker]);
        connector.subscribe("BTC", &[StreamKind::Ticker, StreamKind::Trade]);

        let table = connector.subscriptions();
        assert_eq!(table.len(), 1);
        assert_eq!(table["BTC"].len(), 2);
    }

    #[test]
    fn unsubscribe_removes_exactly_the_named_kinds() {
        let connector = connector();
        connector.subscribe("BTC", &[StreamKind::Ticker, StreamKind::Trade]);
        connector.unsubscribe("BTC", &[StreamKind::Trade, StreamKind::Kline]);

        let table = connector.subscriptions();
        assert_eq!(
            table["BTC"].iter().copied().collect::<Vec<_>>(),
            vec![StreamKind::Ticker]
        );

        connector.unsubscribe("BTC", &[StreamKind::Ticker]);
        assert!(connector.subscriptions().is_empty());
    }

    #[test]
    fn resubscribe_request_covers_exactly_the_table() {
        let connector = connector();
        assert!(connector.resubscribe_request().is_none());

        connector.subscribe("BTC", &[StreamKind::Ticker, StreamKind::Trade]);
        connector.subscribe("ETH", &[StreamKind::Ticker]);
        connector.unsubscribe("ETH", &[StreamKind::Ticker]);

        let request = connector.resubscribe_request().unwrap();
        assert_eq!(request.method, "SUBSCRIBE");
        assert_eq!(request.params, vec!["btcusdt@ticker", "btcusdt@trade"]);
    }
}
