//! Kraken WebSocket Connector
//!
//! Speaks Kraken's public v1 WebSocket protocol: per-channel JSON
//! subscribe/unsubscribe messages naming a channel (`ticker`, `trade`,
//! `book` with a depth parameter, `ohlc` with an interval) and a
//! slash-separated vendor pair with venue base-asset aliasing
//! (`BTC` → `XBT`).

pub mod messages;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;

use self::messages::{
    BookLevel, ChannelSpec, KrakenMessage, StatusEvent, SubscribeRequest, decode_frame,
};
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

/// Kraken public WebSocket endpoint.
pub const WS_URL: &str = "wss://ws.kraken.com";

/// Order book depth requested on the `book` channel.
pub const BOOK_DEPTH: u32 = 10;

/// Candle interval requested on the `ohlc` channel, in minutes.
pub const OHLC_INTERVAL_MINUTES: u32 = 1;

// =============================================================================
// Pair Mapping
// =============================================================================

/// Explicit canonical → vendor pair mappings for the majors.
const PAIR_TABLE: &[(&str, &str)] = &[
    ("BTC", "XBT/USD"),
    ("ETH", "ETH/USD"),
    ("SOL", "SOL/USD"),
    ("XRP", "XRP/USD"),
    ("DOGE", "XDG/USD"),
];

/// Kraken base-asset aliases applied in the fallback path.
const BASE_ALIASES: &[(&str, &str)] = &[("BTC", "XBT"), ("DOGE", "XDG")];

/// Vendor pair for a canonical symbol.
///
/// Falls back deterministically to the aliased uppercase base plus the
/// default `/USD` quote for symbols not in the explicit table.
#[must_use]
pub fn vendor_pair(canonical: &str) -> String {
    if let Some((_, pair)) = PAIR_TABLE.iter().find(|(c, _)| *c == canonical) {
        return (*pair).to_string();
    }
    let upper = canonical.to_ascii_uppercase();
    let base = BASE_ALIASES
        .iter()
        .find(|(c, _)| *c == upper)
        .map_or(upper.as_str(), |(_, alias)| *alias);
    format!("{base}/USD")
}

/// Canonical symbol for a vendor pair, undoing the base-asset alias.
#[must_use]
pub fn canonical_from_pair(pair: &str) -> String {
    let base = pair.split('/').next().unwrap_or(pair).to_ascii_uppercase();
    BASE_ALIASES
        .iter()
        .find(|(_, alias)| *alias == base)
        .map_or(base.clone(), |(canonical, _)| (*canonical).to_string())
}

/// Channel selector for a stream kind.
#[must_use]
pub const fn channel_spec(kind: StreamKind) -> ChannelSpec {
    match kind {
        StreamKind::Ticker => ChannelSpec {
            name: "ticker",
            depth: None,
            interval: None,
        },
        StreamKind::Trade => ChannelSpec {
            name: "trade",
            depth: None,
            interval: None,
        },
        StreamKind::Depth => ChannelSpec {
            name: "book",
            depth: Some(BOOK_DEPTH),
            interval: None,
        },
        StreamKind::Kline => ChannelSpec {
            name: "ohlc",
            depth: None,
            interval: Some(OHLC_INTERVAL_MINUTES),
        },
    }
}

// =============================================================================
// Frame → Envelope
// =============================================================================

/// Parse one inbound text frame into zero or more normalized envelopes.
///
/// Status and heartbeat objects, and data on channels this crate does not
/// consume, parse to an empty vector.
///
/// # Errors
///
/// Returns an error for invalid JSON or a malformed data frame; callers
/// drop the frame and keep reading.
pub fn parse_frame(text: &str) -> Result<Vec<StreamEnvelope>, DecodeError> {
    match decode_frame(text)? {
        Some(KrakenMessage::Status(_)) | None => Ok(vec![]),
        Some(message) => envelopes_from_message(message),
    }
}

fn envelopes_from_message(message: KrakenMessage) -> Result<Vec<StreamEnvelope>, DecodeError> {
    match message {
        KrakenMessage::Status(_) => Ok(vec![]),
        KrakenMessage::Ticker { pair, ticker } => {
            let change = ticker.last - ticker.open_24h;
            let change_percent = if ticker.open_24h.is_zero() {
                Decimal::ZERO
            } else {
                change / ticker.open_24h * Decimal::ONE_HUNDRED
            };
            Ok(vec![StreamEnvelope::new(
                ExchangeId::Kraken,
                canonical_from_pair(&pair),
                StreamPayload::Ticker(TickerData {
                    price: ticker.last,
                    change_24h: change,
                    change_24h_percent: change_percent,
                    high_24h: ticker.high_24h,
                    low_24h: ticker.low_24h,
                    volume_24h: ticker.volume_24h,
                    bid: ticker.bid,
                    ask: ticker.ask,
                }),
            )])
        }
        KrakenMessage::Trades { pair, trades } => {
            let symbol = canonical_from_pair(&pair);
            trades
                .into_iter()
                .map(|trade| {
                    let side = match trade.side.as_str() {
                        "b" => TradeSide::Buy,
                        "s" => TradeSide::Sell,
                        other => {
                            return Err(DecodeError::InvalidFrame(format!(
                                "unknown trade side {other:?}"
                            )));
                        }
                    };
                    Ok(StreamEnvelope::new(
                        ExchangeId::Kraken,
                        symbol.clone(),
                        StreamPayload::Trade(TradeData {
                            price: trade.price,
                            quantity: trade.volume,
                            side,
                            trade_time: trade.time,
                        }),
                    ))
                })
                .collect()
        }
        KrakenMessage::Book { pair, book } => Ok(vec![StreamEnvelope::new(
            ExchangeId::Kraken,
            canonical_from_pair(&pair),
            StreamPayload::Depth(DepthData {
                bids: depth_levels(book.bids),
                asks: depth_levels(book.asks),
            }),
        )]),
        KrakenMessage::Ohlc { pair, candle } => Ok(vec![StreamEnvelope::new(
            ExchangeId::Kraken,
            canonical_from_pair(&pair),
            StreamPayload::Kline(KlineData {
                open: candle.open,
                high: candle.high,
                low: candle.low,
                close: candle.close,
                volume: candle.volume,
                interval: candle.interval,
                // Kraken does not flag candle completion.
                closed: false,
            }),
        )]),
    }
}

fn depth_levels(levels: Vec<BookLevel>) -> Vec<DepthLevel> {
    levels
        .into_iter()
        .map(|level| DepthLevel {
            price: level.price,
            quantity: level.volume,
        })
        .collect()
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the Kraken connector.
#[derive(Debug, Clone)]
pub struct KrakenConfig {
    /// WebSocket endpoint.
    pub url: String,
    /// Reconnection behavior.
    pub reconnect: ReconnectConfig,
    /// Idle watchdog behavior.
    pub watchdog: WatchdogConfig,
    /// Bound on a single connect attempt.
    pub connect_timeout: Duration,
}

impl Default for KrakenConfig {
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

/// One supervised WebSocket connection to Kraken.
pub struct KrakenConnector {
    config: KrakenConfig,
    sink: Arc<dyn EnvelopeSink>,
    cancel: CancellationToken,
    subscriptions: RwLock<HashMap<String, HashSet<StreamKind>>>,
    command_tx: mpsc::UnboundedSender<SubscriptionCommand>,
    command_rx: AsyncMutex<mpsc::UnboundedReceiver<SubscriptionCommand>>,
    connected: AtomicBool,
    stats: ConnectorStats,
}

impl KrakenConnector {
    /// Create a connector delivering into `sink` until `cancel` fires.
    #[must_use]
    pub fn new(config: KrakenConfig, sink: Arc<dyn EnvelopeSink>, cancel: CancellationToken) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        Self {
            config,
            sink,
            cancel,
            subscriptions: RwLock::new(HashMap::new()),
            command_tx,
            command_rx: AsyncMutex::new(command_rx),
            connected: AtomicBool::new(false),
            stats: ConnectorStats::default(),
        }
    }

    /// Snapshot of the subscription table.
    #[must_use]
    pub fn subscriptions(&self) -> HashMap<String, HashSet<StreamKind>> {
        self.subscriptions.read().clone()
    }

    /// Control requests that restore every tracked subscription. Kraken
    /// takes one message per channel, so this is one request per tracked
    /// `(symbol, kind)`. Sent as the first frames after every successful
    /// connect.
    #[must_use]
    pub fn resubscribe_requests(&self) -> Vec<SubscribeRequest> {
        let table = self.subscriptions.read();
        let mut entries: Vec<(String, StreamKind)> = table
            .iter()
            .flat_map(|(symbol, kinds)| kinds.iter().map(|kind| (symbol.clone(), *kind)))
            .collect();
        entries.sort_by(|a, b| (&a.0, a.1.as_str()).cmp(&(&b.0, b.1.as_str())));

        entries
            .into_iter()
            .map(|(symbol, kind)| SubscribeRequest {
                event: "subscribe",
                pair: vec![vendor_pair(&symbol)],
                subscription: channel_spec(kind),
            })
            .collect()
    }

    async fn connect_and_stream(&self, policy: &mut ReconnectPolicy) -> Result<(), ConnectorError> {
        self.stats.set_state(ConnectionState::Connecting);
        tracing::info!(url = %self.config.url, "connecting to Kraken stream");

        let connect = tokio_tungstenite::connect_async(self.config.url.as_str());
        let (ws_stream, _response) = match tokio::time::timeout(self.config.connect_timeout, connect).await
        {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return Err(ConnectorError::Transport(e.to_string())),
            Err(_) => return Err(ConnectorError::ConnectTimeout),
        };

        policy.reset();
        self.stats.set_state(ConnectionState::Connected);
        tracing::info!("connected to Kraken stream");

        let (mut write, mut read) = ws_stream.split();

        let mut command_rx = self.command_rx.lock().await;
        // Stale queued commands are superseded by the table replay.
        while command_rx.try_recv().is_ok() {}

        let restore = self.resubscribe_requests();
        if !restore.is_empty() {
            tracing::info!(channels = restore.len(), "restoring subscriptions");
            for request in &restore {
                self.send_request(&mut write, request).await?;
            }
        }
        self.connected.store(true, Ordering::SeqCst);

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

    /// Decode one frame: status objects are logged, data frames are
    /// normalized and fed into the sink, malformed frames are dropped.
    fn handle_frame(&self, text: &str) {
        match decode_frame(text) {
            Ok(Some(KrakenMessage::Status(status))) => self.handle_status(&status),
            Ok(Some(message)) => match envelopes_from_message(message) {
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
                    tracing::debug!(%error, frame_len = text.len(), "dropped malformed data frame");
                }
            },
            Ok(None) => {}
            Err(error) => {
                self.stats.record_dropped();
                tracing::debug!(%error, frame_len = text.len(), "dropped unparseable frame");
            }
        }
    }

    fn handle_status(&self, status: &StatusEvent) {
        match status.event.as_str() {
            "heartbeat" => tracing::trace!("kraken heartbeat"),
            "systemStatus" => {
                tracing::info!(status = ?status.status, "kraken system status");
            }
            "subscriptionStatus" => {
                if status.status.as_deref() == Some("error") {
                    tracing::warn!(
                        pair = ?status.pair,
                        error = ?status.error_message,
                        "kraken subscription rejected"
                    );
                } else {
                    tracing::debug!(
                        pair = ?status.pair,
                        status = ?status.status,
                        "kraken subscription status"
                    );
                }
            }
            other => tracing::trace!(event = other, "unhandled kraken status event"),
        }
    }

    async fn send_command<W>(
        &self,
        write: &mut W,
        command: SubscriptionCommand,
    ) -> Result<(), ConnectorError>
    where
        W: SinkExt<Message> + Unpin,
        W::Error: std::fmt::Display,
    {
        let (event, symbol, kinds) = match command {
            SubscriptionCommand::Subscribe { symbol, kinds } => ("subscribe", symbol, kinds),
            SubscriptionCommand::Unsubscribe { symbol, kinds } => ("unsubscribe", symbol, kinds),
        };
        // One control message per channel on this venue.
        for kind in kinds {
            let request = SubscribeRequest {
                event,
                pair: vec![vendor_pair(&symbol)],
                subscription: channel_spec(kind),
            };
            self.send_request(write, &request).await?;
        }
        Ok(())
    }

    async fn send_request<W>(&self, write: &mut W, request: &SubscribeRequest) -> Result<(), ConnectorError>
    where
        W: SinkExt<Message> + Unpin,
        W::Error: std::fmt::Display,
    {
        let json = serde_json::to_string(request)
            .map_err(|e| ConnectorError::Transport(format!("failed to serialize request: {e}")))?;
        tracing::debug!(
            event = request.event,
            pair = ?request.pair,
            channel = request.subscription.name,
            "sending control message"
        );
        write
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| ConnectorError::Transport(format!("failed to send request: {e}")))
    }
}

#[async_trait]
impl ExchangeConnector for KrakenConnector {
    fn exchange(&self) -> ExchangeId {
        ExchangeId::Kraken
    }

    async fn run(self: Arc<Self>) -> Result<(), ConnectorError> {
        let mut policy = ReconnectPolicy::new(self.config.reconnect.clone());

        loop {
            if self.cancel.is_cancelled() {
                self.stats.set_state(ConnectionState::Stopped);
                tracing::info!("Kraken connector cancelled");
                return Ok(());
            }

            match self.connect_and_stream(&mut policy).await {
                Ok(()) => {
                    self.stats.set_state(ConnectionState::Stopped);
                    tracing::info!("Kraken connector cancelled, connection closed");
                    return Ok(());
                }
                Err(error) => {
                    self.stats.set_state(ConnectionState::Disconnected);
                    tracing::warn!(%error, "Kraken connection lost");

                    if let Some(delay) = policy.next_delay() {
                        self.stats.record_reconnect();
                        tracing::info!(
                            attempt = policy.attempt_count(),
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            "reconnecting to Kraken stream"
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
        tracing::debug!(symbol, kinds = ?added, "tracking Kraken subscription");
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
        tracing::debug!(symbol, kinds = ?removed, "dropping Kraken subscription");
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
