//! Stream Manager Integration Tests
//!
//! Drives the manager end-to-end with a scripted connector: fan-out,
//! cache immediacy, and the pause → buffer → resume switch protocol
//! under tokio's paused clock.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;

use exchange_stream_mux::{
    ConnectorError, ConnectorFactory, ConnectorStatus, EnvelopeSink, ExchangeConnector, ExchangeId,
    ManagerConfig, SinkError, StreamEnvelope, StreamError, StreamKind, StreamManager,
    StreamPayload, TickerData, TradeData, TradeSide,
};

// =============================================================================
// Scripted Harness
// =============================================================================

/// Connector that records subscribe calls and idles until cancelled.
struct ScriptedConnector {
    exchange: ExchangeId,
    cancel: CancellationToken,
    subscribe_calls: Mutex<Vec<(String, Vec<StreamKind>)>>,
}

#[async_trait]
impl ExchangeConnector for ScriptedConnector {
    fn exchange(&self) -> ExchangeId {
        self.exchange
    }

    async fn run(self: Arc<Self>) -> Result<(), ConnectorError> {
        self.cancel.cancelled().await;
        Ok(())
    }

    fn subscribe(&self, symbol: &str, kinds: &[StreamKind]) {
        self.subscribe_calls
            .lock()
            .push((symbol.to_string(), kinds.to_vec()));
    }

    fn unsubscribe(&self, _symbol: &str, _kinds: &[StreamKind]) {}

    fn status(&self) -> ConnectorStatus {
        ConnectorStatus::default()
    }
}

/// Factory capturing the manager-injected sink, so tests can feed
/// envelopes exactly as a connector read loop would.
#[derive(Default)]
struct ScriptedFactoryState {
    sinks: Mutex<Vec<Arc<dyn EnvelopeSink>>>,
    connectors: Mutex<Vec<Arc<ScriptedConnector>>>,
}

#[derive(Default, Clone)]
struct ScriptedFactory {
    state: Arc<ScriptedFactoryState>,
}

impl ScriptedFactory {
    fn sink(&self) -> Arc<dyn EnvelopeSink> {
        Arc::clone(self.state.sinks.lock().first().expect("no connector created"))
    }

    fn connector(&self) -> Arc<ScriptedConnector> {
        Arc::clone(
            self.state
                .connectors
                .lock()
                .first()
                .expect("no connector created"),
        )
    }
}

impl ConnectorFactory for ScriptedFactory {
    fn create(
        &self,
        exchange: ExchangeId,
        sink: Arc<dyn EnvelopeSink>,
        cancel: CancellationToken,
    ) -> Result<Arc<dyn ExchangeConnector>, StreamError> {
        self.state.sinks.lock().push(sink);
        let connector = Arc::new(ScriptedConnector {
            exchange,
            cancel,
            subscribe_calls: Mutex::new(Vec::new()),
        });
        self.state.connectors.lock().push(Arc::clone(&connector));
        Ok(connector)
    }
}

#[derive(Default)]
struct RecordingSink {
    received: Mutex<Vec<StreamEnvelope>>,
}

impl RecordingSink {
    fn envelopes(&self) -> Vec<StreamEnvelope> {
        self.received.lock().clone()
    }

    fn count(&self) -> usize {
        self.received.lock().len()
    }
}

impl EnvelopeSink for RecordingSink {
    fn on_envelope(&self, envelope: &StreamEnvelope) -> Result<(), SinkError> {
        self.received.lock().push(envelope.clone());
        Ok(())
    }
}

fn setup() -> (StreamManager, ScriptedFactory) {
    let factory = ScriptedFactory::default();
    let manager = StreamManager::new(Box::new(factory.clone()), ManagerConfig::default());
    (manager, factory)
}

fn ticker(symbol: &str, price: i64) -> StreamEnvelope {
    StreamEnvelope::new(
        ExchangeId::Binance,
        symbol,
        StreamPayload::Ticker(TickerData {
            price: Decimal::from(price),
            change_24h: Decimal::ZERO,
            change_24h_percent: Decimal::ZERO,
            high_24h: Decimal::from(price),
            low_24h: Decimal::from(price),
            volume_24h: Decimal::ONE,
            bid: Decimal::from(price),
            ask: Decimal::from(price),
        }),
    )
}

fn trade(symbol: &str, price: i64) -> StreamEnvelope {
    StreamEnvelope::new(
        ExchangeId::Binance,
        symbol,
        StreamPayload::Trade(TradeData {
            price: Decimal::from(price),
            quantity: Decimal::ONE,
            side: TradeSide::Buy,
            trade_time: Utc::now(),
        }),
    )
}

fn price_of(envelope: &StreamEnvelope) -> Decimal {
    match &envelope.payload {
        StreamPayload::Ticker(data) => data.price,
        StreamPayload::Trade(data) => data.price,
        other => panic!("unexpected payload {other:?}"),
    }
}

// =============================================================================
// Fan-out and Caching
// =============================================================================

#[tokio::test]
async fn one_envelope_reaches_every_subscriber_identically() {
    let (manager, factory) = setup();

    let sinks: Vec<Arc<RecordingSink>> =
        (0..3).map(|_| Arc::new(RecordingSink::default())).collect();
    for sink in &sinks {
        manager
            .subscribe(
                "BTC",
                &[StreamKind::Ticker],
                Arc::clone(sink) as Arc<dyn EnvelopeSink>,
                ExchangeId::Binance,
            )
            .unwrap();
    }

    let envelope = ticker("BTC", 65_000);
    factory.sink().on_envelope(&envelope).unwrap();

    for sink in &sinks {
        assert_eq!(sink.envelopes(), vec![envelope.clone()]);
    }
    manager.stop().await;
}

#[tokio::test]
async fn late_subscriber_gets_cached_ticker_before_subscribe_returns() {
    let (manager, factory) = setup();

    let early = Arc::new(RecordingSink::default());
    manager
        .subscribe("BTC", &[StreamKind::Ticker], early, ExchangeId::Binance)
        .unwrap();
    factory.sink().on_envelope(&ticker("BTC", 65_000)).unwrap();

    // The connection being "down" makes no difference to the cache; the
    // scripted connector has no connection at all.
    let late = Arc::new(RecordingSink::default());
    manager
        .subscribe(
            "BTC",
            &[StreamKind::Ticker],
            Arc::clone(&late) as Arc<dyn EnvelopeSink>,
            ExchangeId::Binance,
        )
        .unwrap();

    assert_eq!(late.count(), 1);
    assert_eq!(price_of(&late.envelopes()[0]), Decimal::from(65_000));

    // No duplicate on the next fresh frame.
    factory.sink().on_envelope(&ticker("BTC", 65_001)).unwrap();
    assert_eq!(late.count(), 2);
    manager.stop().await;
}

#[tokio::test]
async fn per_symbol_order_is_preserved_across_subscribers() {
    let (manager, factory) = setup();

    let a = Arc::new(RecordingSink::default());
    let b = Arc::new(RecordingSink::default());
    for sink in [&a, &b] {
        manager
            .subscribe(
                "BTC",
                &[StreamKind::Ticker, StreamKind::Trade],
                Arc::clone(sink) as Arc<dyn EnvelopeSink>,
                ExchangeId::Binance,
            )
            .unwrap();
    }

    for price in 1..=5 {
        factory.sink().on_envelope(&trade("BTC", price)).unwrap();
    }

    let expected: Vec<Decimal> = (1..=5).map(Decimal::from).collect();
    for sink in [&a, &b] {
        let prices: Vec<Decimal> = sink.envelopes().iter().map(price_of).collect();
        assert_eq!(prices, expected);
    }
    manager.stop().await;
}

// =============================================================================
// Symbol Switching
// =============================================================================

#[tokio::test(start_paused = true)]
async fn switch_is_lossless_for_remaining_subscribers() {
    let (manager, factory) = setup();

    let switcher = Arc::new(RecordingSink::default());
    let stayer = Arc::new(RecordingSink::default());
    let switcher_id = manager
        .subscribe(
            "BTC",
            &[StreamKind::Ticker],
            Arc::clone(&switcher) as Arc<dyn EnvelopeSink>,
            ExchangeId::Binance,
        )
        .unwrap();
    manager
        .subscribe(
            "BTC",
            &[StreamKind::Ticker],
            Arc::clone(&stayer) as Arc<dyn EnvelopeSink>,
            ExchangeId::Binance,
        )
        .unwrap();

    factory.sink().on_envelope(&ticker("BTC", 1)).unwrap();

    let cached = manager
        .switch_symbol("BTC", "ETH", switcher_id, ExchangeId::Binance)
        .unwrap();
    assert!(cached.is_none(), "no ETH ticker has been seen yet");

    // Frames for the old symbol arriving inside the switch window are
    // buffered, not delivered and not lost.
    factory.sink().on_envelope(&ticker("BTC", 2)).unwrap();
    factory.sink().on_envelope(&trade("BTC", 3)).unwrap();
    assert_eq!(stayer.count(), 1);
    assert_eq!(
        price_of(&manager.get_latest("BTC").unwrap()),
        Decimal::ONE,
        "cache must not move while the symbol is paused"
    );

    // The switcher sees nothing for the old symbol after the call returned.
    assert_eq!(switcher.count(), 1);

    // The connector was asked to open the new symbol with the same kinds.
    let calls = factory.connector().subscribe_calls.lock().clone();
    assert!(calls.contains(&("ETH".to_string(), vec![StreamKind::Ticker])));

    // Let the resume task fire (250 ms default, paused clock).
    tokio::time::sleep(Duration::from_millis(300)).await;

    let stayer_prices: Vec<Decimal> = stayer.envelopes().iter().map(price_of).collect();
    assert_eq!(
        stayer_prices,
        vec![Decimal::from(1), Decimal::from(2), Decimal::from(3)],
        "buffered frames flush in arrival order"
    );
    assert_eq!(switcher.count(), 1);
    assert_eq!(price_of(&manager.get_latest("BTC").unwrap()), Decimal::from(2));

    // Post-resume frames flow directly again, after the whole buffer.
    factory.sink().on_envelope(&ticker("BTC", 4)).unwrap();
    assert_eq!(stayer.count(), 4);

    // And the switcher now receives its new symbol.
    factory.sink().on_envelope(&ticker("ETH", 9)).unwrap();
    let switcher_envelopes = switcher.envelopes();
    assert_eq!(switcher_envelopes.last().unwrap().symbol, "ETH");

    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn switch_returns_cached_envelope_for_new_symbol() {
    let (manager, factory) = setup();

    let other = Arc::new(RecordingSink::default());
    manager
        .subscribe("ETH", &[StreamKind::Ticker], other, ExchangeId::Binance)
        .unwrap();
    factory.sink().on_envelope(&ticker("ETH", 3_500)).unwrap();

    let switcher = Arc::new(RecordingSink::default());
    let id = manager
        .subscribe(
            "BTC",
            &[StreamKind::Ticker],
            Arc::clone(&switcher) as Arc<dyn EnvelopeSink>,
            ExchangeId::Binance,
        )
        .unwrap();

    let cached = manager
        .switch_symbol("BTC", "ETH", id, ExchangeId::Binance)
        .unwrap()
        .expect("ETH ticker is cached");
    assert_eq!(price_of(&cached), Decimal::from(3_500));

    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_flushes_pending_resume_buffers() {
    let (manager, factory) = setup();

    let switcher = Arc::new(RecordingSink::default());
    let stayer = Arc::new(RecordingSink::default());
    let id = manager
        .subscribe(
            "BTC",
            &[StreamKind::Ticker],
            Arc::clone(&switcher) as Arc<dyn EnvelopeSink>,
            ExchangeId::Binance,
        )
        .unwrap();
    manager
        .subscribe(
            "BTC",
            &[StreamKind::Ticker],
            Arc::clone(&stayer) as Arc<dyn EnvelopeSink>,
            ExchangeId::Binance,
        )
        .unwrap();

    manager
        .switch_symbol("BTC", "ETH", id, ExchangeId::Binance)
        .unwrap();
    factory.sink().on_envelope(&ticker("BTC", 7)).unwrap();

    // Shut down well before the resume delay elapses; the buffered frame
    // must still reach the remaining subscriber rather than be dropped.
    manager.stop().await;
    let prices: Vec<Decimal> = stayer.envelopes().iter().map(price_of).collect();
    assert_eq!(prices, vec![Decimal::from(7)]);
}

// =============================================================================
// Unsubscribe and Errors
// =============================================================================

#[tokio::test]
async fn unsubscribe_unknown_handle_is_a_noop() {
    let (manager, factory) = setup();

    let sink = Arc::new(RecordingSink::default());
    let id = manager
        .subscribe(
            "BTC",
            &[StreamKind::Ticker],
            Arc::clone(&sink) as Arc<dyn EnvelopeSink>,
            ExchangeId::Binance,
        )
        .unwrap();

    manager.unsubscribe("BTC", id);
    manager.unsubscribe("BTC", id);
    manager.unsubscribe("ETH", id);
    manager.unsubscribe("not a symbol!", id);

    factory.sink().on_envelope(&ticker("BTC", 1)).unwrap();
    assert_eq!(sink.count(), 0);
    manager.stop().await;
}

#[tokio::test]
async fn unknown_symbol_is_rejected_synchronously() {
    let (manager, _factory) = setup();
    let sink = Arc::new(RecordingSink::default());

    let err = manager
        .subscribe("BTC-USD", &[StreamKind::Ticker], sink, ExchangeId::Binance)
        .unwrap_err();
    assert!(matches!(err, StreamError::UnknownSymbol(_)));
    assert_eq!(manager.stats().connectors, 0);
    manager.stop().await;
}

#[tokio::test]
async fn stats_track_registry_sizes() {
    let (manager, factory) = setup();

    let a = Arc::new(RecordingSink::default());
    let b = Arc::new(RecordingSink::default());
    manager
        .subscribe("BTC", &[StreamKind::Ticker], a, ExchangeId::Binance)
        .unwrap();
    manager
        .subscribe("ETH", &[StreamKind::Ticker], b, ExchangeId::Binance)
        .unwrap();
    factory.sink().on_envelope(&ticker("BTC", 1)).unwrap();

    let stats = manager.stats();
    assert_eq!(stats.total_subscriptions, 2);
    assert_eq!(stats.symbols, 2);
    assert_eq!(stats.cached_symbols, 1);
    assert_eq!(stats.paused_symbols, 0);
    assert_eq!(stats.connectors, 1);
    manager.stop().await;
}
