//! Stream Manager
//!
//! The single mutation point for all shared streaming state: the
//! per-symbol subscriber registry, the latest-value cache, and the
//! pause/buffer ledger used for atomic symbol switching. Vendor I/O is
//! delegated entirely to [`ExchangeConnector`]s obtained from the injected
//! [`ConnectorFactory`].
//!
//! # Data Flow
//!
//! ```text
//! Binance WS ──┐
//!              ├──► connector read loop ──► on_envelope ──► StreamManager
//! Kraken WS  ──┘                                               │
//!                                          cache / pause / fan-out
//!                                                               │
//!                                      subscriber sinks (gateway clients)
//! ```
//!
//! # Concurrency
//!
//! Every piece of shared state lives behind one `parking_lot::Mutex`.
//! Connector read tasks enter through the manager's [`EnvelopeSink`]
//! implementation; callers enter through the public operations. Both
//! serialize on the same guard, which is what makes the switch sequence
//! atomic and fan-out order deterministic. Sinks are invoked under the
//! guard and must not re-enter the manager (see [`EnvelopeSink`] docs).
//!
//! Delayed resume work after a symbol switch runs on a
//! [`TaskTracker`] owned by the manager, so `stop` can cancel and await
//! it instead of leaving detached tasks behind.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::application::ports::{
    ConnectorFactory, ConnectorStatus, EnvelopeSink, ExchangeConnector, SinkError,
};
use crate::domain::envelope::{ExchangeId, StreamEnvelope, StreamKind, canonicalize_symbol};
use crate::domain::subscription::{LatestCache, PauseLedger, SubscriberRegistry, SubscriptionId};

// =============================================================================
// Configuration
// =============================================================================

/// Tunables for the stream manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// How long a symbol stays paused after a switch before its buffer is
    /// flushed. The delay absorbs frames already queued between a
    /// connector's socket and `on_envelope` when the pause took effect, so
    /// a subscriber that stayed on the old symbol observes no gap. It does
    /// not scale with network latency; the in-process hop it covers is
    /// microseconds, so the default leaves a wide margin.
    pub resume_delay: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            resume_delay: Duration::from_millis(250),
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors surfaced synchronously by stream manager operations.
///
/// Everything else (connection loss, malformed frames, slow subscribers)
/// is handled locally and never reaches callers; the only user-visible
/// degradation is a stale cached timestamp.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
    /// The symbol cannot be normalized and therefore cannot be mapped to
    /// any vendor identifier.
    #[error("symbol {0:?} cannot be mapped to a vendor symbol")]
    UnknownSymbol(String),

    /// The subscription handle is not registered under the given symbol.
    #[error("subscription {0} is not registered for symbol {1}")]
    UnknownSubscription(SubscriptionId, String),

    /// The connector factory has no connector for the venue.
    #[error("exchange {0} is not supported by the connector factory")]
    UnsupportedExchange(ExchangeId),
}

// =============================================================================
// Statistics
// =============================================================================

/// Point-in-time snapshot of manager state sizes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManagerStats {
    /// Registrations across all symbols.
    pub total_subscriptions: usize,
    /// Symbols with at least one subscriber.
    pub symbols: usize,
    /// Symbols with a cached latest envelope.
    pub cached_symbols: usize,
    /// Symbols currently paused for a switch.
    pub paused_symbols: usize,
    /// Connectors created so far.
    pub connectors: usize,
}

// =============================================================================
// Shared State
// =============================================================================

type SharedSink = Arc<dyn EnvelopeSink>;

struct ManagerState {
    connectors: HashMap<ExchangeId, Arc<dyn ExchangeConnector>>,
    subscribers: SubscriberRegistry<SharedSink>,
    latest: LatestCache,
    paused: PauseLedger,
}

struct ManagerShared {
    factory: Box<dyn ConnectorFactory>,
    config: ManagerConfig,
    state: Mutex<ManagerState>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

/// Ingestion sink handed to connectors.
///
/// Holds a weak reference so the connector → manager edge cannot keep the
/// manager (and through it the connectors themselves) alive in a cycle.
struct ManagerSink {
    shared: Weak<ManagerShared>,
}

impl EnvelopeSink for ManagerSink {
    fn on_envelope(&self, envelope: &StreamEnvelope) -> Result<(), SinkError> {
        if let Some(shared) = self.shared.upgrade() {
            StreamManager::ingest(&shared, envelope);
        }
        Ok(())
    }
}

// =============================================================================
// Stream Manager
// =============================================================================

/// Multiplexes exchange connectors to in-process subscribers.
///
/// Explicitly constructed with an injected connector factory; create one
/// per process in the composition root. Cloning is cheap and shares the
/// same state.
///
/// Operations must be called from within a tokio runtime: connectors and
/// resume timers are spawned onto it.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
///
/// use exchange_stream_mux::{
///     DefaultConnectorFactory, EnvelopeSink, ExchangeId, SinkError, StreamEnvelope,
///     StreamKind, StreamManager, StreamSettings,
/// };
///
/// struct LogSink;
///
/// impl EnvelopeSink for LogSink {
///     fn on_envelope(&self, envelope: &StreamEnvelope) -> Result<(), SinkError> {
///         println!("{} {} {}", envelope.exchange, envelope.kind, envelope.symbol);
///         Ok(())
///     }
/// }
///
/// #[tokio::main]
/// async fn main() {
///     let settings = StreamSettings::default();
///     let factory = DefaultConnectorFactory::new(&settings.connector);
///     let manager = StreamManager::new(Box::new(factory), settings.manager.clone());
///
///     let id = manager
///         .subscribe("BTC", &[StreamKind::Ticker], Arc::new(LogSink), ExchangeId::Binance)
///         .expect("BTC maps on every venue");
///
///     tokio::time::sleep(std::time::Duration::from_secs(30)).await;
///     manager.unsubscribe("BTC", id);
///     manager.stop().await;
/// }
/// ```
#[derive(Clone)]
pub struct StreamManager {
    shared: Arc<ManagerShared>,
}

impl StreamManager {
    /// Create a manager with the given connector factory and tunables.
    #[must_use]
    pub fn new(factory: Box<dyn ConnectorFactory>, config: ManagerConfig) -> Self {
        Self {
            shared: Arc::new(ManagerShared {
                factory,
                config,
                state: Mutex::new(ManagerState {
                    connectors: HashMap::new(),
                    subscribers: SubscriberRegistry::new(),
                    latest: LatestCache::new(),
                    paused: PauseLedger::new(),
                }),
                tracker: TaskTracker::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Eagerly create and start connectors for the given venues.
    ///
    /// Subscribing lazily creates connectors too; `start` exists for
    /// callers that want connections warming up before the first
    /// subscriber arrives.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::UnsupportedExchange`] if the factory cannot
    /// build a connector for one of the venues.
    pub fn start(&self, exchanges: &[ExchangeId]) -> Result<(), StreamError> {
        let mut state = self.shared.state.lock();
        for exchange in exchanges {
            self.ensure_connector(&mut state, *exchange)?;
        }
        Ok(())
    }

    /// Register `sink` for `symbol` on `exchange`.
    ///
    /// Ensures a connector exists for the venue (creating and starting it
    /// if necessary), registers the sink, issues the connector subscribe,
    /// and, atomically with registration, delivers the cached latest
    /// envelope to the new sink if one exists. After this returns, the
    /// sink receives every subsequent envelope for the symbol in arrival
    /// order, without duplicates, until unsubscribed.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::UnknownSymbol`] for symbols that cannot be
    /// mapped, or [`StreamError::UnsupportedExchange`] from the factory.
    pub fn subscribe(
        &self,
        symbol: &str,
        kinds: &[StreamKind],
        sink: SharedSink,
        exchange: ExchangeId,
    ) -> Result<SubscriptionId, StreamError> {
        let symbol = canonicalize_symbol(symbol)
            .ok_or_else(|| StreamError::UnknownSymbol(symbol.to_string()))?;

        let mut state = self.shared.state.lock();
        let connector = self.ensure_connector(&mut state, exchange)?;
        let id = state.subscribers.add(&symbol, kinds, Arc::clone(&sink));
        connector.subscribe(&symbol, kinds);

        if let Some(cached) = state.latest.get(&symbol) {
            Self::deliver(id, &sink, cached);
        }

        tracing::debug!(subscription = %id, symbol = %symbol, exchange = %exchange, "subscribed");
        Ok(id)
    }

    /// Remove a registration. Idempotent: an unknown handle is a no-op.
    ///
    /// The connector's vendor subscription is deliberately left open even
    /// when the last subscriber leaves; tearing it down and re-opening on
    /// the next subscriber would flap the vendor connection for no
    /// benefit. The cache entry survives too.
    pub fn unsubscribe(&self, symbol: &str, id: SubscriptionId) {
        let Some(symbol) = canonicalize_symbol(symbol) else {
            return;
        };
        let mut state = self.shared.state.lock();
        if state.subscribers.remove(&symbol, id) {
            tracing::debug!(subscription = %id, symbol = %symbol, "unsubscribed");
        }
    }

    /// Atomically move a subscription from `old` to `new`.
    ///
    /// Under a single lock acquisition: `old` is paused, the registration
    /// moves to `new` (keeping its kinds), and a connector subscribe for
    /// `new` is issued if needed. The cached latest envelope for `new` is
    /// returned immediately; that instant answer is what makes the
    /// switch feel instantaneous to callers; fresh data follows through
    /// the sink.
    ///
    /// A resume task is then scheduled (tracked, not detached) that waits
    /// [`ManagerConfig::resume_delay`] and flushes `old`'s buffer in
    /// arrival order to whatever subscribers remain on it, so a
    /// subscriber that stayed on `old` observes no gap and no reordering.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::UnknownSubscription`] if `id` is not
    /// registered under `old`, plus the `subscribe` error cases.
    pub fn switch_symbol(
        &self,
        old: &str,
        new: &str,
        id: SubscriptionId,
        exchange: ExchangeId,
    ) -> Result<Option<StreamEnvelope>, StreamError> {
        let old = canonicalize_symbol(old).ok_or_else(|| StreamError::UnknownSymbol(old.to_string()))?;
        let new = canonicalize_symbol(new).ok_or_else(|| StreamError::UnknownSymbol(new.to_string()))?;

        let cached = {
            let mut state = self.shared.state.lock();
            let connector = self.ensure_connector(&mut state, exchange)?;

            let Some(kinds) = state.subscribers.relocate(&old, &new, id) else {
                return Err(StreamError::UnknownSubscription(id, old));
            };
            state.paused.pause(&old);
            connector.subscribe(&new, &kinds);
            state.latest.get(&new).cloned()
        };

        tracing::debug!(subscription = %id, from = %old, to = %new, "symbol switch");
        self.schedule_resume(old);
        Ok(cached)
    }

    /// Cached latest Ticker envelope for a symbol. Pure read, no side
    /// effects; `None` until the first Ticker arrives.
    #[must_use]
    pub fn get_latest(&self, symbol: &str) -> Option<StreamEnvelope> {
        let symbol = canonicalize_symbol(symbol)?;
        self.shared.state.lock().latest.get(&symbol).cloned()
    }

    /// State size snapshot.
    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        let state = self.shared.state.lock();
        ManagerStats {
            total_subscriptions: state.subscribers.total_subscriptions(),
            symbols: state.subscribers.symbol_count(),
            cached_symbols: state.latest.len(),
            paused_symbols: state.paused.paused_count(),
            connectors: state.connectors.len(),
        }
    }

    /// Health snapshot of one venue's connector, if it has been created.
    #[must_use]
    pub fn connector_status(&self, exchange: ExchangeId) -> Option<ConnectorStatus> {
        self.shared
            .state
            .lock()
            .connectors
            .get(&exchange)
            .map(|connector| connector.status())
    }

    /// Shut down: cancel connectors and pending resume tasks, then await
    /// them. Pending resume tasks flush their buffers immediately on
    /// cancellation instead of dropping them.
    pub async fn stop(&self) {
        self.shared.cancel.cancel();
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
        tracing::info!("stream manager stopped");
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Look up or lazily create and spawn the connector for a venue.
    /// Connectors are never destroyed during the process lifetime.
    fn ensure_connector(
        &self,
        state: &mut ManagerState,
        exchange: ExchangeId,
    ) -> Result<Arc<dyn ExchangeConnector>, StreamError> {
        if let Some(existing) = state.connectors.get(&exchange) {
            return Ok(Arc::clone(existing));
        }

        let sink: SharedSink = Arc::new(ManagerSink {
            shared: Arc::downgrade(&self.shared),
        });
        let connector =
            self.shared
                .factory
                .create(exchange, sink, self.shared.cancel.child_token())?;
        state.connectors.insert(exchange, Arc::clone(&connector));

        let runner = Arc::clone(&connector);
        self.shared.tracker.spawn(async move {
            if let Err(error) = runner.run().await {
                tracing::error!(exchange = %exchange, %error, "connector terminated");
            }
        });

        tracing::info!(exchange = %exchange, "connector started");
        Ok(connector)
    }

    /// Ingest one envelope from a connector read loop.
    fn ingest(shared: &ManagerShared, envelope: &StreamEnvelope) {
        let mut state = shared.state.lock();
        if state.paused.buffer_if_paused(envelope) {
            return;
        }
        state.latest.update(envelope);
        for entry in state.subscribers.subscribers(&envelope.symbol) {
            Self::deliver(entry.id, &entry.sink, envelope);
        }
    }

    /// Invoke one sink with full isolation: an error is logged and
    /// skipped, a panic is contained, and in both cases other subscribers
    /// and the producing connector proceed untouched.
    fn deliver(id: SubscriptionId, sink: &SharedSink, envelope: &StreamEnvelope) {
        let outcome = catch_unwind(AssertUnwindSafe(|| sink.on_envelope(envelope)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                tracing::error!(
                    subscription = %id,
                    symbol = %envelope.symbol,
                    %error,
                    "subscriber rejected envelope"
                );
            }
            Err(_) => {
                tracing::error!(
                    subscription = %id,
                    symbol = %envelope.symbol,
                    "subscriber panicked during delivery"
                );
            }
        }
    }

    /// Schedule the deferred resume of a paused symbol on the tracker.
    /// Shutdown cancellation skips the wait but still flushes.
    fn schedule_resume(&self, symbol: String) {
        let shared = Arc::clone(&self.shared);
        self.shared.tracker.spawn(async move {
            tokio::select! {
                () = shared.cancel.cancelled() => {}
                () = tokio::time::sleep(shared.config.resume_delay) => {}
            }
            Self::resume_now(&shared, &symbol);
        });
    }

    /// Unpause a symbol and flush its buffer, in arrival order, to the
    /// subscribers registered at flush time. Buffered Ticker envelopes
    /// refresh the cache on the way out so `get_latest` stays current.
    fn resume_now(shared: &ManagerShared, symbol: &str) {
        let mut state = shared.state.lock();
        let buffered = state.paused.resume(symbol);
        if buffered.is_empty() {
            return;
        }
        tracing::debug!(symbol, count = buffered.len(), "flushing paused buffer");
        for envelope in &buffered {
            state.latest.update(envelope);
            for entry in state.subscribers.subscribers(symbol) {
                Self::deliver(entry.id, &entry.sink, envelope);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
