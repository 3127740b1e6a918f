//! Port Interfaces
//!
//! Interfaces between the stream manager and the components around it,
//! following the Hexagonal Architecture pattern.
//!
//! ## Driver Ports (Inbound)
//!
//! - [`EnvelopeSink`]: where normalized envelopes are delivered. The
//!   external gateway implements this per downstream client; the stream
//!   manager itself implements it as the ingestion side handed to
//!   connectors.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`ExchangeConnector`]: one supervised vendor WebSocket connection.
//! - [`ConnectorFactory`]: builds connectors on demand, injected into the
//!   stream manager at construction so the composition root decides which
//!   venues exist (no process-wide singletons).

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::application::manager::StreamError;
use crate::domain::envelope::{ExchangeId, StreamEnvelope, StreamKind};

// =============================================================================
// Envelope Sink
// =============================================================================

/// Error a sink may surface when it cannot accept an envelope.
#[derive(Debug, Clone, thiserror::Error)]
#[error("sink rejected envelope: {0}")]
pub struct SinkError(pub String);

/// Receives normalized envelopes.
///
/// Invocations happen under the stream manager's serialization guarantee:
/// for any one symbol, calls arrive in producer order and never overlap.
///
/// # Contract
///
/// Implementations must return quickly and must not block; per-client
/// buffering and backpressure belong on the implementor's side of this
/// boundary. Implementations must not call back into the stream manager;
/// the manager's guard is held during delivery and re-entry would
/// deadlock. A returned error (or a panic) is contained per invocation:
/// other subscribers and the producing connector are unaffected.
pub trait EnvelopeSink: Send + Sync {
    /// Deliver one envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink cannot accept the envelope; the
    /// envelope is then dropped for this sink only.
    fn on_envelope(&self, envelope: &StreamEnvelope) -> Result<(), SinkError>;
}

// =============================================================================
// Exchange Connector
// =============================================================================

/// Errors that terminate a connector's supervision loop.
///
/// Transient transport failures never surface here; the reconnect loop
/// absorbs them. Only cancellation (clean `Ok`) or policy exhaustion ends
/// [`ExchangeConnector::run`].
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// WebSocket transport failure.
    #[error("websocket transport error: {0}")]
    Transport(String),

    /// Connection attempt exceeded the configured timeout.
    #[error("connect attempt timed out")]
    ConnectTimeout,

    /// The peer closed the connection or the stream ended.
    #[error("connection closed")]
    ConnectionClosed,

    /// No inbound traffic within the watchdog deadline.
    #[error("connection idle past watchdog deadline")]
    IdleTimeout,

    /// Reconnect policy ran out of attempts.
    #[error("maximum reconnection attempts exceeded")]
    MaxReconnectAttemptsExceeded,
}

/// Externally observable connection state of a connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection; idle or between retries.
    #[default]
    Disconnected,
    /// Connection attempt in flight.
    Connecting,
    /// Connected and reading frames.
    Connected,
    /// Cancelled; no further reconnects.
    Stopped,
}

/// Point-in-time snapshot of a connector's health counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectorStatus {
    /// Current connection state.
    pub state: ConnectionState,
    /// Frames successfully parsed into envelopes.
    pub frames_parsed: u64,
    /// Frames dropped as malformed.
    pub frames_dropped: u64,
    /// Reconnect attempts made since start.
    pub reconnect_attempts: u64,
    /// Symbols currently tracked in the subscription table.
    pub subscribed_symbols: usize,
}

/// One supervised WebSocket connection to one venue.
///
/// A connector owns its subscription table and connection handle
/// exclusively; its only coupling to the rest of the system is the
/// [`EnvelopeSink`] it was constructed with.
#[async_trait]
pub trait ExchangeConnector: Send + Sync {
    /// The venue this connector speaks to.
    fn exchange(&self) -> ExchangeId;

    /// Run the supervised connect/read/reconnect loop.
    ///
    /// Does not return while the connector is active. On connection loss
    /// the loop backs off exponentially and retries; on success it first
    /// replays the subscription table. Cancellation closes the connection
    /// and returns `Ok(())`; no reconnects happen afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error only when the reconnect policy is exhausted.
    async fn run(self: Arc<Self>) -> Result<(), ConnectorError>;

    /// Track `kinds` for `symbol` and, if connected, send the vendor
    /// subscribe request for the newly added kinds. Idempotent and
    /// additive; when disconnected the table alone guarantees replay on
    /// the next successful connect.
    fn subscribe(&self, symbol: &str, kinds: &[StreamKind]);

    /// Stop tracking `kinds` for `symbol` and, if connected, send the
    /// vendor unsubscribe request for exactly the kinds removed.
    fn unsubscribe(&self, symbol: &str, kinds: &[StreamKind]);

    /// Health counter snapshot.
    fn status(&self) -> ConnectorStatus;
}

// =============================================================================
// Connector Factory
// =============================================================================

/// Builds a connector for a venue on demand.
///
/// Injected into the stream manager at construction; the manager calls
/// `create` lazily on first use of a venue and keeps the connector for
/// the process lifetime.
pub trait ConnectorFactory: Send + Sync {
    /// Create a connector for `exchange` that delivers into `sink` and
    /// stops when `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::UnsupportedExchange`] when this factory has
    /// no connector for the venue.
    fn create(
        &self,
        exchange: ExchangeId,
        sink: Arc<dyn EnvelopeSink>,
        cancel: CancellationToken,
    ) -> Result<Arc<dyn ExchangeConnector>, StreamError>;
}
