//! Exchange WebSocket Adapters
//!
//! One connector per venue, each speaking that venue's wire protocol and
//! normalizing frames into [`StreamEnvelope`]s:
//!
//! - **Binance**: single shared endpoint, batched JSON control messages,
//!   combined-stream or bare event objects inbound.
//! - **Kraken**: per-channel JSON control messages, array-framed data
//!   messages inbound (channel name and pair as the trailing elements).
//!
//! Shared machinery lives alongside: the reconnect policy, the idle
//! watchdog, and the health counters every connector keeps.
//!
//! [`StreamEnvelope`]: crate::domain::envelope::StreamEnvelope

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::application::ports::{ConnectionState, ConnectorStatus};
use crate::domain::envelope::StreamKind;

pub mod binance;
pub mod factory;
pub mod kraken;
pub mod reconnect;
pub mod watchdog;

pub use binance::{BinanceConfig, BinanceConnector};
pub use factory::DefaultConnectorFactory;
pub use kraken::{KrakenConfig, KrakenConnector};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use watchdog::{TrafficMonitor, Watchdog, WatchdogConfig, WatchdogEvent};

// =============================================================================
// Decode Errors
// =============================================================================

/// Errors raised while decoding one inbound frame.
///
/// A decode error drops that frame only; the read loop and connection
/// continue untouched.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// JSON parsing failed.
    #[error("JSON decode error: {0}")]
    Json(#[from] serde_json::Error),

    /// A numeric field could not be parsed into a decimal.
    #[error("invalid decimal: {0}")]
    Decimal(#[from] rust_decimal::Error),

    /// A required field is absent.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// A timestamp field is out of representable range.
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(i64),

    /// The frame shape does not match the vendor protocol.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

// =============================================================================
// Subscription Commands
// =============================================================================

/// Control requests queued from `subscribe`/`unsubscribe` to the read
/// loop, which owns the write half of the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SubscriptionCommand {
    /// Open vendor streams for the given kinds.
    Subscribe {
        /// Canonical symbol.
        symbol: String,
        /// Kinds newly added to the table.
        kinds: Vec<StreamKind>,
    },
    /// Close vendor streams for the given kinds.
    Unsubscribe {
        /// Canonical symbol.
        symbol: String,
        /// Kinds actually removed from the table.
        kinds: Vec<StreamKind>,
    },
}

// =============================================================================
// Connector Health Counters
// =============================================================================

/// Shared health counters kept by every connector.
#[derive(Debug, Default)]
pub struct ConnectorStats {
    state: RwLock<ConnectionState>,
    frames_parsed: AtomicU64,
    frames_dropped: AtomicU64,
    reconnect_attempts: AtomicU64,
}

impl ConnectorStats {
    /// Record a connection state transition.
    pub fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    /// Count one envelope successfully parsed.
    pub fn record_parsed(&self) {
        self.frames_parsed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one malformed frame dropped.
    pub fn record_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one reconnect attempt.
    pub fn record_reconnect(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot the counters.
    #[must_use]
    pub fn snapshot(&self, subscribed_symbols: usize) -> ConnectorStatus {
        ConnectorStatus {
            state: *self.state.read(),
            frames_parsed: self.frames_parsed.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            subscribed_symbols,
        }
    }
}
