#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::default_trait_access
    )
)]

//! Exchange Stream Mux - Market Data Multiplexer
//!
//! A library that maintains single WebSocket connections to cryptocurrency
//! exchange market data feeds (Binance, Kraken) and multiplexes a
//! normalized, exchange-agnostic event stream to any number of in-process
//! subscribers, with instant, lossless switching of a subscriber's symbol
//! of interest.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Normalized types and pure bookkeeping
//!   - `envelope`: The stream envelope and its typed payloads
//!   - `subscription`: Subscriber registry, latest cache, pause ledger
//!
//! - **Application**: Ports and the stream manager
//!   - `ports`: Interfaces for sinks, connectors, connector factories
//!   - `manager`: Subscriber bookkeeping, caching, symbol switching
//!
//! - **Infrastructure**: Adapters and settings
//!   - `exchanges`: WebSocket connectors per venue, reconnect, watchdog
//!   - `config`: Settings structs the embedding process fills in
//!
//! # Data Flow
//!
//! ```text
//! Binance WS ──┐
//!              │     ┌───────────────┐     ┌──────────────┐
//!              ├────►│    Stream     │────►│  subscriber  │──► Client 1
//! Kraken WS ──┘      │    Manager    │     │    sinks     │──► Client N
//!                    └───────────────┘     └──────────────┘
//!                     cache · pause/buffer · fan-out
//! ```
//!
//! # Guarantees
//!
//! Delivery is at-least-once and order-preserving per symbol while
//! connected; during a symbol switch the old symbol's frames are buffered
//! and flushed in arrival order, so subscribers that stay on it lose
//! nothing. Gap handling across reconnects is the caller's concern,
//! observable via envelope timestamps.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Normalized stream types and pure bookkeeping.
pub mod domain;

/// Application layer - Ports and the stream manager.
pub mod application;

/// Infrastructure layer - Exchange adapters and settings.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::envelope::{
    DepthData, DepthLevel, ExchangeId, KlineData, StreamEnvelope, StreamKind, StreamPayload,
    TickerData, TradeData, TradeSide, UnknownExchange, canonicalize_symbol,
};
pub use domain::subscription::SubscriptionId;

// Ports
pub use application::ports::{
    ConnectionState, ConnectorError, ConnectorFactory, ConnectorStatus, EnvelopeSink,
    ExchangeConnector, SinkError,
};

// Stream manager
pub use application::manager::{ManagerConfig, ManagerStats, StreamError, StreamManager};

// Connectors and settings
pub use infrastructure::config::{ConnectorSettings, StreamSettings};
pub use infrastructure::exchanges::{
    BinanceConfig, BinanceConnector, DefaultConnectorFactory, KrakenConfig, KrakenConnector,
    ReconnectConfig, ReconnectPolicy, WatchdogConfig,
};
