//! Infrastructure Layer - Exchange adapters and runtime settings.
//!
//! Concrete implementations of the application-layer ports: one WebSocket
//! connector per venue, the reconnect/watchdog machinery they share, and
//! the settings structs the composition root fills in.

/// Exchange WebSocket connectors and supporting machinery.
pub mod exchanges;

/// Runtime settings structs.
pub mod config;
