//! Application Layer - Ports and the stream manager.
//!
//! This layer defines the traits that connect the domain to the outside
//! world and hosts the [`manager::StreamManager`], the single mutation
//! point for all shared streaming state.

/// Port interfaces: envelope sinks, connectors, connector factories.
pub mod ports;

/// The stream manager: subscriber bookkeeping, caching, symbol switching.
pub mod manager;
