//! Runtime Settings
//!
//! Plain settings structs with defaults. The embedding process constructs
//! and passes them in; no environment, file, or CLI loading lives in this
//! crate.

mod settings;

pub use settings::{ConnectorSettings, StreamSettings};
