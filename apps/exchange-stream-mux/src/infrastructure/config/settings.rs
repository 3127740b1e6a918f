//! Settings structs for the stream manager and connectors.

use std::time::Duration;

use crate::application::manager::ManagerConfig;
use crate::infrastructure::exchanges::reconnect::ReconnectConfig;
use crate::infrastructure::exchanges::watchdog::WatchdogConfig;

/// Connection settings applied to every venue connector.
#[derive(Debug, Clone)]
pub struct ConnectorSettings {
    /// Reconnection backoff behavior.
    pub reconnect: ReconnectConfig,
    /// Idle watchdog behavior.
    pub watchdog: WatchdogConfig,
    /// Bound on a single connect attempt, so a hung TCP handshake cannot
    /// stall the reconnect loop.
    pub connect_timeout: Duration,
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            watchdog: WatchdogConfig::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Complete settings for the streaming core.
#[derive(Debug, Clone, Default)]
pub struct StreamSettings {
    /// Stream manager tunables.
    pub manager: ManagerConfig,
    /// Connector tunables.
    pub connector: ConnectorSettings,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connector_settings_defaults() {
        let settings = ConnectorSettings::default();
        assert_eq!(settings.connect_timeout, Duration::from_secs(10));
        assert_eq!(settings.reconnect.initial_delay, Duration::from_millis(500));
        assert_eq!(settings.reconnect.max_delay, Duration::from_secs(30));
        assert_eq!(settings.watchdog.idle_after, Duration::from_secs(20));
        assert_eq!(settings.watchdog.dead_after, Duration::from_secs(60));
    }

    #[test]
    fn stream_settings_defaults() {
        let settings = StreamSettings::default();
        assert_eq!(settings.manager.resume_delay, Duration::from_millis(250));
    }
}
