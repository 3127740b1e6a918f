//! Default Connector Factory
//!
//! Builds the built-in venue connectors. The composition root constructs
//! one of these (or its own [`ConnectorFactory`]) and hands it to the
//! stream manager.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::binance::{BinanceConfig, BinanceConnector};
use super::kraken::{KrakenConfig, KrakenConnector};
use crate::application::manager::StreamError;
use crate::application::ports::{ConnectorFactory, EnvelopeSink, ExchangeConnector};
use crate::domain::envelope::ExchangeId;
use crate::infrastructure::config::ConnectorSettings;

/// Factory covering every built-in venue.
#[derive(Debug, Clone, Default)]
pub struct DefaultConnectorFactory {
    binance: BinanceConfig,
    kraken: KrakenConfig,
}

impl DefaultConnectorFactory {
    /// Build a factory applying the same connection settings to every
    /// venue, with each venue's default endpoint.
    #[must_use]
    pub fn new(settings: &ConnectorSettings) -> Self {
        Self {
            binance: BinanceConfig {
                reconnect: settings.reconnect.clone(),
                watchdog: settings.watchdog.clone(),
                connect_timeout: settings.connect_timeout,
                ..BinanceConfig::default()
            },
            kraken: KrakenConfig {
                reconnect: settings.reconnect.clone(),
                watchdog: settings.watchdog.clone(),
                connect_timeout: settings.connect_timeout,
                ..KrakenConfig::default()
            },
        }
    }

    /// Build a factory from fully explicit per-venue configurations
    /// (endpoint overrides included).
    #[must_use]
    pub const fn with_configs(binance: BinanceConfig, kraken: KrakenConfig) -> Self {
        Self { binance, kraken }
    }
}

impl ConnectorFactory for DefaultConnectorFactory {
    fn create(
        &self,
        exchange: ExchangeId,
        sink: Arc<dyn EnvelopeSink>,
        cancel: CancellationToken,
    ) -> Result<Arc<dyn ExchangeConnector>, StreamError> {
        Ok(match exchange {
            ExchangeId::Binance => {
                Arc::new(BinanceConnector::new(self.binance.clone(), sink, cancel))
            }
            ExchangeId::Kraken => Arc::new(KrakenConnector::new(self.kraken.clone(), sink, cancel)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::SinkError;
    use crate::domain::envelope::StreamEnvelope;

    struct NullSink;

    impl EnvelopeSink for NullSink {
        fn on_envelope(&self, _envelope: &StreamEnvelope) -> Result<(), SinkError> {
            Ok(())
        }
    }

    #[test]
    fn factory_covers_every_builtin_venue() {
        let factory = DefaultConnectorFactory::default();
        for exchange in ExchangeId::all() {
            let connector = factory
                .create(*exchange, Arc::new(NullSink), CancellationToken::new())
                .unwrap();
            assert_eq!(connector.exchange(), *exchange);
        }
    }
}
