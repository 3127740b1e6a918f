//! Connection Watchdog
//!
//! Detects silently dead connections. Both venues push data unsolicited,
//! so inbound traffic doubles as a liveness signal: after `idle_after`
//! without any frame the watchdog asks the connector to send a WebSocket
//! ping, and once the quiet period reaches `dead_after` it declares the
//! connection dead so the reconnect loop can replace it.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Configuration for watchdog behavior.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Quiet period after which a ping is requested.
    pub idle_after: Duration,
    /// Quiet period after which the connection is declared dead.
    pub dead_after: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            idle_after: Duration::from_secs(20),
            dead_after: Duration::from_secs(60),
        }
    }
}

/// Events emitted by the watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogEvent {
    /// Request to send a ping message.
    SendPing,
    /// The connection is dead and should be torn down.
    Dead,
}

/// Tracks when the connection last showed signs of life.
///
/// Shared between the read loop (which records every inbound frame, pong,
/// and ping) and the watchdog task.
#[derive(Debug)]
pub struct TrafficMonitor {
    last_traffic: RwLock<Instant>,
}

impl Default for TrafficMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl TrafficMonitor {
    /// Create a monitor with the clock starting now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_traffic: RwLock::new(Instant::now()),
        }
    }

    /// Record inbound traffic.
    pub fn record(&self) {
        *self.last_traffic.write() = Instant::now();
    }

    /// Time since the last recorded traffic.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_traffic.read().elapsed()
    }
}

/// Watchdog task monitoring one connection.
///
/// Runs until cancelled or until it reports [`WatchdogEvent::Dead`].
pub struct Watchdog {
    config: WatchdogConfig,
    monitor: Arc<TrafficMonitor>,
    event_tx: mpsc::Sender<WatchdogEvent>,
    cancel: CancellationToken,
}

impl Watchdog {
    /// Create a new watchdog.
    #[must_use]
    pub const fn new(
        config: WatchdogConfig,
        monitor: Arc<TrafficMonitor>,
        event_tx: mpsc::Sender<WatchdogEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            monitor,
            event_tx,
            cancel,
        }
    }

    /// Run the monitoring loop.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.config.idle_after);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so a fresh connection
        // is not pinged at once.
        interval.tick().await;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("watchdog cancelled");
                    break;
                }
                _ = interval.tick() => {
                    if self.check().await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    /// Inspect the quiet period and emit the appropriate event.
    ///
    /// Returns `Err(())` when the connection was declared dead and the
    /// loop should exit.
    async fn check(&self) -> Result<(), ()> {
        let idle = self.monitor.idle_for();

        if idle >= self.config.dead_after {
            tracing::warn!(idle_ms = idle.as_millis(), "connection idle past deadline");
            let _ = self.event_tx.send(WatchdogEvent::Dead).await;
            return Err(());
        }

        if idle >= self.config.idle_after {
            let _ = self.event_tx.send(WatchdogEvent::SendPing).await;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitor_tracks_traffic() {
        let monitor = TrafficMonitor::new();
        assert!(monitor.idle_for() < Duration::from_secs(1));
        monitor.record();
        assert!(monitor.idle_for() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_connection_gets_pinged_then_killed() {
        let config = WatchdogConfig {
            idle_after: Duration::from_secs(5),
            dead_after: Duration::from_secs(12),
        };
        let monitor = Arc::new(TrafficMonitor::new());
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let watchdog = Watchdog::new(config, Arc::clone(&monitor), tx, cancel.clone());
        let handle = tokio::spawn(watchdog.run());

        // First check at ~5s idle: ping requested.
        assert_eq!(rx.recv().await, Some(WatchdogEvent::SendPing));
        // Still silent at ~10s: another ping; dead at ~15s.
        assert_eq!(rx.recv().await, Some(WatchdogEvent::SendPing));
        assert_eq!(rx.recv().await, Some(WatchdogEvent::Dead));

        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn active_connection_is_left_alone() {
        let config = WatchdogConfig {
            idle_after: Duration::from_secs(5),
            dead_after: Duration::from_secs(12),
        };
        let monitor = Arc::new(TrafficMonitor::new());
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let watchdog = Watchdog::new(config, Arc::clone(&monitor), tx, cancel.clone());
        let handle = tokio::spawn(watchdog.run());

        // Keep traffic flowing across several check intervals.
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_secs(4)).await;
            monitor.record();
        }
        cancel.cancel();
        handle.await.unwrap();

        assert!(rx.try_recv().is_err());
    }
}
