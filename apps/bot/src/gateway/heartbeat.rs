//! Stale-connection sweeper.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::registry::ConnectionRegistry;

/// What one sweep did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Connections closed for missing heartbeats.
    pub closed: Vec<String>,
    /// Reconnect signals sent to client transports.
    pub reconnects: usize,
}

/// Closes the connections of one service that stopped heartbeating.
pub struct HeartbeatMonitor {
    service_id: String,
    registry: Arc<ConnectionRegistry>,
    timeout: Duration,
}

impl HeartbeatMonitor {
    pub fn new(service_id: impl Into<String>, registry: Arc<ConnectionRegistry>, timeout: Duration) -> Self {
        Self {
            service_id: service_id.into(),
            registry,
            timeout,
        }
    }

    pub fn sweep(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        for record in self.registry.all_stale(&self.service_id, now, self.timeout) {
            let overrun = record.heartbeat_overrun(now, self.timeout).unwrap_or_default();
            tracing::warn!(
                service_id = %self.service_id,
                connection_id = %record.connection_id,
                overrun_ms = overrun.as_millis() as u64,
                "heartbeat timed out, closing connection"
            );
            // A concurrent close may have won; only the winner signals.
            if self.registry.close(&record.connection_id).is_none() {
                continue;
            }
            report.closed.push(record.connection_id.clone());
            if record.request_reconnect() {
                report.reconnects += 1;
            }
        }
        report
    }

    /// Sweep every `timeout` until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + self.timeout, self.timeout);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = self.sweep(Instant::now());
                        if !report.closed.is_empty() {
                            tracing::debug!(
                                service_id = %self.service_id,
                                closed = report.closed.len(),
                                reconnects = report.reconnects,
                                "heartbeat sweep"
                            );
                        }
                    }
                }
            }
            tracing::debug!(service_id = %self.service_id, "heartbeat monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::session::{ConnectionMode, ConnectionRecord, Outbound, SocketHandle};
    use tokio::sync::mpsc;

    const TIMEOUT: Duration = Duration::from_secs(15);

    fn register(
        registry: &ConnectionRegistry,
        service: &str,
        id: &str,
        mode: ConnectionMode,
    ) -> mpsc::Receiver<Outbound> {
        let (socket, rx) = SocketHandle::channel();
        registry
            .register(ConnectionRecord::new(service, id, socket, Duration::from_secs(5), mode))
            .unwrap();
        rx
    }

    #[test]
    fn empty_registry_is_a_no_op() {
        let registry = Arc::new(ConnectionRegistry::new());
        let monitor = HeartbeatMonitor::new("svc", registry, TIMEOUT);
        assert_eq!(monitor.sweep(Instant::now()), SweepReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_is_closed_and_reconnected_once() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, mut reconnects) = mpsc::unbounded_channel();
        let _rx = register(&registry, "svc", "c1", ConnectionMode::Client { reconnect: tx });
        let monitor = HeartbeatMonitor::new("svc", registry.clone(), TIMEOUT);

        tokio::time::advance(Duration::from_secs(16)).await;
        let report = monitor.sweep(Instant::now());
        assert_eq!(report.closed, vec!["c1".to_string()]);
        assert_eq!(report.reconnects, 1);
        assert!(registry.lookup("c1").is_none());
        assert_eq!(reconnects.try_recv().unwrap().connection_id, "c1");

        // Already gone: nothing more happens.
        assert_eq!(monitor.sweep(Instant::now()), SweepReport::default());
        assert!(reconnects.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_heartbeat_keeps_connection() {
        let registry = Arc::new(ConnectionRegistry::new());
        let _rx = register(&registry, "svc", "c1", ConnectionMode::Server);
        let monitor = HeartbeatMonitor::new("svc", registry.clone(), TIMEOUT);

        tokio::time::advance(Duration::from_secs(10)).await;
        registry.update_heartbeat("c1", Instant::now());
        tokio::time::advance(Duration::from_secs(10)).await;

        assert!(monitor.sweep(Instant::now()).closed.is_empty());
        assert!(registry.lookup("c1").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn other_services_are_left_alone() {
        let registry = Arc::new(ConnectionRegistry::new());
        let _a = register(&registry, "svc_a", "a", ConnectionMode::Server);
        let _b = register(&registry, "svc_b", "b", ConnectionMode::Server);
        let monitor = HeartbeatMonitor::new("svc_a", registry.clone(), TIMEOUT);

        tokio::time::advance(Duration::from_secs(20)).await;
        let report = monitor.sweep(Instant::now());
        assert_eq!(report.closed, vec!["a".to_string()]);
        assert_eq!(report.reconnects, 0);
        assert!(registry.lookup("b").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_loop_sweeps_until_cancelled() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, mut reconnects) = mpsc::unbounded_channel();
        let mut socket_rx = register(&registry, "svc", "c1", ConnectionMode::Client { reconnect: tx });
        let cancel = CancellationToken::new();
        let handle = HeartbeatMonitor::new("svc", registry.clone(), TIMEOUT).spawn(cancel.clone());

        // First tick at 15s finds the connection exactly at the limit; the
        // second at 30s closes it.
        let signal = reconnects.recv().await.unwrap();
        assert_eq!(signal.connection_id, "c1");
        assert!(matches!(socket_rx.recv().await, Some(Outbound::Close(_))));
        assert!(registry.is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }
}
