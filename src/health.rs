//! Periodic liveness sweep over connected servers.
//!
//! Each tick probes every `connected` entry concurrently; a failed probe
//! routes through the same disconnect path as an unsolicited drop, and only
//! affects the server it probed. The monitor holds a weak reference to the
//! engine so a dropped engine tears the loop down on its own.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::EngineInner;

pub(crate) struct HealthMonitor {
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub(crate) fn start(
        engine: Weak<EngineInner>,
        interval: Duration,
        probe_timeout: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // interval fires immediately; the first sweep waits a full period
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let Some(engine) = engine.upgrade() else {
                    return;
                };
                sweep(&engine, probe_timeout).await;
            }
        });
        Self {
            cancel,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub(crate) fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn sweep(engine: &Arc<EngineInner>, probe_timeout: Duration) {
    let targets = engine.registry.connected();
    if targets.is_empty() {
        return;
    }
    debug!("Health sweep probing {} server(s)", targets.len());

    // Probes run concurrently; a slow server cannot delay the others, and
    // each failure only touches its own entry.
    let probes = targets.into_iter().map(|(entry, connection, incarnation)| {
        let engine = Arc::clone(engine);
        async move {
            if let Err(e) = connection.probe(probe_timeout).await {
                engine.handle_disconnect(
                    &entry.name,
                    incarnation,
                    &format!("health probe failed: {}", e),
                );
            }
        }
    });
    futures::future::join_all(probes).await;
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::{
        config::{GatewayConfig, ServerConfig},
        connection::fake::{capability, FakeConnector},
        engine::GatewayEngine,
        registry::ServerStatus,
    };

    fn stdio_config(command: &str) -> ServerConfig {
        ServerConfig::Stdio {
            command: command.to_string(),
            args: vec![],
            envs: HashMap::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_forces_reconnect() {
        let connector = Arc::new(FakeConnector::succeeding(vec![capability("read")]));
        let engine = GatewayEngine::with_connector(GatewayConfig::default(), connector.clone());

        engine.add_server("files", stdio_config("a")).await.unwrap();
        assert_eq!(connector.connect_attempts(), 1);

        let first_conn = connector.last_connection().unwrap();
        first_conn.set_probe_failing(true);

        // next sweep (30s) marks it disconnected; the 1s backoff then
        // reconnects with a fresh link
        tokio::time::sleep(Duration::from_secs(32)).await;
        assert_eq!(connector.connect_attempts(), 2);
        assert_eq!(engine.list_servers()[0].status, ServerStatus::Connected);
        assert!(first_conn.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_only_affects_one_server() {
        let connector = Arc::new(FakeConnector::succeeding(vec![capability("read")]));
        let engine = GatewayEngine::with_connector(GatewayConfig::default(), connector.clone());

        engine.add_server("healthy", stdio_config("a")).await.unwrap();
        engine.add_server("sick", stdio_config("b")).await.unwrap();

        // the connection created for "sick" was the most recent
        let sick_conn = connector.last_connection().unwrap();
        sick_conn.set_probe_failing(true);

        tokio::time::sleep(Duration::from_millis(30_500)).await;

        let summaries = engine.list_servers();
        let healthy = summaries.iter().find(|s| s.name == "healthy").unwrap();
        let sick = summaries.iter().find(|s| s.name == "sick").unwrap();
        assert_eq!(healthy.status, ServerStatus::Connected);
        assert_ne!(sick.status, ServerStatus::Connected);
        assert!(sick.last_error.as_deref().unwrap().contains("health probe"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_monitor_stops_ticking() {
        let connector = Arc::new(FakeConnector::succeeding(vec![]));
        let engine = GatewayEngine::with_connector(GatewayConfig::default(), connector.clone());

        engine.add_server("files", stdio_config("a")).await.unwrap();
        connector.last_connection().unwrap().set_probe_failing(true);

        engine.shutdown().await;

        // with the monitor stopped, the failing probe never fires and no
        // reconnect is attempted
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.connect_attempts(), 1);
    }
}
