//! Gateway engine: composition root.
//!
//! Owns the registry, the health monitor, and one reconnect task per
//! disconnected server. All operator-facing operations (add, remove, list,
//! dispatch, shutdown) live here; connection-level failures never escape —
//! they only change observable status.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::{
    config::{GatewayConfig, ServerConfig},
    connection::{Connector, InvocationResult, RmcpConnector, ToolConnection},
    dispatch,
    error::{GatewayError, GatewayResult},
    health::HealthMonitor,
    registry::{ConnectionRegistry, ServerEntry, ServerStatus, ServerSummary},
    schema::Capability,
    store::ConfigStore,
};

/// How long shutdown/remove waits for a transport to close before moving on.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of a successful `add_server`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Initial connect succeeded.
    Connected,
    /// Initial connect failed with a retryable error; the entry exists and
    /// a reconnect is scheduled.
    Connecting,
}

impl AddOutcome {
    pub fn is_connected(&self) -> bool {
        matches!(self, AddOutcome::Connected)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayStats {
    pub total_servers: usize,
    pub connected_servers: usize,
    pub capability_count: usize,
}

pub struct GatewayEngine {
    inner: Arc<EngineInner>,
    health: HealthMonitor,
}

pub(crate) struct EngineInner {
    pub(crate) registry: ConnectionRegistry,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) config: GatewayConfig,
    store: Option<Arc<dyn ConfigStore>>,
    stopped: AtomicBool,
}

impl GatewayEngine {
    /// Engine with the production rmcp connector.
    pub fn new(config: GatewayConfig) -> Self {
        Self::with_connector(config, Arc::new(RmcpConnector))
    }

    pub fn with_connector(config: GatewayConfig, connector: Arc<dyn Connector>) -> Self {
        Self::build(config, connector, None)
    }

    /// Engine restored from a persistent config store. Every previously
    /// recorded server is re-added; individual connect failures follow the
    /// normal retry path and do not fail startup.
    pub async fn with_store(
        config: GatewayConfig,
        connector: Arc<dyn Connector>,
        store: Arc<dyn ConfigStore>,
    ) -> GatewayResult<Self> {
        let entries = store.load_all().await?;
        let engine = Self::build(config, connector, Some(store));
        for (name, server_config) in entries {
            if let Err(e) = engine.add_server_inner(&name, server_config, false).await {
                warn!("Failed to restore server '{}': {}", name, e);
            }
        }
        Ok(engine)
    }

    fn build(
        config: GatewayConfig,
        connector: Arc<dyn Connector>,
        store: Option<Arc<dyn ConfigStore>>,
    ) -> Self {
        let inner = Arc::new(EngineInner {
            registry: ConnectionRegistry::new(),
            connector,
            config,
            store,
            stopped: AtomicBool::new(false),
        });
        let health = HealthMonitor::start(
            Arc::downgrade(&inner),
            inner.config.health_interval(),
            inner.config.probe_timeout(),
        );
        Self { inner, health }
    }

    /// Add a server and connect to it synchronously.
    ///
    /// `InvalidConfig` and `DuplicateName` fail outright. A retryable
    /// connect failure still adds the server and arms the backoff loop,
    /// reported as [`AddOutcome::Connecting`].
    pub async fn add_server(&self, name: &str, config: ServerConfig) -> GatewayResult<AddOutcome> {
        self.add_server_inner(name, config, true).await
    }

    async fn add_server_inner(
        &self,
        name: &str,
        config: ServerConfig,
        record: bool,
    ) -> GatewayResult<AddOutcome> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(GatewayError::ConnectFailed(
                "gateway is shut down".to_string(),
            ));
        }
        config.validate()?;
        let entry = self.inner.registry.insert(name, config)?;

        let outcome = match self.inner.connect_entry(&entry).await {
            Ok(()) => AddOutcome::Connected,
            Err(e) if e.is_retryable() => {
                warn!("Server '{}' added but not yet connected: {}", name, e);
                entry.mark_connect_failed(&e, false);
                self.inner.schedule_reconnect(Arc::clone(&entry));
                AddOutcome::Connecting
            }
            Err(e) => {
                self.inner.registry.remove(name);
                return Err(e);
            }
        };

        if record {
            if let Some(store) = &self.inner.store {
                if let Err(e) = store.record_add(name, &entry.config).await {
                    warn!("Failed to persist server '{}': {}", name, e);
                }
            }
        }
        Ok(outcome)
    }

    /// Remove a server: cancel its reconnect timer, close its connection,
    /// delete the registry entry. The name may be reused by a fresh add.
    pub async fn remove_server(&self, name: &str) -> GatewayResult<()> {
        let entry = self
            .inner
            .registry
            .remove(name)
            .ok_or_else(|| GatewayError::ServerNotFound(name.to_string()))?;

        if let Some(conn) = entry.teardown() {
            if tokio::time::timeout(CLOSE_TIMEOUT, conn.close()).await.is_err() {
                warn!("Timed out closing connection for '{}'", name);
            }
        }

        if let Some(store) = &self.inner.store {
            if let Err(e) = store.record_remove(name).await {
                warn!("Failed to persist removal of '{}': {}", name, e);
            }
        }
        info!("Removed server '{}'", name);
        Ok(())
    }

    /// Read-only snapshots of every known server, sorted by name.
    pub fn list_servers(&self) -> Vec<ServerSummary> {
        self.inner.registry.snapshot()
    }

    pub fn get_capabilities(&self, name: &str) -> GatewayResult<Vec<Capability>> {
        self.inner
            .registry
            .get(name)
            .map(|entry| entry.capabilities())
            .ok_or_else(|| GatewayError::ServerNotFound(name.to_string()))
    }

    /// Invoke one capability on one connected server with a hard deadline.
    pub async fn dispatch(
        &self,
        server: &str,
        capability: &str,
        arguments: Option<serde_json::Map<String, Value>>,
        timeout: Duration,
    ) -> GatewayResult<InvocationResult> {
        dispatch::dispatch(&self.inner.registry, server, capability, arguments, timeout).await
    }

    pub fn stats(&self) -> GatewayStats {
        let summaries = self.inner.registry.snapshot();
        GatewayStats {
            total_servers: summaries.len(),
            connected_servers: summaries
                .iter()
                .filter(|s| s.status == ServerStatus::Connected)
                .count(),
            capability_count: summaries.iter().map(|s| s.capability_count).sum(),
        }
    }

    /// Stop the health monitor, cancel every pending reconnect timer, close
    /// every live connection, and clear the registry. Safe to call more
    /// than once.
    pub async fn shutdown(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.health.stop();
        for entry in self.inner.registry.drain() {
            if let Some(conn) = entry.teardown() {
                if tokio::time::timeout(CLOSE_TIMEOUT, conn.close()).await.is_err() {
                    warn!("Timed out closing connection for '{}'", entry.name);
                }
            }
        }
        info!("Gateway engine stopped");
    }
}

impl EngineInner {
    /// Connect one entry and publish the result. This is the single connect
    /// path: fresh adds, restores, and reconnect attempts all come through
    /// here, so a server that comes back online always gets a full
    /// capability refresh.
    pub(crate) async fn connect_entry(
        self: &Arc<Self>,
        entry: &Arc<ServerEntry>,
    ) -> GatewayResult<()> {
        let outcome = self.connector.connect(&entry.name, &entry.config).await?;

        // The entry may have been torn down while the connect was in
        // flight. `mark_connected` refuses under the same lock `teardown`
        // sets the removed flag under, so the fresh connection can never
        // be published into a dead entry and leak.
        let Some(incarnation) = entry.mark_connected(&outcome) else {
            outcome.connection.close().await;
            return Err(GatewayError::ServerNotFound(entry.name.clone()));
        };
        self.spawn_disconnect_watcher(entry, &outcome.connection, incarnation);
        info!(
            "Connected to server '{}' ({} capabilities)",
            entry.name,
            outcome.capabilities.len()
        );
        Ok(())
    }

    /// Subscribe once per connect incarnation to the connection's
    /// disconnected channel and route drops into the reconnect path.
    fn spawn_disconnect_watcher(
        self: &Arc<Self>,
        entry: &Arc<ServerEntry>,
        connection: &Arc<dyn ToolConnection>,
        incarnation: u64,
    ) {
        let mut rx = connection.disconnected();
        let weak = Arc::downgrade(self);
        let name = entry.name.clone();
        tokio::spawn(async move {
            if rx.wait_for(|closed| *closed).await.is_ok() {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_disconnect(&name, incarnation, "connection closed by transport");
                }
            }
        });
    }

    /// Unsolicited drop or failed health probe. The status flips to
    /// `disconnected` before any reconnect is scheduled, so concurrent
    /// dispatches fail fast immediately. Stale incarnations are no-ops.
    pub(crate) fn handle_disconnect(self: &Arc<Self>, name: &str, incarnation: u64, reason: &str) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let Some(entry) = self.registry.get(name) else {
            return;
        };
        let Some(conn) = entry.mark_disconnected(incarnation, reason) else {
            return;
        };
        warn!("Server '{}' disconnected: {}", name, reason);
        tokio::spawn(async move { conn.close().await });
        self.schedule_reconnect(entry);
    }

    /// Arm the backoff loop for one server. A single task owns all
    /// remaining attempts sequentially, so the timer for attempt n+1 is
    /// only armed after attempt n concludes.
    pub(crate) fn schedule_reconnect(self: &Arc<Self>, entry: Arc<ServerEntry>) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let policy = self.config.reconnect_policy();

        let first_attempt = match entry.with_state(|state| {
            if state.reconnect_task.is_some() {
                None
            } else {
                Some(state.retry_attempts + 1)
            }
        }) {
            Some(attempt) => attempt,
            None => return,
        };

        if first_attempt > policy.max_attempts {
            entry.mark_connect_failed(
                &GatewayError::ConnectFailed("retry budget exhausted".to_string()),
                true,
            );
            return;
        }

        let inner = Arc::clone(self);
        let task_entry = Arc::clone(&entry);
        // The task starts only after its handle is recorded, so teardown
        // can always abort it.
        let (armed_tx, armed_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            if armed_rx.await.is_err() {
                return;
            }
            let mut attempt = first_attempt;
            loop {
                tokio::time::sleep(policy.delay_for(attempt)).await;
                if inner.stopped.load(Ordering::SeqCst) {
                    return;
                }
                // Removed while the timer was pending: never attempt again.
                let still_registered = inner
                    .registry
                    .get(&task_entry.name)
                    .is_some_and(|current| Arc::ptr_eq(&current, &task_entry));
                if !still_registered {
                    return;
                }

                task_entry.mark_reconnecting(attempt);
                info!("Reconnect attempt {} for '{}'", attempt, task_entry.name);
                match inner.connect_entry(&task_entry).await {
                    // mark_connected cleared this task's handle
                    Ok(()) => return,
                    Err(e) => {
                        let exhausted = policy.is_exhausted(attempt);
                        task_entry.mark_connect_failed(&e, exhausted);
                        if exhausted {
                            error!(
                                "Server '{}' unreachable after {} reconnect attempts: {}",
                                task_entry.name, attempt, e
                            );
                            return;
                        }
                        warn!(
                            "Reconnect attempt {} for '{}' failed: {}. Retrying in {:?}",
                            attempt,
                            task_entry.name,
                            e,
                            policy.delay_for(attempt + 1)
                        );
                        attempt += 1;
                    }
                }
            }
        });
        entry.with_state(|state| state.reconnect_task = Some(handle));
        let _ = armed_tx.send(());
    }
}
