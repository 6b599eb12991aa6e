//! Connection registry: the single source of truth for what servers exist
//! and what state they are in.
//!
//! Each entry pairs an immutable `ServerConfig` with a mutex-guarded mutable
//! record. The lock is held only for the instant of a state mutation, never
//! across connect/invoke/probe I/O. All transitions go through entry
//! methods, so readers can never observe a half-updated record (for
//! example "connected" paired with a stale capability list).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::{
    config::{ServerConfig, TransportKind},
    connection::{ConnectOutcome, ServerIdentity, ToolConnection},
    error::{GatewayError, GatewayResult},
    schema::Capability,
};

/// Lifecycle status of one server.
///
/// `connecting → connected → {disconnected, error}`;
/// `disconnected → reconnecting → connected | error`.
/// `Error` is terminal until the operator removes and re-adds the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Error,
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServerStatus::Connecting => "connecting",
            ServerStatus::Connected => "connected",
            ServerStatus::Disconnected => "disconnected",
            ServerStatus::Reconnecting => "reconnecting",
            ServerStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Mutable runtime record for one server.
pub(crate) struct ServerState {
    pub(crate) status: ServerStatus,
    pub(crate) capabilities: Vec<Capability>,
    pub(crate) retry_attempts: u32,
    pub(crate) connected_at: Option<DateTime<Utc>>,
    pub(crate) last_error_at: Option<DateTime<Utc>>,
    pub(crate) last_error: Option<String>,
    pub(crate) degraded_warning: Option<String>,
    pub(crate) identity: Option<ServerIdentity>,
    pub(crate) connection: Option<Arc<dyn ToolConnection>>,
    pub(crate) reconnect_task: Option<JoinHandle<()>>,
    /// Set by `teardown()`. A removed entry can never publish a new
    /// connection, even if a connect was already in flight when the
    /// removal ran.
    pub(crate) removed: bool,
    /// Bumped on every successful connect. Disconnect events carry the
    /// incarnation they observed; stale ones are dropped, which is what
    /// keeps callbacks from a previous connection generation harmless.
    pub(crate) incarnation: u64,
}

/// One registry entry: immutable config plus guarded mutable state.
pub struct ServerEntry {
    pub name: String,
    pub config: ServerConfig,
    state: Mutex<ServerState>,
}

impl std::fmt::Debug for ServerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerEntry")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl ServerEntry {
    fn new(name: String, config: ServerConfig) -> Self {
        Self {
            name,
            config,
            state: Mutex::new(ServerState {
                status: ServerStatus::Connecting,
                capabilities: Vec::new(),
                retry_attempts: 0,
                connected_at: None,
                last_error_at: None,
                last_error: None,
                degraded_warning: None,
                identity: None,
                connection: None,
                reconnect_task: None,
                removed: false,
                incarnation: 0,
            }),
        }
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut ServerState) -> R) -> R {
        f(&mut self.state.lock())
    }

    pub fn status(&self) -> ServerStatus {
        self.state.lock().status
    }

    pub fn capabilities(&self) -> Vec<Capability> {
        self.state.lock().capabilities.clone()
    }

    /// Connection handle plus current incarnation, only while connected.
    pub(crate) fn live_connection(&self) -> Option<(Arc<dyn ToolConnection>, u64)> {
        let state = self.state.lock();
        if state.status != ServerStatus::Connected {
            return None;
        }
        state
            .connection
            .as_ref()
            .map(|conn| (Arc::clone(conn), state.incarnation))
    }

    /// Transition into `connected`, replacing the capability list wholesale
    /// and zeroing the retry counter. Returns the new incarnation, or
    /// `None` when the entry was torn down while the connect was in
    /// flight — the caller must close the connection it is holding.
    pub(crate) fn mark_connected(&self, outcome: &ConnectOutcome) -> Option<u64> {
        let mut state = self.state.lock();
        if state.removed {
            return None;
        }
        state.status = ServerStatus::Connected;
        state.capabilities = outcome.capabilities.clone();
        state.retry_attempts = 0;
        state.connected_at = Some(Utc::now());
        state.degraded_warning = outcome.warning.clone();
        state.identity = outcome.identity.clone();
        state.connection = Some(Arc::clone(&outcome.connection));
        // The reconnect task that just succeeded (if any) is done; dropping
        // its handle here lets the next disconnect arm a fresh one.
        state.reconnect_task = None;
        state.incarnation += 1;
        Some(state.incarnation)
    }

    /// `connected → disconnected`, but only if `incarnation` still matches
    /// the generation the caller observed. Clears the capability list and
    /// hands back the connection for closing. Returns `None` when the event
    /// is stale or the entry is not connected.
    pub(crate) fn mark_disconnected(
        &self,
        incarnation: u64,
        reason: &str,
    ) -> Option<Arc<dyn ToolConnection>> {
        let mut state = self.state.lock();
        if state.status != ServerStatus::Connected || state.incarnation != incarnation {
            return None;
        }
        state.status = ServerStatus::Disconnected;
        state.capabilities.clear();
        // Identity and warning described the dead incarnation; a summary
        // taken while disconnected must not carry them.
        state.degraded_warning = None;
        state.identity = None;
        state.last_error = Some(reason.to_string());
        state.last_error_at = Some(Utc::now());
        state.connection.take()
    }

    /// `disconnected → reconnecting`; the retry counter increments on entry.
    pub(crate) fn mark_reconnecting(&self, attempt: u32) {
        let mut state = self.state.lock();
        state.status = ServerStatus::Reconnecting;
        state.retry_attempts = attempt;
    }

    /// Record a failed connect attempt: back to `disconnected` while budget
    /// remains, terminal `error` once it is spent.
    pub(crate) fn mark_connect_failed(&self, error: &GatewayError, exhausted: bool) {
        let mut state = self.state.lock();
        state.status = if exhausted {
            ServerStatus::Error
        } else {
            ServerStatus::Disconnected
        };
        state.last_error = Some(error.to_string());
        state.last_error_at = Some(Utc::now());
        if exhausted {
            state.reconnect_task = None;
        }
    }

    /// Tear down for removal/shutdown: abort any pending reconnect timer
    /// and hand back the connection (if any) for closing.
    pub(crate) fn teardown(&self) -> Option<Arc<dyn ToolConnection>> {
        let mut state = self.state.lock();
        if let Some(task) = state.reconnect_task.take() {
            task.abort();
        }
        // Both guards are needed: the incarnation bump silences stale
        // watchers, and the removed flag stops an in-flight connect from
        // publishing into this entry after the fact.
        state.removed = true;
        state.incarnation += 1;
        state.connection.take()
    }

    pub fn snapshot(&self) -> ServerSummary {
        let state = self.state.lock();
        ServerSummary {
            name: self.name.clone(),
            status: state.status,
            transport: self.config.transport_kind(),
            capability_count: state.capabilities.len(),
            retry_attempts: state.retry_attempts,
            connected_at: state.connected_at,
            last_error: state.last_error.clone(),
            degraded_warning: state.degraded_warning.clone(),
            identity: state.identity.clone(),
        }
    }
}

/// Read-only snapshot of one entry, safe to hand across the boundary.
#[derive(Debug, Clone, Serialize)]
pub struct ServerSummary {
    pub name: String,
    pub status: ServerStatus,
    pub transport: TransportKind,
    pub capability_count: usize,
    pub retry_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded_warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<ServerIdentity>,
}

/// Name-keyed table of all known servers.
pub struct ConnectionRegistry {
    entries: DashMap<String, Arc<ServerEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Insert a fresh entry in `connecting` status. Rejects duplicates
    /// atomically.
    pub fn insert(&self, name: &str, config: ServerConfig) -> GatewayResult<Arc<ServerEntry>> {
        match self.entries.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(GatewayError::DuplicateName(name.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let entry = Arc::new(ServerEntry::new(name.to_string(), config));
                slot.insert(Arc::clone(&entry));
                Ok(entry)
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<ServerEntry>> {
        self.entries.get(name).map(|e| Arc::clone(e.value()))
    }

    pub fn remove(&self, name: &str) -> Option<Arc<ServerEntry>> {
        self.entries.remove(name).map(|(_, entry)| entry)
    }

    /// Entries currently in `connected` status, with their live connection
    /// and incarnation. This is the health sweep's worklist.
    pub(crate) fn connected(&self) -> Vec<(Arc<ServerEntry>, Arc<dyn ToolConnection>, u64)> {
        self.entries
            .iter()
            .filter_map(|e| {
                let entry = Arc::clone(e.value());
                entry
                    .live_connection()
                    .map(|(conn, incarnation)| (entry, conn, incarnation))
            })
            .collect()
    }

    pub fn snapshot(&self) -> Vec<ServerSummary> {
        let mut summaries: Vec<ServerSummary> =
            self.entries.iter().map(|e| e.value().snapshot()).collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    /// Remove and return every entry (shutdown path).
    pub(crate) fn drain(&self) -> Vec<Arc<ServerEntry>> {
        let names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names
            .into_iter()
            .filter_map(|name| self.remove(&name))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::fake::{capability, FakeConnection};
    use crate::connection::ConnectOutcome;

    fn stdio_config() -> ServerConfig {
        ServerConfig::Stdio {
            command: "mcp-server".to_string(),
            args: vec![],
            envs: Default::default(),
        }
    }

    fn connected_outcome(caps: Vec<Capability>) -> ConnectOutcome {
        ConnectOutcome {
            connection: Arc::new(FakeConnection::new(caps.clone())),
            capabilities: caps,
            identity: None,
            warning: None,
        }
    }

    #[test]
    fn test_insert_rejects_duplicate_name() {
        let registry = ConnectionRegistry::new();
        registry.insert("files", stdio_config()).unwrap();
        let err = registry.insert("files", stdio_config()).unwrap_err();
        assert!(matches!(err, GatewayError::DuplicateName(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_new_entry_starts_connecting_with_zero_retries() {
        let registry = ConnectionRegistry::new();
        let entry = registry.insert("files", stdio_config()).unwrap();
        assert_eq!(entry.status(), ServerStatus::Connecting);
        assert_eq!(entry.snapshot().retry_attempts, 0);
    }

    #[tokio::test]
    async fn test_connect_resets_counter_and_replaces_capabilities() {
        let registry = ConnectionRegistry::new();
        let entry = registry.insert("files", stdio_config()).unwrap();
        entry.mark_reconnecting(3);

        let incarnation = entry
            .mark_connected(&connected_outcome(vec![capability("read")]))
            .unwrap();
        assert_eq!(incarnation, 1);
        assert_eq!(entry.status(), ServerStatus::Connected);

        let snap = entry.snapshot();
        assert_eq!(snap.retry_attempts, 0);
        assert_eq!(snap.capability_count, 1);
        assert!(snap.connected_at.is_some());

        // Reconnect with a different capability set: old list never leaks.
        entry.mark_disconnected(incarnation, "link lost");
        let incarnation = entry
            .mark_connected(&connected_outcome(vec![
                capability("write"),
                capability("stat"),
            ]))
            .unwrap();
        assert_eq!(incarnation, 2);
        let names: Vec<String> = entry.capabilities().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["write".to_string(), "stat".to_string()]);
    }

    #[tokio::test]
    async fn test_disconnect_clears_capabilities_and_yields_connection() {
        let registry = ConnectionRegistry::new();
        let entry = registry.insert("files", stdio_config()).unwrap();
        let caps = vec![capability("read")];
        let incarnation = entry
            .mark_connected(&ConnectOutcome {
                connection: Arc::new(FakeConnection::new(caps.clone())),
                capabilities: caps,
                identity: Some(crate::connection::ServerIdentity {
                    name: "fs-server".to_string(),
                    version: "1.2.0".to_string(),
                }),
                warning: Some("odd response shape".to_string()),
            })
            .unwrap();

        let conn = entry.mark_disconnected(incarnation, "socket reset");
        assert!(conn.is_some());
        assert_eq!(entry.status(), ServerStatus::Disconnected);
        assert!(entry.capabilities().is_empty());

        // Nothing from the dead incarnation survives in the summary.
        let snap = entry.snapshot();
        assert_eq!(snap.last_error.as_deref(), Some("socket reset"));
        assert!(snap.degraded_warning.is_none());
        assert!(snap.identity.is_none());
    }

    #[tokio::test]
    async fn test_stale_disconnect_is_ignored() {
        let registry = ConnectionRegistry::new();
        let entry = registry.insert("files", stdio_config()).unwrap();
        let first = entry
            .mark_connected(&connected_outcome(vec![capability("read")]))
            .unwrap();
        entry.mark_disconnected(first, "drop");
        let second = entry
            .mark_connected(&connected_outcome(vec![capability("read")]))
            .unwrap();
        assert_ne!(first, second);

        // An event from the first incarnation must not touch the new link.
        assert!(entry.mark_disconnected(first, "late event").is_none());
        assert_eq!(entry.status(), ServerStatus::Connected);
    }

    #[tokio::test]
    async fn test_exhausted_connect_failure_is_terminal_error() {
        let registry = ConnectionRegistry::new();
        let entry = registry.insert("files", stdio_config()).unwrap();
        entry.mark_reconnecting(10);
        entry.mark_connect_failed(&GatewayError::ConnectFailed("refused".to_string()), true);
        assert_eq!(entry.status(), ServerStatus::Error);
        assert!(entry.snapshot().last_error.is_some());
    }

    #[tokio::test]
    async fn test_live_connection_only_while_connected() {
        let registry = ConnectionRegistry::new();
        let entry = registry.insert("files", stdio_config()).unwrap();
        assert!(entry.live_connection().is_none());

        let incarnation = entry.mark_connected(&connected_outcome(vec![])).unwrap();
        assert!(entry.live_connection().is_some());

        entry.mark_disconnected(incarnation, "drop");
        assert!(entry.live_connection().is_none());
    }

    #[test]
    fn test_snapshot_is_sorted_and_detached() {
        let registry = ConnectionRegistry::new();
        registry.insert("zeta", stdio_config()).unwrap();
        registry.insert("alpha", stdio_config()).unwrap();

        let snaps = registry.snapshot();
        let names: Vec<&str> = snaps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn test_teardown_blocks_late_connect_publication() {
        let registry = ConnectionRegistry::new();
        let entry = registry.insert("files", stdio_config()).unwrap();

        // Removal completes while a connect for this entry is in flight.
        registry.remove("files");
        assert!(entry.teardown().is_none());

        // The late connect must not be published into the dead entry.
        assert!(entry
            .mark_connected(&connected_outcome(vec![capability("read")]))
            .is_none());
        assert_ne!(entry.status(), ServerStatus::Connected);
        assert!(entry.live_connection().is_none());
    }

    #[test]
    fn test_remove_then_readd_starts_fresh() {
        let registry = ConnectionRegistry::new();
        let entry = registry.insert("files", stdio_config()).unwrap();
        entry.mark_reconnecting(7);
        assert!(registry.remove("files").is_some());
        assert!(registry.get("files").is_none());

        let fresh = registry.insert("files", stdio_config()).unwrap();
        assert_eq!(fresh.snapshot().retry_attempts, 0);
        assert_eq!(fresh.status(), ServerStatus::Connecting);
    }
}
