//! Connection abstraction over one upstream tool server.
//!
//! The engine never talks to rmcp directly: it goes through the
//! [`ToolConnection`] trait so the state machine can be exercised with
//! in-memory fakes. [`RmcpConnector`] is the production factory — it spawns
//! stdio child processes or opens streamable HTTP sessions and performs the
//! MCP handshake.

use std::{borrow::Cow, sync::Arc, time::Duration};

use async_trait::async_trait;
use rmcp::{
    model::{CallToolRequestParam, CallToolResult},
    service::RunningService,
    transport::{
        streamable_http_client::StreamableHttpClientTransportConfig, ConfigureCommandExt,
        StreamableHttpClientTransport, TokioChildProcess,
    },
    Peer, RoleClient, ServiceExt,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::{
    config::{parse_header_map, ServerConfig},
    error::{GatewayError, GatewayResult},
    schema::Capability,
};

type McpService = RunningService<RoleClient, ()>;

/// Server-reported identity from the handshake. Advisory only, never used
/// for routing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerIdentity {
    pub name: String,
    pub version: String,
}

/// Result of one capability invocation: the serialized content items plus
/// the server's error flag.
#[derive(Debug, Clone, Serialize)]
pub struct InvocationResult {
    pub content: Value,
    pub is_error: bool,
}

impl From<CallToolResult> for InvocationResult {
    fn from(result: CallToolResult) -> Self {
        let content = serde_json::to_value(&result.content).unwrap_or(Value::Null);
        Self {
            content,
            is_error: result.is_error.unwrap_or(false),
        }
    }
}

/// Everything a successful (possibly degraded) connect hands back to the
/// registry in one piece.
pub struct ConnectOutcome {
    pub connection: Arc<dyn ToolConnection>,
    pub capabilities: Vec<Capability>,
    pub identity: Option<ServerIdentity>,
    /// Set when the handshake was degraded: the server violated the
    /// expected response shape but the link is usable.
    pub warning: Option<String>,
}

/// One live upstream link.
#[async_trait]
pub trait ToolConnection: Send + Sync {
    /// Fetch the server's current capability list.
    async fn list_capabilities(&self) -> GatewayResult<Vec<Capability>>;

    /// Invoke one capability. Deadline enforcement is the dispatcher's job.
    async fn invoke(
        &self,
        capability: &str,
        arguments: Option<serde_json::Map<String, Value>>,
    ) -> GatewayResult<InvocationResult>;

    /// Release the transport. Must be safe to call more than once.
    async fn close(&self);

    /// Receiver that flips to `true` when the link drops without `close()`.
    /// Subscribed once per connect incarnation by the owning registry entry.
    fn disconnected(&self) -> watch::Receiver<bool>;

    /// Lightweight liveness check: listing capabilities is cheap and any
    /// successful response proves the link is alive.
    async fn probe(&self, deadline: Duration) -> GatewayResult<()> {
        match tokio::time::timeout(deadline, self.list_capabilities()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(GatewayError::ConnectFailed(format!(
                "probe timed out after {:?}",
                deadline
            ))),
        }
    }
}

/// Factory that turns a config into a live connection. The engine uses the
/// same connector for fresh adds and reconnects.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, name: &str, config: &ServerConfig) -> GatewayResult<ConnectOutcome>;
}

/// Whether an error message reads like a protocol-shape violation rather
/// than a transport failure. Used to tolerate not-quite-compliant servers:
/// the connection stays up with an advisory warning instead of being torn
/// down.
pub(crate) fn is_schema_violation(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    ["missing field", "invalid type", "unknown variant", "expected", "schema", "serde"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// rmcp-backed connection: a cloned peer handle for concurrent calls plus a
/// task that owns the running service. The owner task resolves when the
/// link drops on its own or when `close()` asks it to cancel the service,
/// and feeds the watch channel either way.
pub struct RmcpConnection {
    peer: Peer<RoleClient>,
    close_tx: Mutex<Option<oneshot::Sender<()>>>,
    closed_rx: watch::Receiver<bool>,
}

impl RmcpConnection {
    fn start(service: McpService) -> Self {
        let peer = service.peer().clone();
        let (close_tx, close_rx) = oneshot::channel::<()>();
        let (closed_tx, closed_rx) = watch::channel(false);

        tokio::spawn(async move {
            let cancel_token = service.cancellation_token();
            let waiting = service.waiting();
            tokio::pin!(waiting);
            tokio::select! {
                _ = &mut waiting => {}
                _ = close_rx => {
                    cancel_token.cancel();
                    if let Err(e) = waiting.await {
                        debug!("MCP service exited uncleanly on close: {}", e);
                    }
                }
            }
            let _ = closed_tx.send(true);
        });

        Self {
            peer,
            close_tx: Mutex::new(Some(close_tx)),
            closed_rx,
        }
    }

    fn identity(&self) -> Option<ServerIdentity> {
        self.peer.peer_info().map(|info| ServerIdentity {
            name: info.server_info.name.clone(),
            version: info.server_info.version.clone(),
        })
    }
}

#[async_trait]
impl ToolConnection for RmcpConnection {
    async fn list_capabilities(&self) -> GatewayResult<Vec<Capability>> {
        let tools = self
            .peer
            .list_all_tools()
            .await
            .map_err(|e| GatewayError::ConnectFailed(format!("list tools: {}", e)))?;
        Ok(tools.iter().map(Capability::from_tool).collect())
    }

    async fn invoke(
        &self,
        capability: &str,
        arguments: Option<serde_json::Map<String, Value>>,
    ) -> GatewayResult<InvocationResult> {
        let request = CallToolRequestParam {
            name: Cow::Owned(capability.to_string()),
            arguments,
        };
        let result = self
            .peer
            .call_tool(request)
            .await
            .map_err(|e| GatewayError::ToolExecution(format!("call tool: {}", e)))?;
        Ok(result.into())
    }

    async fn close(&self) {
        // First close wins; later calls find the sender already taken.
        if let Some(tx) = self.close_tx.lock().take() {
            let _ = tx.send(());
        }
    }

    fn disconnected(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }
}

/// Production connector: spawns stdio servers, opens streamable HTTP
/// sessions, performs the handshake, and fetches the initial capability
/// list.
#[derive(Debug, Default)]
pub struct RmcpConnector;

impl RmcpConnector {
    async fn handshake(&self, name: &str, config: &ServerConfig) -> GatewayResult<McpService> {
        match config {
            ServerConfig::Stdio { command, args, envs } => {
                let transport = TokioChildProcess::new(
                    tokio::process::Command::new(command).configure(|cmd| {
                        cmd.args(args)
                            .envs(envs.iter())
                            .stderr(std::process::Stdio::inherit());
                    }),
                )
                .map_err(|e| {
                    GatewayError::ConnectFailed(format!("spawn '{}': {}", command, e))
                })?;

                let service = ().serve(transport).await.map_err(|e| {
                    GatewayError::ConnectFailed(format!("initialize stdio client: {}", e))
                })?;

                info!("Connected to stdio server '{}'", name);
                Ok(service)
            }

            ServerConfig::Streamable { url, headers } => {
                let service = if headers.is_empty() {
                    let transport = StreamableHttpClientTransport::from_uri(url.as_str());
                    ().serve(transport).await
                } else {
                    let header_map = parse_header_map(headers)?;
                    let http = reqwest::Client::builder()
                        .default_headers(header_map)
                        .connect_timeout(Duration::from_secs(10))
                        .build()
                        .map_err(|e| {
                            GatewayError::ConnectFailed(format!("build HTTP client: {}", e))
                        })?;
                    let cfg = StreamableHttpClientTransportConfig::with_uri(url.as_str());
                    let transport = StreamableHttpClientTransport::with_client(http, cfg);
                    ().serve(transport).await
                }
                .map_err(|e| {
                    GatewayError::ConnectFailed(format!("initialize streamable client: {}", e))
                })?;

                info!("Connected to streamable HTTP server '{}' at {}", name, url);
                Ok(service)
            }
        }
    }
}

#[async_trait]
impl Connector for RmcpConnector {
    async fn connect(&self, name: &str, config: &ServerConfig) -> GatewayResult<ConnectOutcome> {
        let service = self.handshake(name, config).await?;
        let connection = Arc::new(RmcpConnection::start(service));
        let identity = connection.identity();

        match connection.list_capabilities().await {
            Ok(capabilities) => Ok(ConnectOutcome {
                connection,
                capabilities,
                identity,
                warning: None,
            }),
            Err(e) if is_schema_violation(&e.to_string()) => {
                // Degraded connect: the server is not fully protocol
                // compliant but the link itself works. Keep it with an
                // empty capability list and an advisory warning.
                let warning = format!("capability fetch violated expected shape: {}", e);
                warn!("Degraded connect for '{}': {}", name, warning);
                Ok(ConnectOutcome {
                    connection,
                    capabilities: Vec::new(),
                    identity,
                    warning: Some(warning),
                })
            }
            Err(e) => {
                connection.close().await;
                Err(e)
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_violation_classification() {
        assert!(is_schema_violation("missing field `tools` at line 1"));
        assert!(is_schema_violation("invalid type: string, expected a map"));
        assert!(is_schema_violation("unknown variant `toolz`"));
        assert!(!is_schema_violation("connection refused"));
        assert!(!is_schema_violation("dns lookup failed"));
    }

    #[tokio::test]
    async fn test_fake_connection_close_is_idempotent() {
        let conn = fake::FakeConnection::new(vec![]);
        conn.close().await;
        conn.close().await;
        assert!(conn.is_closed());
        assert!(*conn.disconnected().borrow());
    }

    #[tokio::test]
    async fn test_probe_surfaces_list_failure() {
        let conn = fake::FakeConnection::new(vec![]);
        conn.set_probe_failing(true);
        let result = conn.probe(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(GatewayError::ConnectFailed(_))));
    }
}
