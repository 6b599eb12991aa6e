//! Timeout-bounded capability dispatch.
//!
//! Dispatch is fail-fast: a server that is not in `connected` status is
//! rejected immediately rather than waiting for a reconnect. The per-call
//! deadline is the only caller-facing timeout; when it elapses the in-flight
//! invoke is abandoned and its eventual result discarded, but the server's
//! connection status is untouched.

use std::time::Duration;

use serde_json::Value;

use crate::{
    connection::InvocationResult,
    error::{GatewayError, GatewayResult},
    registry::ConnectionRegistry,
};

pub(crate) async fn dispatch(
    registry: &ConnectionRegistry,
    server: &str,
    capability: &str,
    arguments: Option<serde_json::Map<String, Value>>,
    timeout: Duration,
) -> GatewayResult<InvocationResult> {
    let entry = registry
        .get(server)
        .ok_or_else(|| GatewayError::ServerNotFound(server.to_string()))?;

    let Some((connection, _incarnation)) = entry.live_connection() else {
        return Err(GatewayError::ServerDisconnected(server.to_string()));
    };

    match tokio::time::timeout(timeout, connection.invoke(capability, arguments)).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::ToolTimeout {
            tool: capability.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}
