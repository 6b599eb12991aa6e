//! Gateway error types.
//!
//! Every failure the engine can surface carries a machine-readable kind plus
//! a human-readable message; callers never parse strings back out of errors.

use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Config shape is malformed (empty command, unparseable endpoint URL,
    /// bad header). Non-retryable; fails `add_server` immediately.
    #[error("Invalid server config: {0}")]
    InvalidConfig(String),

    #[error("Duplicate server name: {0}")]
    DuplicateName(String),

    #[error("Server not found: {0}")]
    ServerNotFound(String),

    /// Dispatch attempted against a server that is not in `connected`
    /// status. The caller may retry later; the engine will not.
    #[error("Server not connected: {0}")]
    ServerDisconnected(String),

    /// Transient failure while connecting. Retryable; the reconnect loop
    /// handles it internally.
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Tool '{tool}' timed out after {timeout_ms}ms")]
    ToolTimeout { tool: String, timeout_ms: u64 },

    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    #[error("Config store error: {0}")]
    Store(String),
}

impl GatewayError {
    /// Whether the reconnect loop should keep retrying after this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::ConnectFailed(_))
    }
}
