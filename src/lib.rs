//! Gateway for MCP tool servers.
//!
//! Maintains persistent connections to independently-addressable tool
//! servers (local stdio subprocesses or remote streamable-HTTP endpoints),
//! aggregates their capabilities, and exposes a uniform call interface with
//! automatic reconnection, periodic health checking, and timeout-bounded
//! execution.
//!
//! ## Modules
//!
//! - [`engine`]: composition root — add/remove/list/dispatch/shutdown
//! - [`registry`]: per-server connection state and its state machine
//! - [`connection`]: transport seam and the rmcp-backed implementation
//! - [`reconnect`]: capped exponential backoff policy
//! - [`store`]: persistent configuration boundary

pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod reconnect;
pub mod registry;
pub mod schema;
pub mod store;

mod dispatch;
mod health;

pub use config::{GatewayConfig, ServerConfig, TransportKind};
pub use connection::{
    ConnectOutcome, Connector, InvocationResult, RmcpConnector, ServerIdentity, ToolConnection,
};
pub use engine::{AddOutcome, GatewayEngine, GatewayStats};
pub use error::{GatewayError, GatewayResult};
pub use reconnect::ReconnectPolicy;
pub use registry::{ConnectionRegistry, ServerEntry, ServerStatus, ServerSummary};
pub use schema::{Capability, SchemaNode};
pub use store::{ConfigStore, YamlConfigStore};
