//! Gateway configuration types.
//!
//! `ServerConfig` describes how to reach one upstream tool server. The two
//! transport shapes are a tagged union, so a config that is "both stdio and
//! HTTP" (or neither) is unrepresentable. `GatewayConfig` carries the engine
//! tuning knobs (reconnect budget, health interval) with serde defaults.

use std::{collections::HashMap, fmt, time::Duration};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    error::{GatewayError, GatewayResult},
    reconnect::ReconnectPolicy,
};

/// Immutable description of how to reach one server. Replace, don't edit.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum ServerConfig {
    /// Local server: spawn `command` and speak the protocol over its stdio.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        envs: HashMap<String, String>,
    },
    /// Remote server: streamable HTTP endpoint, `headers` attached to every
    /// request.
    Streamable {
        url: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
}

impl ServerConfig {
    /// Validate the config shape before any I/O is attempted.
    ///
    /// A malformed endpoint URL or header is `InvalidConfig`, distinct from
    /// a transient network failure: it fails `add_server` outright and is
    /// never retried.
    pub fn validate(&self) -> GatewayResult<()> {
        match self {
            ServerConfig::Stdio { command, .. } => {
                if command.trim().is_empty() {
                    return Err(GatewayError::InvalidConfig(
                        "stdio command must not be empty".to_string(),
                    ));
                }
                Ok(())
            }
            ServerConfig::Streamable { url, headers } => {
                let parsed = Url::parse(url).map_err(|e| {
                    GatewayError::InvalidConfig(format!("invalid endpoint URL '{}': {}", url, e))
                })?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(GatewayError::InvalidConfig(format!(
                        "unsupported URL scheme '{}' in '{}'",
                        parsed.scheme(),
                        url
                    )));
                }
                parse_header_map(headers)?;
                Ok(())
            }
        }
    }

    pub fn transport_kind(&self) -> TransportKind {
        match self {
            ServerConfig::Stdio { .. } => TransportKind::Stdio,
            ServerConfig::Streamable { .. } => TransportKind::Streamable,
        }
    }
}

/// Build a `HeaderMap` from configured extra headers, rejecting names or
/// values the HTTP layer cannot carry.
pub(crate) fn parse_header_map(headers: &HashMap<String, String>) -> GatewayResult<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| GatewayError::InvalidConfig(format!("bad header name '{}': {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| GatewayError::InvalidConfig(format!("bad header value for '{}': {}", name, e)))?;
        map.insert(name, value);
    }
    Ok(map)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Streamable,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Stdio => write!(f, "stdio"),
            TransportKind::Streamable => write!(f, "streamable"),
        }
    }
}

/// Engine tuning knobs. All fields have defaults matching the reference
/// behavior: 1s base / 30s cap / 10 reconnect attempts, 30s health sweep,
/// 5s probe timeout.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,

    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,

    #[serde(default = "default_reconnect_max_attempts")]
    pub reconnect_max_attempts: u32,

    /// Interval between health sweeps (seconds).
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,

    /// Per-probe deadline (seconds). A hung probe must not stall the sweep.
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

fn default_reconnect_base_ms() -> u64 {
    1_000
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_reconnect_max_attempts() -> u32 {
    10
}

fn default_health_interval_secs() -> u64 {
    30
}

fn default_probe_timeout_secs() -> u64 {
    5
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            reconnect_max_attempts: default_reconnect_max_attempts(),
            health_interval_secs: default_health_interval_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
        }
    }
}

impl GatewayConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.reconnect_base_ms),
            max_delay: Duration::from_millis(self.reconnect_max_ms),
            max_attempts: self.reconnect_max_attempts,
        }
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}
