//! gateway.toml configuration.
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:4006"
//! backend = "10.0.0.5:3306"
//!
//! [core]
//! workers = 8
//! drain_timeout_ms = 5000
//!
//! [logging]
//! level = "info"
//! json = false
//! ```
//!
//! Every key has a default. The `[core]` table becomes the static snapshot
//! each worker receives at startup; it is never reloaded.

use crate::error::CoreError;
use crate::protocol::parser::{ParserLimits, DEFAULT_MAX_PACKET_SIZE};
use crate::protocol::types::MAX_FRAME_PAYLOAD;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub core: CoreConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Client-facing listen address
    pub listen: String,
    /// Backend server every session is routed to
    pub backend: String,
    /// Reconnect attempts before a backend failure reaches the client
    pub max_reconnect_attempts: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:4006".to_string(),
            backend: "127.0.0.1:3306".to_string(),
            max_reconnect_attempts: 3,
        }
    }
}

/// Settings consumed by the connection core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub workers: usize,
    pub poll_timeout_ms: u64,
    /// Bytes requested from the socket per read call
    pub read_chunk_size: usize,
    /// Bytes one descriptor may read per readiness event
    pub max_read_per_call: usize,
    pub max_frame_payload: usize,
    pub max_packet_size: usize,
    pub drain_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub reconnect_backoff_base_ms: u64,
    pub reconnect_backoff_max_ms: u64,
    /// Session commands kept for replay on new backends
    pub max_session_commands: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            poll_timeout_ms: 100,
            read_chunk_size: 16 * 1024,
            max_read_per_call: 256 * 1024,
            max_frame_payload: MAX_FRAME_PAYLOAD,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            drain_timeout_ms: 5_000,
            connect_timeout_ms: 3_000,
            reconnect_backoff_base_ms: 200,
            reconnect_backoff_max_ms: 5_000,
            max_session_commands: 50,
        }
    }
}

impl CoreConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_backoff_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_base_ms)
    }

    pub fn reconnect_backoff_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_max_ms)
    }

    pub fn parser_limits(&self) -> ParserLimits {
        ParserLimits {
            max_frame_payload: self.max_frame_payload,
            max_packet_size: self.max_packet_size,
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.workers == 0 {
            return Err(CoreError::Config("core.workers must be at least 1".into()));
        }
        if self.read_chunk_size == 0 {
            return Err(CoreError::Config(
                "core.read_chunk_size must be positive".into(),
            ));
        }
        if self.max_read_per_call < self.read_chunk_size {
            return Err(CoreError::Config(
                "core.max_read_per_call must be at least core.read_chunk_size".into(),
            ));
        }
        if self.max_frame_payload == 0 || self.max_frame_payload > MAX_FRAME_PAYLOAD {
            return Err(CoreError::Config(format!(
                "core.max_frame_payload must be in 1..={}",
                MAX_FRAME_PAYLOAD
            )));
        }
        if self.max_packet_size < self.max_frame_payload {
            return Err(CoreError::Config(
                "core.max_packet_size must hold at least one full frame".into(),
            ));
        }
        if self.drain_timeout_ms == 0 {
            return Err(CoreError::Config(
                "core.drain_timeout_ms must be finite and positive".into(),
            ));
        }
        if self.reconnect_backoff_max_ms < self.reconnect_backoff_base_ms {
            return Err(CoreError::Config(
                "core.reconnect_backoff_max_ms is below the base backoff".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is not set
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl GatewayConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: GatewayConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        self.listen_addr()?;
        self.backend_addr()?;
        self.core.validate()
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, CoreError> {
        parse_addr("server.listen", &self.server.listen)
    }

    pub fn backend_addr(&self) -> Result<SocketAddr, CoreError> {
        parse_addr("server.backend", &self.server.backend)
    }
}

fn parse_addr(key: &str, value: &str) -> Result<SocketAddr, CoreError> {
    value
        .parse()
        .map_err(|e| CoreError::Config(format!("{} = {:?}: {}", key, value, e)))
}
