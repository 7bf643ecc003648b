//! Configuration system.
//!
//! Loads replication settings from JSON strings/files. Every field has a
//! serde default so a config file only needs to name what it changes.

use std::{net::SocketAddr, path::Path, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Root configuration shared by client/server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Server address the client connects to, e.g. `127.0.0.1:40000`.
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    /// IP the server binds on.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Port the server listens on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shared secret; at most 30 bytes.
    #[serde(default = "default_secret")]
    pub secret: String,
    /// Host tick rate used by the binaries.
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
    /// Client heartbeat threshold in milliseconds.
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    #[serde(default)]
    pub transport: TransportConfig,
}

/// Settings for the datagram transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Interval between connection request retries.
    pub connect_timeout_ms: u64,
    /// Requests sent before a connect attempt is abandoned.
    pub max_connect_attempts: u32,
    /// Silence after which a connection is considered dead.
    pub disconnect_timeout_ms: u64,
    /// Idle interval after which a transport keepalive is sent.
    pub keepalive_ms: u64,
    /// Datagrams queued while the socket is not writable.
    pub max_outbox: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 1000,
            max_connect_attempts: 60,
            disconnect_timeout_ms: 30_000,
            keepalive_ms: 500,
            max_outbox: 1024,
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_millis(self.keepalive_ms)
    }
}

fn default_server_addr() -> String {
    "127.0.0.1:40000".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    40000
}

fn default_secret() -> String {
    "replica".to_string()
}

fn default_tick_hz() -> u32 {
    60
}

fn default_heartbeat_ms() -> u64 {
    750
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            bind_addr: default_bind_addr(),
            port: default_port(),
            secret: default_secret(),
            tick_hz: default_tick_hz(),
            heartbeat_ms: default_heartbeat_ms(),
            transport: TransportConfig::default(),
        }
    }
}

impl ReplicaConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Reads and parses a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    /// Fixed tick interval derived from `tick_hz`.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_hz.max(1) as f64)
    }

    pub fn server_socket_addr(&self) -> anyhow::Result<SocketAddr> {
        self.server_addr.parse().context("parse server_addr")
    }

    /// Bind address for a given port, e.g. `0.0.0.0:40000`.
    pub fn bind_socket_addr(&self, port: u16) -> anyhow::Result<SocketAddr> {
        let ip = self.bind_addr.parse().context("parse bind_addr")?;
        Ok(SocketAddr::new(ip, port))
    }
}
