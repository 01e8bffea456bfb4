//! Client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

/// Default local SOCKS5 listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8020";

/// Default number of tunnels kept open to the relay.
pub const DEFAULT_TUNNEL_COUNT: usize = 2;

/// Default flow table capacity.
pub const DEFAULT_FLOW_CAPACITY: usize = 200;

/// Drained segments between two quota reports.
pub const DEFAULT_QUOTA_THRESHOLD: u16 = 20;

/// Largest flow table the 16-bit slot index can address.
pub const MAX_FLOW_CAPACITY: usize = u16::MAX as usize + 1;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Local SOCKS5 listen address
    pub listen_addr: String,
    /// Relay WebSocket endpoint (ws:// or wss://)
    pub url: String,
    /// Identity token sent to the relay
    pub uuid: String,
    /// Number of tunnels
    pub tunnel_count: usize,
    /// Flow table capacity
    pub flow_capacity: usize,
    /// Interval between keepalive pings
    pub keepalive_interval: Duration,
    /// Unanswered pings tolerated; a keepalive tick finding more closes
    /// the tunnel
    pub max_missed_pongs: u32,
    /// Wait after a failed dial
    pub dial_retry_delay: Duration,
    /// Wait after a tunnel broke before dialing again
    pub reconnect_delay: Duration,
    /// Deadline for each write to a local socket
    pub local_write_timeout: Duration,
    /// Deadline for each tunnel write, lock wait included
    pub tunnel_write_timeout: Duration,
    /// Drained segments between quota reports
    pub quota_threshold: u16,
    /// Deadline for establishing a tunnel connection
    pub connect_timeout: Duration,
}

impl ClientConfig {
    /// Create a configuration with default tuning for the given relay.
    pub fn new(url: impl Into<String>, uuid: impl Into<String>) -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            url: url.into(),
            uuid: uuid.into(),
            tunnel_count: DEFAULT_TUNNEL_COUNT,
            flow_capacity: DEFAULT_FLOW_CAPACITY,
            keepalive_interval: Duration::from_secs(30),
            max_missed_pongs: 3,
            dial_retry_delay: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(15),
            local_write_timeout: Duration::from_secs(1),
            tunnel_write_timeout: Duration::from_secs(10),
            quota_threshold: DEFAULT_QUOTA_THRESHOLD,
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// URL used to dial a tunnel: the endpoint with the identity token
    /// appended as the `uuid` query parameter.
    pub fn tunnel_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.url)
            .map_err(|e| Error::config(format!("invalid url {}: {}", self.url, e)))?;
        url.query_pairs_mut().append_pair("uuid", &self.uuid);
        Ok(url)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            return Err(Error::config("listen_addr cannot be empty"));
        }
        if self.uuid.is_empty() {
            return Err(Error::config("uuid cannot be empty"));
        }

        let url = self.tunnel_url()?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::config(format!(
                "url scheme must be ws or wss, got {}",
                url.scheme()
            )));
        }

        if self.tunnel_count == 0 {
            return Err(Error::config("tunnel_count must be at least 1"));
        }
        if self.flow_capacity == 0 || self.flow_capacity > MAX_FLOW_CAPACITY {
            return Err(Error::config(format!(
                "flow_capacity must be within 1..={}",
                MAX_FLOW_CAPACITY
            )));
        }
        if self.quota_threshold == 0 {
            return Err(Error::config("quota_threshold must be at least 1"));
        }
        if self.max_missed_pongs == 0 {
            return Err(Error::config("max_missed_pongs must be at least 1"));
        }
        if self.tunnel_write_timeout.is_zero() {
            return Err(Error::config("tunnel_write_timeout must be positive"));
        }
        Ok(())
    }
}

/// Configuration file format for serialization.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientConfigFile {
    /// Local SOCKS5 listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Relay WebSocket endpoint
    pub url: String,
    /// Identity token
    pub uuid: String,
    /// Number of tunnels
    #[serde(default = "default_tunnel_count")]
    pub tunnel_count: usize,
    /// Flow table capacity
    #[serde(default = "default_flow_capacity")]
    pub flow_capacity: usize,
    /// Keepalive interval (seconds)
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_interval_secs: u64,
    /// Unanswered pings tolerated before force-close
    #[serde(default = "default_max_missed_pongs")]
    pub max_missed_pongs: u32,
    /// Wait after a failed dial (seconds)
    #[serde(default = "default_dial_retry_secs")]
    pub dial_retry_delay_secs: u64,
    /// Wait after a broken tunnel (seconds)
    #[serde(default = "default_reconnect_secs")]
    pub reconnect_delay_secs: u64,
    /// Local socket write deadline (milliseconds)
    #[serde(default = "default_write_timeout_ms")]
    pub local_write_timeout_ms: u64,
    /// Tunnel write deadline (seconds)
    #[serde(default = "default_tunnel_write_secs")]
    pub tunnel_write_timeout_secs: u64,
    /// Drained segments between quota reports
    #[serde(default = "default_quota_threshold")]
    pub quota_threshold: u16,
    /// Tunnel connect deadline (seconds)
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}

fn default_tunnel_count() -> usize {
    DEFAULT_TUNNEL_COUNT
}

fn default_flow_capacity() -> usize {
    DEFAULT_FLOW_CAPACITY
}

fn default_keepalive_secs() -> u64 {
    30
}

fn default_max_missed_pongs() -> u32 {
    3
}

fn default_dial_retry_secs() -> u64 {
    10
}

fn default_reconnect_secs() -> u64 {
    15
}

fn default_write_timeout_ms() -> u64 {
    1000
}

fn default_tunnel_write_secs() -> u64 {
    10
}

fn default_quota_threshold() -> u16 {
    DEFAULT_QUOTA_THRESHOLD
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl ClientConfigFile {
    /// Convert to runtime configuration.
    pub fn to_config(&self) -> Result<ClientConfig> {
        let config = ClientConfig {
            listen_addr: self.listen_addr.clone(),
            url: self.url.clone(),
            uuid: self.uuid.clone(),
            tunnel_count: self.tunnel_count,
            flow_capacity: self.flow_capacity,
            keepalive_interval: Duration::from_secs(self.keepalive_interval_secs),
            max_missed_pongs: self.max_missed_pongs,
            dial_retry_delay: Duration::from_secs(self.dial_retry_delay_secs),
            reconnect_delay: Duration::from_secs(self.reconnect_delay_secs),
            local_write_timeout: Duration::from_millis(self.local_write_timeout_ms),
            tunnel_write_timeout: Duration::from_secs(self.tunnel_write_timeout_secs),
            quota_threshold: self.quota_threshold,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        };
        config.validate()?;
        Ok(config)
    }

    /// Create from runtime configuration.
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            listen_addr: config.listen_addr.clone(),
            url: config.url.clone(),
            uuid: config.uuid.clone(),
            tunnel_count: config.tunnel_count,
            flow_capacity: config.flow_capacity,
            keepalive_interval_secs: config.keepalive_interval.as_secs(),
            max_missed_pongs: config.max_missed_pongs,
            dial_retry_delay_secs: config.dial_retry_delay.as_secs(),
            reconnect_delay_secs: config.reconnect_delay.as_secs(),
            local_write_timeout_ms: config.local_write_timeout.as_millis() as u64,
            tunnel_write_timeout_secs: config.tunnel_write_timeout.as_secs(),
            quota_threshold: config.quota_threshold,
            connect_timeout_secs: config.connect_timeout.as_secs(),
        }
    }
}
