use std::net::SocketAddr;

use serde::Deserialize;

use chanrelay_core::error::{RelayError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    pub version: u32,

    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub ops: OpsSection,
}

impl RelayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.version != 1 {
            return Err(RelayError::UnsupportedVersion(format!(
                "config version {}",
                self.version
            )));
        }

        self.server.validate()?;
        self.ops.validate()?;

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    /// Shared by the stream listener and the datagram socket.
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    #[serde(default = "default_welcome_message")]
    pub welcome_message: String,

    #[serde(default = "default_true")]
    pub channel_listing: bool,

    /// Largest payload accepted in one stream frame.
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            ping_interval_ms: default_ping_interval_ms(),
            welcome_message: default_welcome_message(),
            channel_listing: true,
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

impl ServerSection {
    pub fn validate(&self) -> Result<()> {
        parse_addr("server.listen", &self.listen)?;
        if !(1000..=120000).contains(&self.ping_interval_ms) {
            return Err(RelayError::BadConfig(
                "server.ping_interval_ms must be between 1000 and 120000".into(),
            ));
        }
        if !(256..=16_777_216).contains(&self.max_message_bytes) {
            return Err(RelayError::BadConfig(
                "server.max_message_bytes must be between 256 and 16777216".into(),
            ));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        parse_addr("server.listen", &self.listen)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpsSection {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_ops_listen")]
    pub listen: String,
}

impl Default for OpsSection {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_ops_listen(),
        }
    }
}

impl OpsSection {
    pub fn validate(&self) -> Result<()> {
        if self.enabled {
            parse_addr("ops.listen", &self.listen)?;
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        parse_addr("ops.listen", &self.listen)
    }
}

fn parse_addr(field: &str, s: &str) -> Result<SocketAddr> {
    s.parse()
        .map_err(|_| RelayError::BadConfig(format!("{field} must be a socket address, got {s:?}")))
}

fn default_listen() -> String {
    "0.0.0.0:6121".into()
}
fn default_ping_interval_ms() -> u64 {
    5000
}
fn default_welcome_message() -> String {
    format!("chanrelay {}", env!("CARGO_PKG_VERSION"))
}
fn default_true() -> bool {
    true
}
fn default_max_message_bytes() -> usize {
    1024 * 1024
}
fn default_ops_listen() -> String {
    "127.0.0.1:9121".into()
}
