use error::ConfigError;
use opal_transport::{FlowConfig, SocketType};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub mod error;

const CONFIG_FILE_NAME: &str = "opald.toml";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    pub network: NetworkConfig,
    pub transport: TransportConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NetworkConfig {
    pub address: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TransportConfig {
    /// Payload bytes per data packet.
    pub mss: usize,
    /// Send and receive buffer sizes in bytes.
    pub send_buffer: usize,
    pub recv_buffer: usize,
    /// Outgoing bandwidth cap in bytes/second; 0 means unlimited.
    pub max_bandwidth: u64,
    /// Seconds to wait for queued data on close.
    pub linger_secs: u64,
    /// Accept frame-aware media flows instead of byte streams.
    pub media: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:9000".to_string(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mss: 1500,
            send_buffer: 12 * 1024 * 1024,
            recv_buffer: 12 * 1024 * 1024,
            max_bandwidth: 0,
            linger_secs: 3,
            media: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if SocketAddr::from_str(&self.network.address).is_err() {
            return Err(ConfigError::Validation {
                reason: format!(
                    "Invalid network address format: '{}'. Expected format like 'IP:PORT'.",
                    self.network.address
                ),
            });
        }

        if self.transport.mss < 64 {
            return Err(ConfigError::Validation {
                reason: format!("MSS {} is too small.", self.transport.mss),
            });
        }

        if self.transport.send_buffer < self.transport.mss
            || self.transport.recv_buffer < self.transport.mss
        {
            return Err(ConfigError::Validation {
                reason: "Buffers must hold at least one packet.".to_string(),
            });
        }

        Ok(())
    }

    /// The per-flow settings handed to the transport.
    pub fn flow_config(&self) -> FlowConfig {
        FlowConfig {
            mss: self.transport.mss,
            snd_buf_bytes: self.transport.send_buffer,
            rcv_buf_bytes: self.transport.recv_buffer,
            max_bandwidth: self.transport.max_bandwidth,
            linger: Duration::from_secs(self.transport.linger_secs),
            socket_type: if self.transport.media {
                SocketType::Media
            } else {
                SocketType::Stream
            },
            ..Default::default()
        }
    }
}

pub fn handle() -> Result<Config, ConfigError> {
    let config_path = PathBuf::from(CONFIG_FILE_NAME);
    if config_path.exists() {
        let config_content = fs::read_to_string(&config_path).map_err(|source| ConfigError::Io {
            path: config_path.display().to_string(),
            source,
        })?;
        let config: Config =
            toml::from_str(&config_content).map_err(|source| ConfigError::TomlDeserialization {
                path: config_path.display().to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    } else {
        let config = Config::default();
        save(&config, &config_path)?;
        Ok(config)
    }
}

fn save(config: &Config, path: &Path) -> Result<(), ConfigError> {
    let config_content =
        toml::to_string_pretty(config).map_err(|source| ConfigError::TomlSerialization {
            path: path.display().to_string(),
            source,
        })?;
    let mut file = fs::File::create(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    file.write_all(config_content.as_bytes())
        .map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
    Ok(())
}
