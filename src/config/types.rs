//! Configuration Types

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::output::OutputMode;
use crate::relay::{DEFAULT_READ_CHUNK_SIZE, DEFAULT_TICK_INTERVAL};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub adaptor: AdaptorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Relay endpoints and pump timing
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdaptorConfig {
    pub listen_addr: SocketAddr,
    pub target_addr: SocketAddr,
    #[serde(with = "humantime_serde", default = "default_tick_interval")]
    pub tick_interval: Duration,
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
}

/// Logging and traffic rendering
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub output: OutputMode,
}

fn default_tick_interval() -> Duration {
    DEFAULT_TICK_INTERVAL
}

fn default_read_chunk_size() -> usize {
    DEFAULT_READ_CHUNK_SIZE
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: OutputMode::None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            adaptor: AdaptorConfig {
                listen_addr: "127.0.0.1:8000".parse().unwrap(),
                target_addr: "127.0.0.1:9000".parse().unwrap(),
                tick_interval: DEFAULT_TICK_INTERVAL,
                read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            },
            logging: LoggingConfig::default(),
        }
    }
}
