//! Configuration Manager

use super::Config;
use crate::output::OutputMode;
use crate::Result;
use anyhow::{bail, Context};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!(
                "Configuration file not found at {}, using defaults",
                path.display()
            );
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Config> {
        Self::load_from_vars(|key| std::env::var(key).ok())
    }

    /// Apply `RELAYTAP_*` overrides read through `lookup` on top of defaults
    pub fn load_from_vars<F>(lookup: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(addr) = lookup("RELAYTAP_LISTEN_ADDR") {
            config.adaptor.listen_addr = addr
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid RELAYTAP_LISTEN_ADDR: {}", addr))?;
        }

        if let Some(addr) = lookup("RELAYTAP_TARGET_ADDR") {
            config.adaptor.target_addr = addr
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid RELAYTAP_TARGET_ADDR: {}", addr))?;
        }

        if let Some(tick) = lookup("RELAYTAP_TICK_INTERVAL") {
            config.adaptor.tick_interval = humantime::parse_duration(&tick)
                .with_context(|| format!("Invalid RELAYTAP_TICK_INTERVAL: {}", tick))?;
        }

        if let Some(size) = lookup("RELAYTAP_READ_CHUNK_SIZE") {
            config.adaptor.read_chunk_size = size
                .parse::<usize>()
                .with_context(|| format!("Invalid RELAYTAP_READ_CHUNK_SIZE: {}", size))?;
        }

        if let Some(level) = lookup("RELAYTAP_LOG_LEVEL") {
            config.logging.level = level;
        }

        if let Some(output) = lookup("RELAYTAP_OUTPUT") {
            config.logging.output = OutputMode::from_arg(&output);
        }

        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_adaptor_config()
            .with_context(|| "Adaptor configuration validation failed")?;

        self.validate_logging_config()
            .with_context(|| "Logging configuration validation failed")?;

        Ok(())
    }

    fn validate_adaptor_config(&self) -> Result<()> {
        let adaptor = &self.adaptor;

        if adaptor.listen_addr == adaptor.target_addr && adaptor.listen_addr.port() != 0 {
            bail!(
                "listen_addr and target_addr must differ (both are {})",
                adaptor.listen_addr
            );
        }

        if adaptor.target_addr.port() == 0 {
            bail!("target_addr must name a concrete port");
        }

        if adaptor.tick_interval < Duration::from_millis(1) {
            bail!("tick_interval must be at least 1ms");
        }

        if adaptor.tick_interval > Duration::from_secs(1) {
            bail!("tick_interval cannot exceed 1s");
        }

        if adaptor.read_chunk_size < 64 {
            bail!("read_chunk_size must be at least 64 bytes");
        }

        if adaptor.read_chunk_size > 1048576 {
            bail!("read_chunk_size cannot exceed 1MB");
        }

        Ok(())
    }

    fn validate_logging_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.as_str()) {
            bail!(
                "logging.level must be one of: {}",
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(
        &mut self,
        listen_ip: Option<IpAddr>,
        listen_port: Option<u16>,
        target: Option<SocketAddr>,
        tick_ms: Option<u64>,
        output: Option<OutputMode>,
    ) {
        if let Some(ip) = listen_ip {
            self.adaptor.listen_addr.set_ip(ip);
            tracing::info!("CLI override: listen ip set to {}", ip);
        }

        if let Some(port) = listen_port {
            self.adaptor.listen_addr.set_port(port);
            tracing::info!("CLI override: listen port set to {}", port);
        }

        if let Some(target) = target {
            self.adaptor.target_addr = target;
            tracing::info!("CLI override: target set to {}", target);
        }

        if let Some(tick_ms) = tick_ms {
            self.adaptor.tick_interval = Duration::from_millis(tick_ms);
            tracing::info!("CLI override: tick interval set to {}ms", tick_ms);
        }

        if let Some(output) = output {
            self.logging.output = output;
            tracing::info!("CLI override: output mode set to {:?}", output);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[adaptor]
listen_addr = "127.0.0.1:7000"
target_addr = "10.0.0.5:7001"
tick_interval = "5ms"

[logging]
level = "debug"
output = "binary"
"#
        )
        .unwrap();

        let config = ConfigManager::load_from_file(file.path()).unwrap();
        assert_eq!(config.adaptor.listen_addr, "127.0.0.1:7000".parse::<SocketAddr>().unwrap());
        assert_eq!(config.adaptor.target_addr, "10.0.0.5:7001".parse::<SocketAddr>().unwrap());
        assert_eq!(config.adaptor.tick_interval, Duration::from_millis(5));
        assert_eq!(config.adaptor.read_chunk_size, 1024);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.output, OutputMode::Binary);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigManager::load_from_file(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.adaptor.tick_interval, Duration::from_millis(10));
    }

    #[test]
    fn test_load_from_vars() {
        let config = ConfigManager::load_from_vars(vars(&[
            ("RELAYTAP_TARGET_ADDR", "192.168.1.10:502"),
            ("RELAYTAP_TICK_INTERVAL", "20ms"),
            ("RELAYTAP_OUTPUT", "s"),
        ]))
        .unwrap();

        assert_eq!(config.adaptor.target_addr, "192.168.1.10:502".parse::<SocketAddr>().unwrap());
        assert_eq!(config.adaptor.tick_interval, Duration::from_millis(20));
        assert_eq!(config.logging.output, OutputMode::String);
    }

    #[test]
    fn test_invalid_env_value_is_rejected() {
        let result = ConfigManager::load_from_vars(vars(&[("RELAYTAP_READ_CHUNK_SIZE", "lots")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.adaptor.tick_interval = Duration::from_secs(5);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.adaptor.read_chunk_size = 8;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.adaptor.target_addr = config.adaptor.listen_addr;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = Config::default();
        config.merge_with_cli_args(
            Some("0.0.0.0".parse().unwrap()),
            Some(15000),
            Some("10.1.1.1:80".parse().unwrap()),
            Some(25),
            Some(OutputMode::Binary),
        );

        assert_eq!(config.adaptor.listen_addr, "0.0.0.0:15000".parse::<SocketAddr>().unwrap());
        assert_eq!(config.adaptor.target_addr, "10.1.1.1:80".parse::<SocketAddr>().unwrap());
        assert_eq!(config.adaptor.tick_interval, Duration::from_millis(25));
        assert_eq!(config.logging.output, OutputMode::Binary);
    }

    #[test]
    fn test_config_file_listen_ip_survives_port_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[adaptor]
listen_addr = "0.0.0.0:7000"
target_addr = "10.0.0.5:7001"
"#
        )
        .unwrap();

        let mut config = ConfigManager::load_from_file(file.path()).unwrap();
        config.merge_with_cli_args(
            None,
            Some(7000),
            Some("10.0.0.5:7001".parse().unwrap()),
            None,
            None,
        );

        assert_eq!(config.adaptor.listen_addr, "0.0.0.0:7000".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_env_listen_ip_survives_port_override() {
        let mut config =
            ConfigManager::load_from_vars(vars(&[("RELAYTAP_LISTEN_ADDR", "0.0.0.0:8000")])).unwrap();
        config.merge_with_cli_args(None, Some(8100), None, None, None);

        assert_eq!(config.adaptor.listen_addr, "0.0.0.0:8100".parse::<SocketAddr>().unwrap());
    }
}
