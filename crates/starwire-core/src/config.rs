/*!
 * Configuration management for starwire.
 *
 * This module provides functionality to load, validate, and access the
 * process-wide settings shared by every device a driver process hosts.
 */
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Process configuration for starwire drivers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Device loop configuration
    #[serde(default)]
    pub driver: DriverConfig,

    /// Serial connection defaults
    #[serde(default)]
    pub serial: SerialConfig,

    /// TCP connection defaults
    #[serde(default)]
    pub tcp: TcpConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Directory holding the per-device configuration records
    #[serde(default = "default_config_dir")]
    pub config_dir: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to use JSON format for logs
    #[serde(default)]
    pub json_format: bool,

    /// Whether to include the event target in each line
    #[serde(default = "default_true")]
    pub with_target: bool,
}

/// Device loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Default polling period in milliseconds
    #[serde(default = "default_polling_period_ms")]
    pub polling_period_ms: u64,

    /// Upper bound for a whole connect attempt, handshake included
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Capacity of the queue carrying worker results back to the loop
    #[serde(default = "default_worker_queue")]
    pub worker_queue: usize,
}

/// Serial connection defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Port used when no configuration has been saved yet
    #[serde(default = "default_serial_port")]
    pub default_port: String,

    /// Baud rate used when no configuration has been saved yet
    #[serde(default = "default_baud")]
    pub default_baud: u32,

    /// Whether port auto-search starts enabled
    #[serde(default = "default_true")]
    pub auto_search: bool,

    /// Lower bound of the randomized backoff between port attempts
    #[serde(default = "default_backoff_min_ms")]
    pub backoff_min_ms: u64,

    /// Upper bound of the randomized backoff between port attempts
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Read/write timeout applied to opened ports
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,

    /// Name fragments a port must contain to be an auto-search candidate
    #[serde(default = "default_candidate_filters")]
    pub candidate_filters: Vec<String>,
}

/// TCP connection defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    /// Default remote host
    #[serde(default = "default_tcp_host")]
    pub default_host: String,

    /// Default remote port
    #[serde(default = "default_tcp_port")]
    pub default_port: u16,

    /// Connect and I/O timeout
    #[serde(default = "default_io_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            config_dir: default_config_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
            with_target: true,
        }
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            polling_period_ms: default_polling_period_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            worker_queue: default_worker_queue(),
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            default_port: default_serial_port(),
            default_baud: default_baud(),
            auto_search: true,
            backoff_min_ms: default_backoff_min_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            io_timeout_ms: default_io_timeout_ms(),
            candidate_filters: default_candidate_filters(),
        }
    }
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            default_host: default_tcp_host(),
            default_port: default_tcp_port(),
            timeout_ms: default_io_timeout_ms(),
        }
    }
}

impl Config {
    /// Check cross-field constraints the deserializer cannot express
    pub fn validate(&self) -> Result<()> {
        if self.serial.backoff_min_ms > self.serial.backoff_max_ms {
            return Err(Error::config(format!(
                "serial.backoff_min_ms ({}) exceeds serial.backoff_max_ms ({})",
                self.serial.backoff_min_ms, self.serial.backoff_max_ms
            )));
        }
        if self.driver.worker_queue == 0 {
            return Err(Error::config("driver.worker_queue must be at least 1"));
        }
        if self.serial.io_timeout_ms == 0 || self.tcp.timeout_ms == 0 {
            return Err(Error::config("I/O timeouts must be non-zero"));
        }
        Ok(())
    }

    /// Directory holding per-device configuration records
    pub fn config_dir(&self) -> PathBuf {
        PathBuf::from(&self.general.config_dir)
    }
}

impl SerialConfig {
    /// Read/write timeout for opened ports
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

impl DriverConfig {
    /// Default polling period
    pub fn polling_period(&self) -> Duration {
        Duration::from_millis(self.polling_period_ms)
    }

    /// Upper bound for a whole connect attempt
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_app_name() -> String {
    "starwire".to_string()
}

fn default_config_dir() -> String {
    "./.starwire".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_polling_period_ms() -> u64 {
    1000
}

fn default_connect_timeout_ms() -> u64 {
    30_000
}

fn default_worker_queue() -> usize {
    64
}

fn default_serial_port() -> String {
    if cfg!(target_os = "macos") {
        "/dev/cu.usbserial".to_string()
    } else if cfg!(windows) {
        "COM1".to_string()
    } else {
        "/dev/ttyUSB0".to_string()
    }
}

fn default_baud() -> u32 {
    9600
}

fn default_backoff_min_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    1500
}

fn default_io_timeout_ms() -> u64 {
    2000
}

fn default_candidate_filters() -> Vec<String> {
    if cfg!(target_os = "macos") {
        vec!["usbserial".to_string(), "usbmodem".to_string()]
    } else if cfg!(windows) {
        vec!["COM".to_string()]
    } else {
        vec![
            "ttyUSB".to_string(),
            "ttyACM".to_string(),
            "rfcomm".to_string(),
        ]
    }
}

fn default_tcp_host() -> String {
    "localhost".to_string()
}

fn default_tcp_port() -> u16 {
    9999
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
    override_with: Option<Config>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Override with an existing config
    pub fn override_with(mut self, config: Config) -> Self {
        self.override_with = Some(config);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<Config> {
        if let Some(config) = self.override_with {
            config.validate()?;
            return Ok(config);
        }

        let mut config_builder = ConfigLib::builder();

        let default_config = Config::default();
        config_builder = config_builder.add_source(
            ConfigLib::try_from(&default_config)
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::from(path));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config_lib = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?;

        let config: Config = config_lib
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        config.validate()?;

        info!("Configuration loaded successfully");
        Ok(config)
    }
}

/// A thread-safe reference to a configuration
#[derive(Debug, Clone)]
pub struct SharedConfig(Arc<Config>);

impl SharedConfig {
    /// Create a new SharedConfig
    pub fn new(config: Config) -> Self {
        Self(Arc::new(config))
    }

    /// Get a reference to the config
    pub fn get(&self) -> &Config {
        &self.0
    }
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl From<Config> for SharedConfig {
    fn from(config: Config) -> Self {
        Self::new(config)
    }
}

impl AsRef<Config> for SharedConfig {
    fn as_ref(&self) -> &Config {
        self.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.app_name, "starwire");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.driver.polling_period_ms, 1000);
        assert_eq!(config.serial.default_baud, 9600);
        assert_eq!(config.serial.backoff_min_ms, 500);
        assert_eq!(config.serial.backoff_max_ms, 1500);
        assert!(config.serial.auto_search);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder_defaults() {
        let config = ConfigBuilder::new().build().unwrap();
        assert_eq!(config.general.app_name, "starwire");
        assert_eq!(config.tcp.default_host, "localhost");
    }

    #[test]
    fn test_config_builder_with_file() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("starwire.toml");

        {
            let mut file = File::create(&file_path)?;
            file.write_all(
                br#"
                [general]
                config_dir = "/var/lib/starwire"

                [serial]
                default_baud = 115200
                auto_search = false

                [logging]
                level = "debug"
            "#,
            )?;
        }

        let config = ConfigBuilder::new().with_config_file(&file_path).build()?;

        assert_eq!(config.general.config_dir, "/var/lib/starwire");
        assert_eq!(config.serial.default_baud, 115200);
        assert!(!config.serial.auto_search);
        assert_eq!(config.logging.level, "debug");
        // untouched sections keep their defaults
        assert_eq!(config.serial.backoff_max_ms, 1500);

        Ok(())
    }

    #[test]
    fn test_config_builder_with_env() -> Result<()> {
        env::set_var("STARWIRECFGTEST__DRIVER__POLLING_PERIOD_MS", "250");
        env::set_var("STARWIRECFGTEST__LOGGING__LEVEL", "trace");

        let config = ConfigBuilder::new()
            .with_environment_prefix("starwirecfgtest")
            .build()?;

        assert_eq!(config.driver.polling_period_ms, 250);
        assert_eq!(config.logging.level, "trace");

        env::remove_var("STARWIRECFGTEST__DRIVER__POLLING_PERIOD_MS");
        env::remove_var("STARWIRECFGTEST__LOGGING__LEVEL");

        Ok(())
    }

    #[test]
    fn test_inverted_backoff_is_rejected() {
        let mut config = Config::default();
        config.serial.backoff_min_ms = 2000;
        config.serial.backoff_max_ms = 100;

        let result = ConfigBuilder::new().override_with(config).build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_shared_config() {
        let shared = SharedConfig::new(Config::default());
        let shared2 = shared.clone();
        assert_eq!(shared2.get().general.app_name, "starwire");
        assert_eq!(shared.get().driver.polling_period(), Duration::from_millis(1000));
    }
}
