/// Configuration management for ruta
pub mod uri;

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::core::ServerAddress;

/// Main ruta configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Cluster discovery configuration
    pub cluster: ClusterConfig,
    /// Per-node connection pool configuration
    #[serde(default)]
    pub pool: PoolConfig,
    /// Node monitor configuration
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Server selection configuration
    #[serde(default)]
    pub selection: SelectionConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Cluster discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Seed list in `host:port` form
    pub seeds: Vec<String>,
    /// Replica set name; required for replica-set discovery
    #[serde(default)]
    pub replica_set: Option<String>,
    /// Application name sent in the handshake
    #[serde(default)]
    pub app_name: Option<String>,
    /// Retry reads once after a retryable error
    #[serde(default = "default_true")]
    pub retry_reads: bool,
    /// Retry writes tagged retryable once after a retryable error
    #[serde(default = "default_true")]
    pub retry_writes: bool,
    /// Talk to the single seed only, without discovering peers
    #[serde(default)]
    pub direct_connection: bool,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub credential: Option<CredentialConfig>,
}

/// TLS settings applied to every connection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TlsConfig {
    pub enabled: bool,
    /// PEM file with trusted CA certificates; system web roots when absent
    #[serde(default)]
    pub ca_file: Option<String>,
    /// PEM file holding the client certificate chain and private key
    #[serde(default)]
    pub cert_key_file: Option<String>,
}

/// Credentials attached to every operation connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialConfig {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Authentication database
    #[serde(default = "default_auth_source")]
    pub source: String,
    #[serde(default)]
    pub mechanism: Option<String>,
}

/// Connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_size: usize,
    pub min_size: usize,
    /// Idle connections older than this are closed; 0 disables the limit
    pub max_idle_time_ms: u64,
    pub wait_queue_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Read timeout on operation connections; 0 disables the limit
    pub socket_timeout_ms: u64,
}

/// Node monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub heartbeat_frequency_ms: u64,
    /// Shortest interval between two checks of the same node
    pub min_heartbeat_frequency_ms: u64,
    pub connect_timeout_ms: u64,
}

/// Server selection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    pub server_selection_timeout_ms: u64,
    /// Width of the latency window above the fastest candidate
    pub local_threshold_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
    /// Log to stdout
    pub stdout: bool,
    /// Log file path (optional)
    pub file: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_auth_source() -> String {
    "admin".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            seeds: vec!["127.0.0.1:27017".to_string()],
            replica_set: None,
            app_name: None,
            retry_reads: true,
            retry_writes: true,
            direct_connection: false,
            tls: TlsConfig::default(),
            credential: None,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            min_size: 0,
            max_idle_time_ms: 0,
            wait_queue_timeout_ms: 1000,
            connect_timeout_ms: 10_000,
            socket_timeout_ms: 0,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            heartbeat_frequency_ms: 10_000,
            min_heartbeat_frequency_ms: 500,
            connect_timeout_ms: 10_000,
        }
    }
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            server_selection_timeout_ms: 30_000,
            local_threshold_ms: 15,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            stdout: true,
            file: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster: ClusterConfig::default(),
            pool: PoolConfig::default(),
            monitor: MonitorConfig::default(),
            selection: SelectionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn max_idle_time(&self) -> Option<Duration> {
        non_zero_millis(self.max_idle_time_ms)
    }

    pub fn wait_queue_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_queue_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn socket_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.socket_timeout_ms)
    }
}

impl MonitorConfig {
    pub fn heartbeat_frequency(&self) -> Duration {
        Duration::from_millis(self.heartbeat_frequency_ms)
    }

    pub fn min_heartbeat_frequency(&self) -> Duration {
        Duration::from_millis(self.min_heartbeat_frequency_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl SelectionConfig {
    pub fn server_selection_timeout(&self) -> Duration {
        Duration::from_millis(self.server_selection_timeout_ms)
    }

    pub fn local_threshold(&self) -> Duration {
        Duration::from_millis(self.local_threshold_ms)
    }
}

fn non_zero_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from a `mongodb://` connection string
    pub fn from_uri(uri: &str) -> Result<Self, ConfigError> {
        let config = uri::parse(uri)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Parsed seed addresses, in configuration order
    pub fn seed_addresses(&self) -> Result<Vec<ServerAddress>, ConfigError> {
        let mut seeds: Vec<ServerAddress> = Vec::with_capacity(self.cluster.seeds.len());
        for seed in &self.cluster.seeds {
            let address = ServerAddress::parse(seed)
                .map_err(|e| ConfigError::ValidationError(format!("Invalid seed '{}': {}", seed, e)))?;
            if !seeds.contains(&address) {
                seeds.push(address);
            }
        }
        Ok(seeds)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate cluster config
        if self.cluster.seeds.is_empty() {
            return Err(ConfigError::ValidationError(
                "seeds cannot be empty".to_string(),
            ));
        }

        let seeds = self.seed_addresses()?;

        if self.cluster.direct_connection && seeds.len() != 1 {
            return Err(ConfigError::ValidationError(
                "direct_connection requires exactly one seed".to_string(),
            ));
        }

        if let Some(name) = &self.cluster.replica_set {
            if name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "replica_set cannot be empty".to_string(),
                ));
            }
        }

        if let Some(credential) = &self.cluster.credential {
            if credential.username.is_empty() {
                return Err(ConfigError::ValidationError(
                    "credential username cannot be empty".to_string(),
                ));
            }
        }

        if !self.cluster.tls.enabled
            && (self.cluster.tls.ca_file.is_some() || self.cluster.tls.cert_key_file.is_some())
        {
            return Err(ConfigError::ValidationError(
                "TLS files configured but TLS is disabled".to_string(),
            ));
        }

        // Validate pool config
        if self.pool.max_size == 0 {
            return Err(ConfigError::ValidationError(
                "pool max_size must be greater than 0".to_string(),
            ));
        }

        if self.pool.min_size > self.pool.max_size {
            return Err(ConfigError::ValidationError(
                "pool min_size cannot exceed max_size".to_string(),
            ));
        }

        if self.pool.connect_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "pool connect_timeout_ms must be greater than 0".to_string(),
            ));
        }

        // Validate monitor config
        if self.monitor.heartbeat_frequency_ms == 0 || self.monitor.min_heartbeat_frequency_ms == 0
        {
            return Err(ConfigError::ValidationError(
                "heartbeat frequencies must be greater than 0".to_string(),
            ));
        }

        if self.monitor.min_heartbeat_frequency_ms > self.monitor.heartbeat_frequency_ms {
            return Err(ConfigError::ValidationError(
                "min_heartbeat_frequency_ms cannot exceed heartbeat_frequency_ms".to_string(),
            ));
        }

        if self.monitor.connect_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "monitor connect_timeout_ms must be greater than 0".to_string(),
            ));
        }

        // Validate selection config
        if self.selection.server_selection_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "server_selection_timeout_ms must be greater than 0".to_string(),
            ));
        }

        // Validate logging config
        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P, mode: &str) -> Result<(), ConfigError> {
        let config = match mode {
            "replica-set" => Config {
                cluster: ClusterConfig {
                    seeds: vec![
                        "10.0.1.10:27017".to_string(),
                        "10.0.1.11:27017".to_string(),
                        "10.0.1.12:27017".to_string(),
                    ],
                    replica_set: Some("rs0".to_string()),
                    app_name: Some("ruta".to_string()),
                    ..Default::default()
                },
                ..Default::default()
            },
            "sharded" => Config {
                cluster: ClusterConfig {
                    seeds: vec![
                        "10.0.1.20:27017".to_string(),
                        "10.0.1.21:27017".to_string(),
                    ],
                    app_name: Some("ruta".to_string()),
                    ..Default::default()
                },
                ..Default::default()
            },
            "standalone" => Config {
                cluster: ClusterConfig {
                    seeds: vec!["127.0.0.1:27017".to_string()],
                    direct_connection: true,
                    ..Default::default()
                },
                ..Default::default()
            },
            _ => {
                return Err(ConfigError::ValidationError(
                    "Mode must be 'replica-set', 'sharded' or 'standalone'".to_string(),
                ))
            }
        };

        config.save_to_file(path)
    }
}

/// Configuration error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pool.max_size, 100);
        assert_eq!(config.monitor.heartbeat_frequency(), Duration::from_secs(10));
        assert_eq!(config.selection.local_threshold(), Duration::from_millis(15));
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.pool.max_size = 0;
        assert!(config.validate().is_err());

        config.pool.max_size = 2;
        config.pool.min_size = 3;
        assert!(config.validate().is_err());

        config.pool.min_size = 1;
        assert!(config.validate().is_ok());

        config.monitor.min_heartbeat_frequency_ms = 20_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_direct_connection_requires_single_seed() {
        let mut config = Config::default();
        config.cluster.seeds = vec!["a:1".to_string(), "b:2".to_string()];
        config.cluster.direct_connection = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_seed() {
        let mut config = Config::default();
        config.cluster.seeds = vec!["host:port".to_string()];
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_seed_addresses_are_deduplicated() {
        let mut config = Config::default();
        config.cluster.seeds = vec!["A:27017".to_string(), "a".to_string(), "b".to_string()];
        let seeds = config.seed_addresses().unwrap();
        assert_eq!(seeds.len(), 2);
        assert_eq!(seeds[0].to_string(), "a:27017");
    }

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [cluster]
            seeds = ["db1:27017", "db2:27017"]
            replica_set = "rs0"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_ok());
        assert!(config.cluster.retry_reads);
        assert_eq!(config.pool.wait_queue_timeout(), Duration::from_secs(1));
        assert_eq!(config.selection.server_selection_timeout_ms, 30_000);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed_config: Config = toml::from_str(&toml_str).unwrap();
        assert!(parsed_config.validate().is_ok());
    }

    #[test]
    fn test_config_file_operations() {
        let temp_file = NamedTempFile::new().unwrap();

        Config::create_example_config(temp_file.path(), "replica-set").unwrap();
        let loaded_config = Config::load_from_file(temp_file.path()).unwrap();
        assert_eq!(loaded_config.cluster.replica_set.as_deref(), Some("rs0"));
        assert_eq!(loaded_config.cluster.seeds.len(), 3);

        assert!(Config::create_example_config(temp_file.path(), "redis").is_err());
    }
}
