//! Application configuration.
//!
//! Aggregates broker and target configuration into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod broker;
mod target;

pub use broker::{BrokerConfig, TlsConfig, DEFAULT_AMQP_PORT};
pub use target::{FieldConfig, TargetConfig, DEFAULT_SOURCE_SCHEME, DEFAULT_TOPIC};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "logrelay.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "LOGRELAY_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "LOGRELAY";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "LOGRELAY_LOG";

use serde::Deserialize;

/// Errors loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker connection configuration.
    pub broker: BrokerConfig,
    /// Message formatting and buffering configuration.
    pub target: TargetConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `logrelay.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix, e.g.
    ///    `LOGRELAY__BROKER__HOST`
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that can never work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.host.is_empty() {
            return Err(ConfigError::Invalid("broker.host is empty".to_string()));
        }
        if self.broker.exchange.is_empty() {
            return Err(ConfigError::Invalid("broker.exchange is empty".to_string()));
        }
        if self.broker.tls.ca_cert_path.is_some() && !self.broker.tls.enabled {
            return Err(ConfigError::Invalid(
                "broker.tls.ca_cert_path is set but TLS is disabled".to_string(),
            ));
        }
        if self.broker.tls.client_cert_path.is_some() && !self.broker.tls.enabled {
            return Err(ConfigError::Invalid(
                "broker.tls.client_cert_path is set but TLS is disabled".to_string(),
            ));
        }
        self.target
            .static_fields()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(())
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        let mut config = Self::default();
        config.broker.connect_timeout_ms = 200;
        config.broker.close_timeout_ms = 100;
        config.target.source_host = Some("test-host".to_string());
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::DeliveryMode;
    use crate::codec::Compression;
    use crate::publisher::OverflowPolicy;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.broker.host, "localhost");
        assert_eq!(config.broker.port, 5672);
        assert_eq!(config.broker.virtual_host, "/");
        assert!(config.broker.durable);
        assert!(!config.broker.passive);
        assert_eq!(config.target.topic.source(), "logs.{0}");
        assert_eq!(config.target.layout.source(), "${message}");
        assert_eq!(config.target.compression, Compression::None);
        assert_eq!(config.target.overflow, OverflowPolicy::DropNewest);
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            r#"
broker:
  host: rabbit.internal
  port: 5671
  exchange: app-logs
  passive: true
  tls:
    enabled: true
target:
  topic: "app.${{logger}}.{{0}}"
  max_buffer: 2
  overflow: drop_oldest
  compression: gzip
  use_json: true
  delivery_mode: persistent
  fields:
    - name: service
      layout: billing
"#
        )
        .unwrap();

        let config = Config::load(Some(file.path().to_str().unwrap())).unwrap();

        assert_eq!(config.broker.host, "rabbit.internal");
        assert_eq!(config.broker.port, 5671);
        assert_eq!(config.broker.exchange, "app-logs");
        assert!(config.broker.passive);
        assert!(config.broker.tls.enabled);
        assert_eq!(config.target.topic.source(), "app.${logger}.{0}");
        assert_eq!(config.target.max_buffer, 2);
        assert_eq!(config.target.overflow, OverflowPolicy::DropOldest);
        assert_eq!(config.target.compression, Compression::Gzip);
        assert!(config.target.use_json);
        assert_eq!(config.target.delivery_mode, DeliveryMode::Persistent);
        assert_eq!(config.target.static_fields().unwrap().len(), 1);
    }

    #[test]
    #[serial]
    fn test_unknown_compression_loads() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "target:\n  compression: lz4").unwrap();

        let config = Config::load(Some(file.path().to_str().unwrap())).unwrap();

        assert_eq!(
            config.target.compression,
            Compression::Unsupported("lz4".to_string())
        );
    }

    #[test]
    #[serial]
    fn test_field_without_name_rejected() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "target:\n  fields:\n    - layout: x").unwrap();

        let result = Config::load(Some(file.path().to_str().unwrap()));

        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "broker:\n  host: from-file").unwrap();
        std::env::set_var("LOGRELAY__BROKER__HOST", "from-env");

        let config = Config::load(Some(file.path().to_str().unwrap()));
        std::env::remove_var("LOGRELAY__BROKER__HOST");

        assert_eq!(config.unwrap().broker.host, "from-env");
    }

    #[test]
    fn test_validate_rejects_ca_without_tls() {
        let mut config = Config::default();
        config.broker.tls.ca_cert_path = Some("/etc/ssl/ca.pem".into());

        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_client_cert_without_tls() {
        let mut config = Config::default();
        config.broker.tls.client_cert_path = Some("/etc/ssl/client.p12".into());

        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_resolve_source_host_prefers_config() {
        let config = Config::for_test();
        assert_eq!(config.target.resolve_source_host(), "test-host");
    }

    #[test]
    #[serial]
    fn test_resolve_source_host_skips_empty_candidates() {
        let saved_hostname = std::env::var("HOSTNAME").ok();
        let saved_computername = std::env::var("COMPUTERNAME").ok();

        let mut config = Config::default();
        config.target.source_host = Some(String::new());
        std::env::set_var("HOSTNAME", "");
        std::env::set_var("COMPUTERNAME", "win-host");
        let from_computername = config.target.resolve_source_host();

        std::env::set_var("HOSTNAME", "unix-host");
        let from_hostname = config.target.resolve_source_host();

        std::env::remove_var("HOSTNAME");
        std::env::remove_var("COMPUTERNAME");
        let fallback = config.target.resolve_source_host();

        for (name, saved) in [("HOSTNAME", saved_hostname), ("COMPUTERNAME", saved_computername)] {
            if let Some(value) = saved {
                std::env::set_var(name, value);
            }
        }

        assert_eq!(from_computername, "win-host");
        assert_eq!(from_hostname, "unix-host");
        assert_eq!(fallback, "localhost");
    }
}
