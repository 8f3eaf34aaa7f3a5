//! Broker connection configuration types.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::broker::ConnectionSettings;

/// Default AMQP port.
pub const DEFAULT_AMQP_PORT: u16 = 5672;

/// Broker connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker host name.
    pub host: String,
    /// AMQP virtual host.
    pub virtual_host: String,
    /// User name; also sent as the message `user-id` property.
    pub username: String,
    pub password: String,
    pub port: u16,
    /// TLS settings.
    pub tls: TlsConfig,
    /// Requested heartbeat interval. `None` accepts the broker's value.
    pub heartbeat_secs: Option<u16>,
    /// Exchange messages are published to.
    pub exchange: String,
    /// Declare the exchange as durable.
    pub durable: bool,
    /// Skip exchange declaration and assume it already exists.
    pub passive: bool,
    /// How long a publish waits for a connect attempt before buffering.
    pub connect_timeout_ms: u64,
    /// How long a graceful close may take before the connection is aborted.
    pub close_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            virtual_host: "/".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            port: DEFAULT_AMQP_PORT,
            tls: TlsConfig::default(),
            heartbeat_secs: None,
            exchange: "logs".to_string(),
            durable: true,
            passive: false,
            connect_timeout_ms: 3000,
            close_timeout_ms: 1000,
        }
    }
}

impl BrokerConfig {
    /// Settings for the connection manager.
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            exchange: self.exchange.clone(),
            durable: self.durable,
            passive: self.passive,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            close_timeout: Duration::from_millis(self.close_timeout_ms),
        }
    }
}

/// TLS configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Connect with `amqps`.
    pub enabled: bool,
    /// PEM file with the CA chain used to verify the broker.
    pub ca_cert_path: Option<PathBuf>,
    /// PKCS#12 bundle with the client certificate and key.
    pub client_cert_path: Option<PathBuf>,
    /// Passphrase for `client_cert_path`.
    pub client_cert_passphrase: String,
}
