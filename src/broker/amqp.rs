//! AMQP (RabbitMQ) broker client.
//!
//! Publishes to a topic exchange over a single lapin connection. Connection
//! errors reported by lapin are forwarded to the shutdown hook.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lapin::{
    options::{BasicPublishOptions, ExchangeDeclareOptions},
    tcp::{OwnedIdentity, OwnedTLSConfig},
    types::FieldTable,
    uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tracing::{debug, warn};

use super::{
    Broker, BrokerChannel, BrokerConnection, BrokerError, MessageProperties, Result,
    ShutdownHook, ShutdownInitiator, ShutdownReason, CHANNEL_ERROR, CONNECTION_FORCED,
};
use crate::config::{BrokerConfig, ConfigError};

/// Connection name reported to the broker.
const CONNECTION_NAME: &str = "logrelay";

/// Upper bound on a whole connect attempt (TCP, TLS and AMQP handshake), as a
/// multiple of the configured connect timeout. A background attempt always
/// settles within this bound.
const HANDSHAKE_TIMEOUT_FACTOR: u64 = 10;

/// Broker client backed by lapin.
pub struct LapinBroker {
    uri: AMQPUri,
    cert_chain: Option<String>,
    identity: Option<OwnedIdentity>,
    handshake_timeout: Duration,
}

impl LapinBroker {
    /// Create a client for the configured broker. Reads the CA chain and the
    /// client certificate eagerly.
    pub fn new(config: &BrokerConfig) -> std::result::Result<Self, ConfigError> {
        let cert_chain = match &config.tls.ca_cert_path {
            Some(path) => Some(
                std::fs::read_to_string(path).map_err(|source| read_error(path, source))?,
            ),
            None => None,
        };

        let identity = match &config.tls.client_cert_path {
            Some(path) => Some(OwnedIdentity {
                der: std::fs::read(path).map_err(|source| read_error(path, source))?,
                password: config.tls.client_cert_passphrase.clone(),
            }),
            None => None,
        };

        Ok(Self {
            uri: build_uri(config),
            cert_chain,
            identity,
            handshake_timeout: handshake_timeout(config),
        })
    }

    pub fn uri(&self) -> &AMQPUri {
        &self.uri
    }

    fn tls_config(&self) -> OwnedTLSConfig {
        OwnedTLSConfig {
            identity: self.identity.as_ref().map(|identity| OwnedIdentity {
                der: identity.der.clone(),
                password: identity.password.clone(),
            }),
            cert_chain: self.cert_chain.clone(),
        }
    }
}

fn read_error(path: &Path, source: std::io::Error) -> ConfigError {
    ConfigError::Read {
        path: path.display().to_string(),
        source,
    }
}

fn handshake_timeout(config: &BrokerConfig) -> Duration {
    Duration::from_millis(
        config
            .connect_timeout_ms
            .saturating_mul(HANDSHAKE_TIMEOUT_FACTOR),
    )
}

fn build_uri(config: &BrokerConfig) -> AMQPUri {
    AMQPUri {
        scheme: if config.tls.enabled {
            AMQPScheme::AMQPS
        } else {
            AMQPScheme::AMQP
        },
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: config.username.clone(),
                password: config.password.clone(),
            },
            host: config.host.clone(),
            port: config.port,
        },
        vhost: config.virtual_host.clone(),
        query: AMQPQueryString {
            heartbeat: config.heartbeat_secs,
            connection_timeout: Some(handshake_timeout(config).as_millis() as u64),
            ..Default::default()
        },
    }
}

fn map_error(error: lapin::Error) -> BrokerError {
    match error {
        lapin::Error::IOError(e) => BrokerError::Io(e.to_string()),
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
            BrokerError::ChannelClosed
        }
        other => BrokerError::Protocol(other.to_string()),
    }
}

fn shutdown_reason(error: &lapin::Error) -> ShutdownReason {
    match error {
        lapin::Error::IOError(_) => {
            ShutdownReason::new(ShutdownInitiator::Library, CHANNEL_ERROR, error.to_string())
        }
        _ => ShutdownReason::new(ShutdownInitiator::Peer, CONNECTION_FORCED, error.to_string()),
    }
}

#[async_trait]
impl Broker for LapinBroker {
    async fn connect(&self, on_shutdown: ShutdownHook) -> Result<Arc<dyn BrokerConnection>> {
        let properties =
            ConnectionProperties::default().with_connection_name(CONNECTION_NAME.into());

        let connect =
            Connection::connect_uri_with_config(self.uri.clone(), properties, self.tls_config());

        let connection = tokio::time::timeout(self.handshake_timeout, connect)
            .await
            .map_err(|_| {
                BrokerError::Connection(format!(
                    "handshake not completed within {}ms",
                    self.handshake_timeout.as_millis()
                ))
            })?
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        connection.on_error(move |e| on_shutdown(shutdown_reason(&e)));

        debug!(
            host = %self.uri.authority.host,
            port = self.uri.authority.port,
            vhost = %self.uri.vhost,
            "AMQP connection opened"
        );

        Ok(Arc::new(LapinConnection { connection }))
    }
}

struct LapinConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self.connection.create_channel().await.map_err(map_error)?;
        Ok(Arc::new(LapinChannel { channel }))
    }

    async fn close(&self, reason: &ShutdownReason) -> Result<()> {
        self.connection
            .close(reason.reply_code, &reason.reply_text)
            .await
            .map_err(map_error)
    }

    fn abort(&self) {
        // lapin tears the socket down when the last handle is dropped.
        warn!("abandoning AMQP connection without close handshake");
    }
}

struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn declare_exchange(&self, exchange: &str, durable: bool) -> Result<()> {
        self.channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Declare(e.to_string()))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<()> {
        let mut props = BasicProperties::default()
            .with_content_type(properties.content_type.as_str().into())
            .with_content_encoding(properties.content_encoding.as_str().into())
            .with_app_id(properties.app_id.as_str().into())
            .with_timestamp(properties.timestamp)
            .with_delivery_mode(properties.delivery_mode);
        if let Some(user_id) = &properties.user_id {
            props = props.with_user_id(user_id.as_str().into());
        }

        // The returned confirmation is not awaited.
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    ..Default::default()
                },
                payload,
                props,
            )
            .await
            .map_err(map_error)?;

        Ok(())
    }

    async fn close(&self, reason: &ShutdownReason) -> Result<()> {
        self.channel
            .close(reason.reply_code, &reason.reply_text)
            .await
            .map_err(map_error)
    }
}
