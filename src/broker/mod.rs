//! Broker client seam.
//!
//! This module contains:
//! - `Broker`, `BrokerConnection`, `BrokerChannel` traits: the protocol calls
//!   the publisher needs (connect, channel, declare, publish, close)
//! - `ConnectionManager`: connection lifecycle and state machine
//! - Implementations: AMQP (RabbitMQ via lapin), Mock

use std::sync::Arc;

use async_trait::async_trait;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod connection;
pub mod mock;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::LapinBroker;
pub use connection::{ConnectionManager, ConnectionSettings, ConnectionState};
pub use mock::MockBroker;

/// Reply code for a deliberate, normal close.
pub const REPLY_SUCCESS: u16 = 200;
/// Reply code used when the broker forced the connection closed.
pub const CONNECTION_FORCED: u16 = 320;
/// Reply code used when the publisher could not talk to the broker.
pub const CHANNEL_ERROR: u16 = 504;

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur talking to the broker.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Channel is closed")]
    ChannelClosed,

    #[error("Exchange declaration failed: {0}")]
    Declare(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl BrokerError {
    /// Whether a failed publish should be buffered and retried on a fresh
    /// connection.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Io(_) | BrokerError::ChannelClosed)
    }
}

/// Who initiated a shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownInitiator {
    Application,
    Library,
    Peer,
}

/// Why a connection is being, or was, closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReason {
    pub initiator: ShutdownInitiator,
    pub reply_code: u16,
    pub reply_text: String,
}

impl ShutdownReason {
    pub fn new(initiator: ShutdownInitiator, reply_code: u16, reply_text: impl Into<String>) -> Self {
        Self {
            initiator,
            reply_code,
            reply_text: reply_text.into(),
        }
    }

    /// Deliberate close by the application.
    pub fn closing() -> Self {
        Self::new(ShutdownInitiator::Application, REPLY_SUCCESS, "closing publisher")
    }

    /// Teardown after a failed publish.
    pub fn unreachable() -> Self {
        Self::new(
            ShutdownInitiator::Library,
            CHANNEL_ERROR,
            "Could not talk to broker",
        )
    }

    /// Whether the channel may still accept a close handshake. After a
    /// transport failure or a forced close it is already gone.
    pub fn channel_usable(&self) -> bool {
        !matches!(self.reply_code, CHANNEL_ERROR | CONNECTION_FORCED)
    }
}

/// Callback invoked when the broker or the transport closes a connection.
pub type ShutdownHook = Arc<dyn Fn(ShutdownReason) + Send + Sync>;

/// Delivery mode broker flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    #[default]
    NonPersistent,
    Persistent,
}

impl DeliveryMode {
    pub fn as_byte(&self) -> u8 {
        match self {
            DeliveryMode::NonPersistent => 1,
            DeliveryMode::Persistent => 2,
        }
    }
}

/// Per-message metadata sent alongside the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: String,
    pub content_encoding: String,
    pub app_id: String,
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
    pub user_id: Option<String>,
    pub delivery_mode: u8,
}

/// Entry point of a broker client.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a transport connection. `on_shutdown` must be called when the
    /// connection closes for any reason other than [`BrokerConnection::close`].
    async fn connect(&self, on_shutdown: ShutdownHook) -> Result<Arc<dyn BrokerConnection>>;
}

/// An open transport connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn is_open(&self) -> bool;

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    /// Graceful close handshake.
    async fn close(&self, reason: &ShutdownReason) -> Result<()>;

    /// Drop the connection without a handshake.
    fn abort(&self);
}

/// A channel on an open connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn is_open(&self) -> bool;

    /// Declare a topic exchange.
    async fn declare_exchange(&self, exchange: &str, durable: bool) -> Result<()>;

    /// Publish with the mandatory flag set. Returns once the frame is handed
    /// to the transport; no delivery confirmation is awaited.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<()>;

    async fn close(&self, reason: &ShutdownReason) -> Result<()>;
}
