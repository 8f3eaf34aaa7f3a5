//! Per-event publish pipeline.
//!
//! Formats the event, ensures a connection, drains the retry buffer in FIFO
//! order and publishes the new message. Transient failures buffer the message
//! and tear the connection down so the next event reconnects.

mod buffer;

pub use buffer::{OverflowPolicy, RetryBuffer};

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::broker::{
    Broker, BrokerError, ConnectionManager, ConnectionState, DeliveryMode, MessageProperties,
    ShutdownReason,
};
use crate::codec::{self, CodecError, Compression};
use crate::config::Config;
use crate::envelope::{EnvelopeBuilder, EnvelopeOptions, FormatError};
use crate::event::LogEvent;
use crate::layout::Layout;

/// Content type for plain text bodies.
pub const CONTENT_TYPE_TEXT: &str = "text/plain";
/// Content type for structured envelopes.
pub const CONTENT_TYPE_JSON: &str = "application/json";
/// Content encoding sent with every message.
pub const CONTENT_ENCODING: &str = "utf8";
/// Placeholder in the topic template replaced by the level name.
pub const LEVEL_PLACEHOLDER: &str = "{0}";

/// A formatted message ready for the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub payload: Vec<u8>,
    pub properties: MessageProperties,
    pub routing_key: String,
}

/// Outcome of a failed publish.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Broker not connected (buffered: {buffered})")]
    NotConnected { buffered: bool },

    #[error("Delivery failed (buffered: {buffered}): {source}")]
    Transient {
        #[source]
        source: BrokerError,
        buffered: bool,
    },

    #[error("Broker error: {0}")]
    Broker(BrokerError),
}

impl PublishError {
    /// Whether the message was kept in the retry buffer.
    pub fn is_buffered(&self) -> bool {
        match self {
            PublishError::NotConnected { buffered } | PublishError::Transient { buffered, .. } => {
                *buffered
            }
            _ => false,
        }
    }

    /// Misconfiguration rather than broker unavailability.
    pub fn is_configuration(&self) -> bool {
        matches!(self, PublishError::Configuration(_))
    }
}

impl From<FormatError> for PublishError {
    fn from(error: FormatError) -> Self {
        match error {
            FormatError::Configuration(msg) => PublishError::Configuration(msg),
            FormatError::Serialization(e) => PublishError::Serialization(e.to_string()),
        }
    }
}

impl From<CodecError> for PublishError {
    fn from(error: CodecError) -> Self {
        match error {
            CodecError::Unsupported(_) => PublishError::Configuration(error.to_string()),
            CodecError::Io(e) => PublishError::Serialization(e.to_string()),
        }
    }
}

/// Routing and metadata settings for [`Publisher`].
pub struct PublisherSettings {
    /// Routing key template.
    pub topic: Arc<dyn Layout>,
    /// Application id; the logger name when `None`.
    pub app_id: Option<String>,
    pub user_id: Option<String>,
    pub delivery_mode: DeliveryMode,
    pub compression: Compression,
    pub max_buffer: usize,
    pub overflow: OverflowPolicy,
}

/// Publishes log events to the broker exchange.
///
/// Safe to share between tasks; `publish` may run concurrently.
pub struct Publisher {
    connection: ConnectionManager,
    envelope: EnvelopeBuilder,
    settings: PublisherSettings,
    unsent: Mutex<RetryBuffer>,
}

impl Publisher {
    /// Build a publisher from configuration.
    pub fn new(broker: Arc<dyn Broker>, config: &Config) -> Result<Self, PublishError> {
        let target = &config.target;
        let envelope = EnvelopeBuilder::new(
            Arc::new(target.layout.clone()),
            target.static_fields()?,
            EnvelopeOptions {
                structured: target.use_json,
                layout_as_message: target.use_layout_as_message,
                source_scheme: target.source_scheme.clone(),
                source_host: target.resolve_source_host(),
            },
        );
        let settings = PublisherSettings {
            topic: Arc::new(target.topic.clone()),
            app_id: target.app_id.clone(),
            user_id: Some(config.broker.username.clone()).filter(|u| !u.is_empty()),
            delivery_mode: target.delivery_mode,
            compression: target.compression.clone(),
            max_buffer: target.max_buffer,
            overflow: target.overflow,
        };
        let connection = ConnectionManager::new(broker, config.broker.connection_settings());

        Ok(Self::from_parts(connection, envelope, settings))
    }

    /// Build a publisher from already constructed components, e.g. with a
    /// custom [`Layout`].
    pub fn from_parts(
        connection: ConnectionManager,
        envelope: EnvelopeBuilder,
        settings: PublisherSettings,
    ) -> Self {
        let unsent = RetryBuffer::new(settings.max_buffer, settings.overflow);
        Self {
            connection,
            envelope,
            settings,
            unsent: Mutex::new(unsent),
        }
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Open the connection ahead of the first event.
    pub async fn start(&self) -> ConnectionState {
        self.connection.connect().await
    }

    /// Routing key: rendered topic with the level placeholder substituted.
    pub fn routing_key(&self, event: &LogEvent) -> String {
        self.settings
            .topic
            .render(event)
            .replace(LEVEL_PLACEHOLDER, event.level.name())
    }

    /// Broker metadata for an event.
    pub fn properties(&self, event: &LogEvent) -> MessageProperties {
        let content_type = if self.envelope.is_structured() {
            CONTENT_TYPE_JSON
        } else {
            CONTENT_TYPE_TEXT
        };
        MessageProperties {
            content_type: content_type.to_string(),
            content_encoding: CONTENT_ENCODING.to_string(),
            app_id: self
                .settings
                .app_id
                .clone()
                .unwrap_or_else(|| event.logger.clone()),
            timestamp: event.epoch_seconds(),
            user_id: self.settings.user_id.clone(),
            delivery_mode: self.settings.delivery_mode.as_byte(),
        }
    }

    /// Format, compress and address an event. No broker interaction.
    pub fn format(&self, event: &LogEvent) -> Result<PendingMessage, PublishError> {
        let body = self.envelope.build(event)?;
        let payload = codec::compress(body, &self.settings.compression)?;
        Ok(PendingMessage {
            payload,
            properties: self.properties(event),
            routing_key: self.routing_key(event),
        })
    }

    /// Publish one event.
    ///
    /// Configuration and serialization errors are returned without touching
    /// the broker. Delivery failures buffer the message (capacity permitting)
    /// and are reported with `buffered` set accordingly.
    #[tracing::instrument(name = "publisher.publish", skip_all, fields(logger = %event.logger, level = %event.level))]
    pub async fn publish(&self, event: &LogEvent) -> Result<(), PublishError> {
        let message = self.format(event)?;

        if !self.connection.is_open() {
            self.connection.connect().await;
        }

        if !self.connection.is_open() {
            let buffered = self.unsent.lock().await.push(message);
            debug!(buffered, "broker not connected");
            return Err(PublishError::NotConnected { buffered });
        }

        let mut unsent = self.unsent.lock().await;

        if let Err(error) = self.flush_unsent(&mut unsent).await {
            let buffered = unsent.push(message);
            drop(unsent);
            return Err(self.fail(error, buffered).await);
        }

        match self.send(&message).await {
            Ok(()) => Ok(()),
            Err(error) if error.is_transient() => {
                let buffered = unsent.push(message);
                drop(unsent);
                Err(self.fail(error, buffered).await)
            }
            Err(error) => {
                drop(unsent);
                Err(self.fail(error, false).await)
            }
        }
    }

    /// Publish and report the outcome through `continuation`, which is
    /// invoked exactly once.
    pub async fn write<F>(&self, event: &LogEvent, continuation: F)
    where
        F: FnOnce(Result<(), PublishError>),
    {
        continuation(self.publish(event).await);
    }

    /// Number of messages waiting in the retry buffer.
    pub async fn buffered_len(&self) -> usize {
        self.unsent.lock().await.len()
    }

    /// Snapshot of the retry buffer, oldest first.
    pub async fn pending(&self) -> Vec<PendingMessage> {
        self.unsent.lock().await.iter().cloned().collect()
    }

    /// Close the broker connection. Buffered messages are lost.
    pub async fn close(&self) {
        let pending = self.buffered_len().await;
        if pending > 0 {
            warn!(pending, "closing publisher with undelivered messages");
        }
        self.connection.shutdown(ShutdownReason::closing()).await;
    }

    /// Replay buffered messages oldest first. Only transient errors stop the
    /// drain; messages the broker rejects are dropped.
    async fn flush_unsent(&self, unsent: &mut RetryBuffer) -> Result<(), BrokerError> {
        while let Some(pending) = unsent.front() {
            info!(
                routing_key = %pending.routing_key,
                bytes = pending.payload.len(),
                "publishing unsent message"
            );
            match self.send(pending).await {
                Ok(()) => {}
                Err(error) if error.is_transient() => return Err(error),
                Err(error) => {
                    warn!(
                        error = %error,
                        routing_key = %pending.routing_key,
                        "dropping unsent message rejected by broker"
                    );
                }
            }
            unsent.pop_front();
        }
        Ok(())
    }

    async fn send(&self, message: &PendingMessage) -> Result<(), BrokerError> {
        self.connection
            .publish(&message.routing_key, &message.payload, &message.properties)
            .await
    }

    async fn fail(&self, error: BrokerError, buffered: bool) -> PublishError {
        if error.is_transient() {
            warn!(error = %error, buffered, "could not talk to broker, reconnecting on next event");
            self.connection.shutdown(ShutdownReason::unreachable()).await;
            PublishError::Transient {
                source: error,
                buffered,
            }
        } else {
            error!(error = %error, "publish rejected by broker");
            PublishError::Broker(error)
        }
    }
}
