//! Connection lifecycle: bounded-time connect, exchange declaration,
//! shutdown detection and teardown.
//!
//! ```text
//! Closed --connect()--> Connecting --success--> Open
//! Connecting --failure/timeout--> Closed
//! Open --publish failure | broker shutdown | shutdown()--> Closed
//! ```
//!
//! Connect and shutdown are serialized by the session mutex. A connect
//! attempt runs as a spawned task; the caller waits at most the configured
//! timeout and then moves on while the attempt keeps running. Until that
//! attempt settles the state reads `Connecting` and no second attempt starts.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{
    Broker, BrokerChannel, BrokerConnection, BrokerError, MessageProperties, Result,
    ShutdownHook, ShutdownReason,
};

/// Lifecycle state of the logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
}

impl ConnectionState {
    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Closed => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Open => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Open,
            _ => ConnectionState::Closed,
        }
    }
}

/// Settings for [`ConnectionManager`].
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Exchange messages are published to.
    pub exchange: String,
    /// Declare the exchange as durable.
    pub durable: bool,
    /// Skip exchange declaration and assume it exists.
    pub passive: bool,
    /// Upper bound on how long `connect()` blocks its caller.
    pub connect_timeout: Duration,
    /// Upper bound on the graceful close handshake before aborting.
    pub close_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            exchange: "logs".to_string(),
            durable: true,
            passive: false,
            connect_timeout: Duration::from_secs(3),
            close_timeout: Duration::from_secs(1),
        }
    }
}

/// State plus a generation counter. Each connect attempt and each shutdown
/// starts a new generation; shutdown notifications from older generations
/// are ignored.
#[derive(Debug, Default)]
struct StateCell {
    state: AtomicU8,
    generation: AtomicU64,
}

impl StateCell {
    fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn advance(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn close_if_current(&self, generation: u64) -> bool {
        if self.generation.load(Ordering::SeqCst) != generation {
            return false;
        }
        self.set(ConnectionState::Closed);
        true
    }
}

struct Session {
    connection: Arc<dyn BrokerConnection>,
    channel: Option<Arc<dyn BrokerChannel>>,
}

impl Session {
    fn is_open(&self) -> bool {
        self.connection.is_open() && self.channel.as_ref().is_some_and(|c| c.is_open())
    }
}

struct Shared {
    broker: Arc<dyn Broker>,
    settings: ConnectionSettings,
    state: Arc<StateCell>,
    session: Mutex<Option<Session>>,
}

impl Shared {
    async fn establish(&self) {
        let mut session = self.session.lock().await;

        if self.state.get() == ConnectionState::Open && session.as_ref().is_some_and(Session::is_open)
        {
            return;
        }

        let generation = self.state.advance();
        if let Some(stale) = session.take() {
            self.teardown(stale, &ShutdownReason::unreachable()).await;
        }

        let connection = match self.broker.connect(self.shutdown_hook(generation)).await {
            Ok(connection) => connection,
            Err(e) => {
                error!(error = %e, "could not connect to broker");
                self.state.set(ConnectionState::Closed);
                return;
            }
        };

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                error!(error = %e, "could not create channel");
                *session = Some(Session {
                    connection,
                    channel: None,
                });
                self.state.set(ConnectionState::Closed);
                return;
            }
        };

        if !self.settings.passive {
            if let Err(e) = channel
                .declare_exchange(&self.settings.exchange, self.settings.durable)
                .await
            {
                error!(
                    error = %e,
                    exchange = %self.settings.exchange,
                    "could not declare exchange"
                );
                if let Err(e) = channel.close(&ShutdownReason::unreachable()).await {
                    debug!(error = %e, "discarding channel after failed declare");
                }
                *session = Some(Session {
                    connection,
                    channel: None,
                });
                self.state.set(ConnectionState::Closed);
                return;
            }
        }

        *session = Some(Session {
            connection,
            channel: Some(channel),
        });

        if self
            .state
            .transition(ConnectionState::Connecting, ConnectionState::Open)
        {
            info!(exchange = %self.settings.exchange, "Connected to broker");
        } else {
            warn!("connection closed while it was being established");
        }
    }

    fn shutdown_hook(&self, generation: u64) -> ShutdownHook {
        let state = Arc::clone(&self.state);
        Arc::new(move |reason: ShutdownReason| {
            if state.close_if_current(generation) {
                warn!(
                    reply_code = reason.reply_code,
                    reply_text = %reason.reply_text,
                    initiator = ?reason.initiator,
                    "broker connection shut down"
                );
            }
        })
    }

    async fn teardown(&self, session: Session, reason: &ShutdownReason) {
        if let Some(channel) = session.channel {
            if channel.is_open() && reason.channel_usable() {
                if let Err(e) = channel.close(reason).await {
                    error!(error = %e, "could not close channel");
                }
            }
        }

        if !session.connection.is_open() {
            return;
        }

        match tokio::time::timeout(self.settings.close_timeout, session.connection.close(reason))
            .await
        {
            Ok(Ok(())) => debug!(reply_code = reason.reply_code, "connection closed"),
            Ok(Err(e)) => {
                error!(error = %e, "could not close connection");
                session.connection.abort();
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.settings.close_timeout.as_millis() as u64,
                    "connection close timed out, aborting"
                );
                session.connection.abort();
            }
        }
    }
}

/// Owns the connection and channel to the broker.
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(broker: Arc<dyn Broker>, settings: ConnectionSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                broker,
                settings,
                state: Arc::new(StateCell::default()),
                session: Mutex::new(None),
            }),
        }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.shared.settings
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Try to open the connection, waiting at most the connect timeout.
    ///
    /// Returns the state observed when the wait ends. A timed-out attempt is
    /// left running in the background and settles the state on its own.
    pub async fn connect(&self) -> ConnectionState {
        if !self
            .shared
            .state
            .transition(ConnectionState::Closed, ConnectionState::Connecting)
        {
            debug!(state = ?self.state(), "connect skipped");
            return self.state();
        }

        let shared = Arc::clone(&self.shared);
        let attempt = tokio::spawn(async move { shared.establish().await });

        match tokio::time::timeout(self.shared.settings.connect_timeout, attempt).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "connection task failed");
                self.shared.state.set(ConnectionState::Closed);
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.shared.settings.connect_timeout.as_millis() as u64,
                    "starting connection task timed out, continuing"
                );
            }
        }

        self.state()
    }

    /// Publish on the current channel. Requires an open connection.
    pub async fn publish(
        &self,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<()> {
        if !self.is_open() {
            return Err(BrokerError::ChannelClosed);
        }

        let channel = {
            let session = self.shared.session.lock().await;
            session.as_ref().and_then(|s| s.channel.clone())
        }
        .ok_or(BrokerError::ChannelClosed)?;

        channel
            .publish(&self.shared.settings.exchange, routing_key, payload, properties)
            .await
    }

    /// Close the connection. Errors are logged, never returned.
    pub async fn shutdown(&self, reason: ShutdownReason) {
        let mut session = self.shared.session.lock().await;
        self.shared.state.advance();
        self.shared.state.set(ConnectionState::Closed);

        if let Some(current) = session.take() {
            info!(
                reply_code = reason.reply_code,
                reply_text = %reason.reply_text,
                "Shutting down broker connection"
            );
            self.shared.teardown(current, &reason).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MockBroker, ShutdownInitiator, CONNECTION_FORCED};

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            exchange: "app-logs".to_string(),
            durable: true,
            passive: false,
            connect_timeout: Duration::from_millis(200),
            close_timeout: Duration::from_millis(100),
        }
    }

    fn manager(broker: &MockBroker, settings: ConnectionSettings) -> ConnectionManager {
        ConnectionManager::new(Arc::new(broker.clone()), settings)
    }

    fn properties() -> MessageProperties {
        MessageProperties {
            content_type: "text/plain".to_string(),
            content_encoding: "utf8".to_string(),
            app_id: "test".to_string(),
            timestamp: 0,
            user_id: None,
            delivery_mode: 1,
        }
    }

    #[tokio::test]
    async fn test_connect_declares_exchange_and_opens() {
        let broker = MockBroker::new();
        let manager = manager(&broker, settings());

        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(manager.connect().await, ConnectionState::Open);
        assert_eq!(broker.connect_count(), 1);
        assert_eq!(broker.declared().await, vec![("app-logs".to_string(), true)]);
    }

    #[tokio::test]
    async fn test_connect_when_open_is_noop() {
        let broker = MockBroker::new();
        let manager = manager(&broker, settings());

        manager.connect().await;
        manager.connect().await;

        assert_eq!(broker.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_passive_skips_declare() {
        let broker = MockBroker::new();
        let manager = manager(
            &broker,
            ConnectionSettings {
                passive: true,
                ..settings()
            },
        );

        assert_eq!(manager.connect().await, ConnectionState::Open);
        assert!(broker.declared().await.is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_broker_stays_closed() {
        let broker = MockBroker::new();
        broker.set_available(false);
        let manager = manager(&broker, settings());

        assert_eq!(manager.connect().await, ConnectionState::Closed);
        assert_eq!(broker.connect_count(), 1);

        broker.set_available(true);
        assert_eq!(manager.connect().await, ConnectionState::Open);
        assert_eq!(broker.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_declare_failure_retried_with_fresh_connection() {
        let broker = MockBroker::new();
        broker.set_fail_declare(true);
        let manager = manager(&broker, settings());

        assert_eq!(manager.connect().await, ConnectionState::Closed);
        assert!(manager
            .publish("logs.Info", b"x", &properties())
            .await
            .is_err());

        broker.set_fail_declare(false);
        assert_eq!(manager.connect().await, ConnectionState::Open);
        assert_eq!(broker.connect_count(), 2);
        // The connection left over from the failed declare is closed first.
        assert_eq!(broker.connection_close_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_timeout_does_not_start_duplicate_attempt() {
        let broker = MockBroker::new();
        broker.set_connect_delay(Some(Duration::from_millis(300))).await;
        let manager = manager(
            &broker,
            ConnectionSettings {
                connect_timeout: Duration::from_millis(50),
                ..settings()
            },
        );

        assert_eq!(manager.connect().await, ConnectionState::Connecting);
        assert!(!manager.is_open());
        assert_eq!(manager.connect().await, ConnectionState::Connecting);
        assert_eq!(broker.connect_count(), 1);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(manager.state(), ConnectionState::Open);
        assert_eq!(broker.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_broker_shutdown_signal_closes_state() {
        let broker = MockBroker::new();
        let manager = manager(&broker, settings());
        manager.connect().await;

        broker
            .simulate_shutdown(ShutdownReason::new(
                ShutdownInitiator::Peer,
                CONNECTION_FORCED,
                "closed by admin",
            ))
            .await;

        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(manager.connect().await, ConnectionState::Open);
        assert_eq!(broker.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_stale_shutdown_signal_ignored() {
        let broker = MockBroker::new();
        let manager = manager(&broker, settings());
        manager.connect().await;
        let stale = broker.last_hook().await.unwrap();

        manager.shutdown(ShutdownReason::unreachable()).await;
        manager.connect().await;
        stale(ShutdownReason::new(ShutdownInitiator::Peer, CONNECTION_FORCED, "late"));

        assert_eq!(manager.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_publish_requires_open() {
        let broker = MockBroker::new();
        let manager = manager(&broker, settings());

        let result = manager.publish("logs.Info", b"x", &properties()).await;
        assert!(matches!(result, Err(BrokerError::ChannelClosed)));

        manager.connect().await;
        manager
            .publish("logs.Info", b"x", &properties())
            .await
            .unwrap();

        let published = broker.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].exchange, "app-logs");
        assert_eq!(published[0].routing_key, "logs.Info");
    }

    #[tokio::test]
    async fn test_shutdown_closes_gracefully() {
        let broker = MockBroker::new();
        let manager = manager(&broker, settings());
        manager.connect().await;

        manager.shutdown(ShutdownReason::closing()).await;

        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(broker.channel_close_count(), 1);
        assert_eq!(broker.connection_close_count(), 1);
        assert_eq!(broker.abort_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_after_transport_failure_skips_channel_close() {
        let broker = MockBroker::new();
        let manager = manager(&broker, settings());
        manager.connect().await;

        manager.shutdown(ShutdownReason::unreachable()).await;

        assert_eq!(broker.channel_close_count(), 0);
        assert_eq!(broker.connection_close_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_swallows_close_errors_and_aborts() {
        let broker = MockBroker::new();
        let manager = manager(&broker, settings());
        manager.connect().await;
        broker.set_fail_close(true);

        manager.shutdown(ShutdownReason::closing()).await;

        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(broker.abort_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_without_connection_is_noop() {
        let broker = MockBroker::new();
        let manager = manager(&broker, settings());

        manager.shutdown(ShutdownReason::closing()).await;

        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(broker.connection_close_count(), 0);
    }
}
