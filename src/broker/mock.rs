//! Mock broker implementation for testing.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    Broker, BrokerChannel, BrokerConnection, BrokerError, MessageProperties, Result,
    ShutdownHook, ShutdownReason,
};

/// A message captured by [`MockBroker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub properties: MessageProperties,
}

#[derive(Default)]
struct MockState {
    unavailable: AtomicBool,
    fail_declare: AtomicBool,
    fail_close: AtomicBool,
    connect_delay: RwLock<Option<Duration>>,
    publish_failure: RwLock<Option<BrokerError>>,
    connects: AtomicUsize,
    channel_closes: AtomicUsize,
    connection_closes: AtomicUsize,
    aborts: AtomicUsize,
    declared: RwLock<Vec<(String, bool)>>,
    published: RwLock<Vec<PublishedMessage>>,
    current: RwLock<Option<(Arc<AtomicBool>, ShutdownHook)>>,
}

/// In-memory broker with switchable failure modes.
///
/// Clones share state, so a test can keep one handle while the publisher
/// owns another.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<MockState>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse new connections while `false`.
    pub fn set_available(&self, available: bool) {
        self.state.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn set_fail_declare(&self, fail: bool) {
        self.state.fail_declare.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_close(&self, fail: bool) {
        self.state.fail_close.store(fail, Ordering::SeqCst);
    }

    /// Delay every connect attempt.
    pub async fn set_connect_delay(&self, delay: Option<Duration>) {
        *self.state.connect_delay.write().await = delay;
    }

    /// Fail every publish with `error` until cleared with `None`.
    pub async fn set_fail_on_publish(&self, error: Option<BrokerError>) {
        *self.state.publish_failure.write().await = error;
    }

    /// Number of connect attempts started.
    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn channel_close_count(&self) -> usize {
        self.state.channel_closes.load(Ordering::SeqCst)
    }

    pub fn connection_close_count(&self) -> usize {
        self.state.connection_closes.load(Ordering::SeqCst)
    }

    pub fn abort_count(&self) -> usize {
        self.state.aborts.load(Ordering::SeqCst)
    }

    /// `(exchange, durable)` for every declaration.
    pub async fn declared(&self) -> Vec<(String, bool)> {
        self.state.declared.read().await.clone()
    }

    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.state.published.read().await.clone()
    }

    /// Payloads of published messages as UTF-8 text.
    pub async fn published_payloads(&self) -> Vec<String> {
        self.state
            .published
            .read()
            .await
            .iter()
            .map(|m| String::from_utf8_lossy(&m.payload).into_owned())
            .collect()
    }

    /// Shutdown hook registered by the most recent connection.
    pub async fn last_hook(&self) -> Option<ShutdownHook> {
        self.state
            .current
            .read()
            .await
            .as_ref()
            .map(|(_, hook)| Arc::clone(hook))
    }

    /// Close the current connection from the broker side and notify its
    /// shutdown hook.
    pub async fn simulate_shutdown(&self, reason: ShutdownReason) {
        let current = self.state.current.write().await.take();
        if let Some((open, hook)) = current {
            open.store(false, Ordering::SeqCst);
            hook(reason);
        }
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn connect(&self, on_shutdown: ShutdownHook) -> Result<Arc<dyn BrokerConnection>> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);

        let delay = *self.state.connect_delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.state.unavailable.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection("connection refused".to_string()));
        }

        let open = Arc::new(AtomicBool::new(true));
        *self.state.current.write().await = Some((Arc::clone(&open), on_shutdown));

        Ok(Arc::new(MockConnection {
            state: Arc::clone(&self.state),
            open,
        }))
    }
}

struct MockConnection {
    state: Arc<MockState>,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerConnection for MockConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        if !self.is_open() {
            return Err(BrokerError::ChannelClosed);
        }
        Ok(Arc::new(MockChannel {
            state: Arc::clone(&self.state),
            connection_open: Arc::clone(&self.open),
            open: AtomicBool::new(true),
        }))
    }

    async fn close(&self, _reason: &ShutdownReason) -> Result<()> {
        self.state.connection_closes.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_close.load(Ordering::SeqCst) {
            return Err(BrokerError::Io("close handshake failed".to_string()));
        }
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn abort(&self) {
        self.state.aborts.fetch_add(1, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
    }
}

struct MockChannel {
    state: Arc<MockState>,
    connection_open: Arc<AtomicBool>,
    open: AtomicBool,
}

#[async_trait]
impl BrokerChannel for MockChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.connection_open.load(Ordering::SeqCst)
    }

    async fn declare_exchange(&self, exchange: &str, durable: bool) -> Result<()> {
        if self.state.fail_declare.load(Ordering::SeqCst) {
            return Err(BrokerError::Declare(format!(
                "PRECONDITION_FAILED - inequivalent arg 'durable' for exchange '{}'",
                exchange
            )));
        }
        self.state
            .declared
            .write()
            .await
            .push((exchange.to_string(), durable));
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<()> {
        if !self.is_open() {
            return Err(BrokerError::ChannelClosed);
        }
        if let Some(error) = self.state.publish_failure.read().await.clone() {
            return Err(error);
        }
        self.state.published.write().await.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: payload.to_vec(),
            properties: properties.clone(),
        });
        Ok(())
    }

    async fn close(&self, _reason: &ShutdownReason) -> Result<()> {
        self.state.channel_closes.fetch_add(1, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}
