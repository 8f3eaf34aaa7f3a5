//! RabbitMQ integration tests using testcontainers.
//!
//! Run with: cargo test --test broker_amqp -- --ignored --nocapture
//!
//! These tests spin up RabbitMQ in a container using testcontainers-rs.
//! No manual RabbitMQ setup required, but Docker must be available.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use lapin::{
    options::{
        BasicConsumeOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    Channel, Connection, ConnectionProperties, ExchangeKind,
};
use logrelay::broker::{ConnectionState, LapinBroker};
use logrelay::config::Config;
use logrelay::{Level, LogEvent, PublishError, Publisher};
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};

/// Start RabbitMQ container.
///
/// Returns (container, host, port) for the AMQP listener.
async fn start_rabbitmq() -> (testcontainers::ContainerAsync<GenericImage>, String, u16) {
    let image = GenericImage::new("rabbitmq", "3-management")
        .with_exposed_port(5672.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Server startup complete"));

    let container = image
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start rabbitmq container");

    // Brief delay to ensure RabbitMQ is fully ready
    tokio::time::sleep(Duration::from_secs(2)).await;

    let port = container
        .get_host_port_ipv4(5672)
        .await
        .expect("Failed to get mapped port");

    let host = container
        .get_host()
        .await
        .expect("Failed to get container host")
        .to_string();

    println!("RabbitMQ available at: {}:{}", host, port);

    (container, host, port)
}

fn config(host: &str, port: u16, exchange: &str) -> Config {
    let mut config = Config::for_test();
    config.broker.host = host.to_string();
    config.broker.port = port;
    config.broker.exchange = exchange.to_string();
    config.broker.connect_timeout_ms = 5000;
    config.broker.close_timeout_ms = 1000;
    config
}

fn publisher(config: &Config) -> Publisher {
    let broker = LapinBroker::new(&config.broker).expect("Failed to build broker client");
    Publisher::new(Arc::new(broker), config).expect("Failed to build publisher")
}

/// Plain lapin channel for inspecting what the publisher sent.
async fn test_channel(host: &str, port: u16) -> (Connection, Channel) {
    let connection = Connection::connect(
        &format!("amqp://guest:guest@{}:{}/%2f", host, port),
        ConnectionProperties::default(),
    )
    .await
    .expect("Failed to connect test client");
    let channel = connection
        .create_channel()
        .await
        .expect("Failed to create test channel");
    (connection, channel)
}

async fn bind_queue(channel: &Channel, exchange: &str, pattern: &str) -> lapin::Consumer {
    let queue = channel
        .queue_declare(
            "",
            QueueDeclareOptions {
                exclusive: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .expect("Failed to declare queue");

    channel
        .queue_bind(
            queue.name().as_str(),
            exchange,
            pattern,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .expect("Failed to bind queue");

    channel
        .basic_consume(
            queue.name().as_str(),
            "logrelay-test",
            BasicConsumeOptions {
                no_ack: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .expect("Failed to start consumer")
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_publish_routes_by_level() {
    let (_container, host, port) = start_rabbitmq().await;
    let config = config(&host, port, "logrelay-routing");
    let publisher = publisher(&config);

    assert_eq!(publisher.start().await, ConnectionState::Open);

    let (_conn, channel) = test_channel(&host, port).await;
    let mut errors = bind_queue(&channel, "logrelay-routing", "logs.Error").await;

    publisher
        .publish(&LogEvent::new(Level::Info, "orders.api", "fine"))
        .await
        .unwrap();
    publisher
        .publish(&LogEvent::new(Level::Error, "orders.api", "boom"))
        .await
        .unwrap();

    let delivery = tokio::time::timeout(Duration::from_secs(10), errors.next())
        .await
        .expect("Timed out waiting for delivery")
        .expect("Consumer stream ended")
        .expect("Delivery failed");

    assert_eq!(delivery.routing_key.as_str(), "logs.Error");
    assert_eq!(delivery.data, b"boom");
    let props = &delivery.properties;
    assert_eq!(
        props.content_type().as_ref().map(|s| s.as_str()),
        Some("text/plain")
    );
    assert_eq!(
        props.app_id().as_ref().map(|s| s.as_str()),
        Some("orders.api")
    );
    assert_eq!(props.user_id().as_ref().map(|s| s.as_str()), Some("guest"));
    assert_eq!(*props.delivery_mode(), Some(1));

    publisher.close().await;
    assert_eq!(publisher.connection().state(), ConnectionState::Closed);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_declare_mismatch_buffers_until_passive() {
    let (_container, host, port) = start_rabbitmq().await;
    let (_conn, channel) = test_channel(&host, port).await;

    // Pre-existing non-durable exchange conflicts with a durable declaration.
    channel
        .exchange_declare(
            "logrelay-mismatch",
            ExchangeKind::Topic,
            ExchangeDeclareOptions::default(),
            FieldTable::default(),
        )
        .await
        .expect("Failed to declare exchange");

    let config = config(&host, port, "logrelay-mismatch");
    let durable = publisher(&config);

    let error = durable
        .publish(&LogEvent::new(Level::Warn, "orders.api", "lost?"))
        .await
        .unwrap_err();
    assert!(matches!(error, PublishError::NotConnected { buffered: true }));

    let mut passive_config = config.clone();
    passive_config.broker.passive = true;
    let passive = publisher(&passive_config);
    let mut warnings = bind_queue(&channel, "logrelay-mismatch", "logs.#").await;

    passive
        .publish(&LogEvent::new(Level::Warn, "orders.api", "delivered"))
        .await
        .unwrap();

    let delivery = tokio::time::timeout(Duration::from_secs(10), warnings.next())
        .await
        .expect("Timed out waiting for delivery")
        .expect("Consumer stream ended")
        .expect("Delivery failed");
    assert_eq!(delivery.data, b"delivered");
}
