//! logrelay: ship stdin lines to RabbitMQ.
//!
//! Each input line becomes an Info event from logger "stdin" and is published
//! through the configured target.
//!
//! ```text
//! stdin --lines--> [logrelay] --AMQP--> exchange (topic) --routing key--> queues
//! ```
//!
//! ## Configuration
//! - First argument or LOGRELAY_CONFIG: YAML configuration file (optional)
//! - LOGRELAY__SECTION__KEY: overrides, e.g. LOGRELAY__BROKER__HOST
//! - LOGRELAY_LOG: tracing filter (default: info)

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use logrelay::broker::LapinBroker;
use logrelay::config::Config;
use logrelay::utils::bootstrap::init_tracing;
use logrelay::{Level, LogEvent, Publisher};

const STDIN_LOGGER: &str = "stdin";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref())?;

    let broker = LapinBroker::new(&config.broker)?;
    let publisher = Publisher::new(Arc::new(broker), &config)?;

    let state = publisher.start().await;
    info!(
        host = %config.broker.host,
        exchange = %config.broker.exchange,
        state = ?state,
        "logrelay started"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut sent = 0u64;
    let mut failed = 0u64;

    while let Some(line) = lines.next_line().await? {
        if line.is_empty() {
            continue;
        }
        let event = LogEvent::new(Level::Info, STDIN_LOGGER, line);
        match publisher.publish(&event).await {
            Ok(()) => sent += 1,
            Err(e) => {
                failed += 1;
                warn!(error = %e, buffered = e.is_buffered(), "publish failed");
            }
        }
    }

    let unsent = publisher.buffered_len().await;
    publisher.close().await;
    info!(sent, failed, unsent, "logrelay finished");

    Ok(())
}
