//! Logrelay - structured log shipping to an AMQP exchange.
//!
//! Turns log events into plain-text or JSON envelope messages and publishes
//! them to a RabbitMQ topic exchange, routed by level. Messages that cannot be
//! delivered are held in a bounded buffer and sent, oldest first, once the
//! broker is reachable again.
//!
//! ```text
//! LogEvent --EnvelopeBuilder--> bytes --codec--> Publisher --ConnectionManager--> Broker
//!                                                    |
//!                                               RetryBuffer
//! ```

pub mod broker;
pub mod codec;
pub mod config;
pub mod envelope;
pub mod event;
pub mod layout;
pub mod publisher;
pub mod utils;

pub use event::{Level, LogEvent};
pub use publisher::{PublishError, Publisher};
