//! Broker transport abstraction.
//!
//! This module contains:
//! - Object-safe traits the core drives the broker through
//!   (`Connector`, `Connection`, `Channel`, `DeliveryStream`, `Acker`)
//! - Wire-facing value types (`Publication`, `MessageProperties`,
//!   `QueueOptions`, `Delivery`)
//! - Implementations: AMQP (lapin), in-process memory broker

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::ExchangeKind;
use crate::error::Result;

pub mod amqp;
pub mod memory;

pub use amqp::AmqpConnector;
pub use memory::MemoryBroker;

/// Options for declaring a queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueOptions {
    /// Queue survives a broker restart.
    pub durable: bool,
    /// Queue is restricted to the declaring connection.
    pub exclusive: bool,
    /// Queue is deleted when its last consumer goes away.
    pub auto_delete: bool,
    /// `x-expires` argument: queue is deleted after this many milliseconds
    /// without consumers or operations.
    pub expires_ms: Option<u64>,
}

/// Message properties attached to a publication.
#[derive(Debug, Clone, Default)]
pub struct MessageProperties {
    /// Correlation ID linking a response back to its request.
    pub correlation_id: Option<String>,
    /// Queue the responder should publish the reply to.
    pub reply_to: Option<String>,
    /// Per-message TTL in milliseconds.
    pub expiration_ms: Option<u64>,
}

/// A message to publish.
#[derive(Debug, Clone)]
pub struct Publication {
    /// Target exchange; empty string is the broker's default exchange.
    pub exchange: String,
    /// Routing key.
    pub routing_key: String,
    /// Message properties.
    pub properties: MessageProperties,
    /// Message body.
    pub body: Vec<u8>,
}

/// A message delivered from a consumed queue.
pub struct Delivery {
    /// Correlation ID from the message properties.
    pub correlation_id: Option<String>,
    /// Reply-to queue from the message properties.
    pub reply_to: Option<String>,
    /// Message body.
    pub body: Vec<u8>,
    /// Acknowledgement handle for this delivery.
    pub acker: Box<dyn Acker>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("correlation_id", &self.correlation_id)
            .field("reply_to", &self.reply_to)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Positive acknowledgement of a delivery.
#[async_trait]
pub trait Acker: Send + Sync {
    /// Ack the delivery. Idempotence is not required; callers ack once.
    async fn ack(&self) -> Result<()>;
}

/// Establishes broker connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new connection. Failure surfaces as `BrokerUnreachable`.
    async fn connect(&self) -> Result<Arc<dyn Connection>>;
}

/// An open broker connection. Channels are multiplexed over it; the
/// connection itself is only opened and closed by the supervisor.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open a new channel on this connection.
    async fn open_channel(&self) -> Result<Arc<dyn Channel>>;

    /// Whether the connection is still usable.
    fn is_open(&self) -> bool;

    /// Close the connection and all its channels.
    async fn close(&self);
}

impl std::fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// A broker channel. Not safe for concurrent publishing; the pool hands a
/// channel to at most one caller at a time.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Declare an exchange.
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
        auto_delete: bool,
    ) -> Result<()>;

    /// Declare a queue.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()>;

    /// Bind a queue to an exchange.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Publish a message. Failure surfaces as `PublishFailed`.
    async fn publish(&self, publication: Publication) -> Result<()>;

    /// Begin consuming a queue in manual-ack mode.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Box<dyn DeliveryStream>>;

    /// Whether the channel is still usable.
    fn is_open(&self) -> bool;

    /// Close the channel.
    async fn close(&self);
}

/// Blocking reader over a consumed queue.
#[async_trait]
pub trait DeliveryStream: Send {
    /// Next delivery, or `None` once the channel or connection has closed.
    async fn next_delivery(&mut self) -> Option<Delivery>;
}
