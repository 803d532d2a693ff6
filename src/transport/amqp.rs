//! AMQP (RabbitMQ) transport implementation over lapin.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, ConnectionProperties};
use tracing::{debug, info, warn};

use super::{
    Acker, Channel, Connection, Connector, Delivery, DeliveryStream, Publication, QueueOptions,
};
use crate::config::ExchangeKind;
use crate::error::{ClientError, Result};

/// Heartbeat requested on every connection, in seconds.
const HEARTBEAT_SECS: u32 = 30;

/// Connector that opens lapin connections to a broker URL.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    url: String,
}

impl AmqpConnector {
    /// Create a connector for the given AMQP URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

/// Append the heartbeat query parameter unless the URL already carries one.
fn with_heartbeat(url: &str) -> String {
    if url.contains("heartbeat=") {
        return url.to_string();
    }
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}heartbeat={HEARTBEAT_SECS}")
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self) -> Result<Arc<dyn Connection>> {
        let url = with_heartbeat(&self.url);
        let connection = lapin::Connection::connect(&url, ConnectionProperties::default())
            .await
            .map_err(|e| ClientError::BrokerUnreachable(e.to_string()))?;

        info!(url = %self.url, "Connected to AMQP broker");

        Ok(Arc::new(AmqpConnection { inner: connection }))
    }
}

struct AmqpConnection {
    inner: lapin::Connection,
}

#[async_trait]
impl Connection for AmqpConnection {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>> {
        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(|e| ClientError::Broker(format!("failed to open channel: {e}")))?;
        Ok(Arc::new(AmqpChannel { inner: channel }))
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn close(&self) {
        if let Err(e) = self.inner.close(200, "client shutdown").await {
            debug!(error = %e, "AMQP connection close returned an error");
        }
    }
}

struct AmqpChannel {
    inner: lapin::Channel,
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
        auto_delete: bool,
    ) -> Result<()> {
        self.inner
            .exchange_declare(
                name,
                exchange_kind(kind),
                ExchangeDeclareOptions {
                    durable,
                    auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| ClientError::Broker(format!("failed to declare exchange {name}: {e}")))
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        let mut arguments = FieldTable::default();
        if let Some(ms) = options.expires_ms {
            arguments.insert("x-expires".into(), AMQPValue::LongLongInt(ms as i64));
        }
        self.inner
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map(|_| ())
            .map_err(|e| ClientError::Broker(format!("failed to declare queue {name}: {e}")))
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| ClientError::Broker(format!("failed to bind queue {queue}: {e}")))
    }

    async fn publish(&self, publication: Publication) -> Result<()> {
        let mut properties = BasicProperties::default();
        if let Some(id) = &publication.properties.correlation_id {
            properties = properties.with_correlation_id(id.as_str().into());
        }
        if let Some(reply_to) = &publication.properties.reply_to {
            properties = properties.with_reply_to(reply_to.as_str().into());
        }
        if let Some(ms) = publication.properties.expiration_ms {
            properties = properties.with_expiration(ms.to_string().into());
        }

        let confirm = self
            .inner
            .basic_publish(
                &publication.exchange,
                &publication.routing_key,
                BasicPublishOptions::default(),
                &publication.body,
                properties,
            )
            .await
            .map_err(|e| ClientError::PublishFailed(e.to_string()))?;

        confirm
            .await
            .map(|_| ())
            .map_err(|e| ClientError::PublishFailed(format!("publish confirmation failed: {e}")))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Box<dyn DeliveryStream>> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| ClientError::Broker(format!("failed to consume {queue}: {e}")))?;
        Ok(Box::new(AmqpDeliveryStream { inner: consumer }))
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn close(&self) {
        if let Err(e) = self.inner.close(200, "released").await {
            debug!(error = %e, "AMQP channel close returned an error");
        }
    }
}

struct AmqpDeliveryStream {
    inner: lapin::Consumer,
}

#[async_trait]
impl DeliveryStream for AmqpDeliveryStream {
    async fn next_delivery(&mut self) -> Option<Delivery> {
        match self.inner.next().await? {
            Ok(delivery) => {
                let correlation_id = delivery
                    .properties
                    .correlation_id()
                    .as_ref()
                    .map(|s| s.as_str().to_string());
                let reply_to = delivery
                    .properties
                    .reply_to()
                    .as_ref()
                    .map(|s| s.as_str().to_string());
                Some(Delivery {
                    correlation_id,
                    reply_to,
                    body: delivery.data,
                    acker: Box::new(AmqpAcker {
                        inner: delivery.acker,
                    }),
                })
            }
            Err(e) => {
                // Channel-level faults end the stream; the supervisor
                // restarts consumption on the next send.
                warn!(error = %e, "consumer delivery error, ending stream");
                None
            }
        }
    }
}

struct AmqpAcker {
    inner: lapin::acker::Acker,
}

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.inner
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| ClientError::Broker(format!("ack failed: {e}")))
    }
}
