//! Connection supervisor and callback consumer.
//!
//! The supervisor owns the broker connection, the publisher channel pool,
//! and the dedicated consumer that drains the client's private callback
//! queue. A dead connection or a stopped consumer is repaired lazily: the
//! next `ensure_started` performs a full restart under the start lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};
use crate::pool::ChannelPool;
use crate::registry::PendingRegistry;
use crate::transport::{Channel, Connection, Connector, Delivery, DeliveryStream, QueueOptions};

/// Consumer lifecycle. Startup is double-checked: the fast path reads this
/// without taking the start lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Starting,
    Running,
}

/// Live broker resources for one connection generation.
struct Link {
    epoch: u64,
    connection: Arc<dyn Connection>,
    pool: Arc<ChannelPool>,
    consumer_channel: Arc<dyn Channel>,
    consumer_task: JoinHandle<()>,
}

struct Shared {
    lifecycle: Mutex<Lifecycle>,
    start_lock: tokio::sync::Mutex<()>,
    link: Mutex<Option<Link>>,
    next_epoch: AtomicU64,
}

pub(crate) struct Supervisor {
    connector: Arc<dyn Connector>,
    callback_queue: String,
    callback_queue_ttl_ms: u64,
    consumer_tag: String,
    registry: Arc<PendingRegistry>,
    shared: Arc<Shared>,
}

impl Supervisor {
    pub(crate) fn new(
        connector: Arc<dyn Connector>,
        callback_queue: String,
        callback_queue_ttl_ms: u64,
        consumer_tag: String,
        registry: Arc<PendingRegistry>,
    ) -> Self {
        Self {
            connector,
            callback_queue,
            callback_queue_ttl_ms,
            consumer_tag,
            registry,
            shared: Arc::new(Shared {
                lifecycle: Mutex::new(Lifecycle::Idle),
                start_lock: tokio::sync::Mutex::new(()),
                link: Mutex::new(None),
                next_epoch: AtomicU64::new(1),
            }),
        }
    }

    /// Idempotently bring up the connection, pool, and callback consumer.
    ///
    /// On success a publisher channel can be borrowed and deliveries for
    /// registered correlation IDs will reach the registry.
    pub(crate) async fn ensure_started(&self) -> Result<()> {
        if self.healthy() {
            return Ok(());
        }

        let _guard = self.shared.start_lock.lock().await;
        if self.healthy() {
            return Ok(());
        }

        *self.shared.lifecycle.lock().unwrap() = Lifecycle::Starting;
        match self.start().await {
            Ok(()) => {
                *self.shared.lifecycle.lock().unwrap() = Lifecycle::Running;
                Ok(())
            }
            Err(e) => {
                *self.shared.lifecycle.lock().unwrap() = Lifecycle::Idle;
                Err(e)
            }
        }
    }

    /// The current publisher channel pool.
    pub(crate) fn pool(&self) -> Result<Arc<ChannelPool>> {
        self.shared
            .link
            .lock()
            .unwrap()
            .as_ref()
            .map(|link| link.pool.clone())
            .ok_or_else(|| ClientError::InvalidState("supervisor is not started".to_string()))
    }

    /// Tear down the consumer, pool, and connection. Idempotent.
    pub(crate) async fn dispose(&self) {
        let link = self.shared.link.lock().unwrap().take();
        *self.shared.lifecycle.lock().unwrap() = Lifecycle::Idle;
        if let Some(link) = link {
            // Closing the channel unblocks the delivery loop.
            link.consumer_channel.close().await;
            link.consumer_task.abort();
            link.pool.dispose().await;
            link.connection.close().await;
            info!("supervisor disposed");
        }
    }

    fn healthy(&self) -> bool {
        if *self.shared.lifecycle.lock().unwrap() != Lifecycle::Running {
            return false;
        }
        self.shared
            .link
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|link| link.connection.is_open() && link.consumer_channel.is_open())
    }

    async fn start(&self) -> Result<()> {
        let connection = self.connector.connect().await?;
        let pool = ChannelPool::new(connection.clone());

        let consumer_channel = match self.open_consumer(&connection).await {
            Ok(channel) => channel,
            Err(e) => {
                connection.close().await;
                return Err(e);
            }
        };

        let stream = match consumer_channel
            .consume(&self.callback_queue, &self.consumer_tag)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                connection.close().await;
                return Err(e);
            }
        };

        let epoch = self.shared.next_epoch.fetch_add(1, Ordering::SeqCst);
        let consumer_task = tokio::spawn(run_delivery_loop(
            stream,
            self.registry.clone(),
            self.shared.clone(),
            epoch,
        ));

        let old = self.shared.link.lock().unwrap().replace(Link {
            epoch,
            connection,
            pool,
            consumer_channel,
            consumer_task,
        });

        // The fresh link is in place; retire the previous generation.
        if let Some(old) = old {
            old.consumer_task.abort();
            old.consumer_channel.close().await;
            old.pool.dispose().await;
            old.connection.close().await;
        }

        info!(callback_queue = %self.callback_queue, "callback consumer started");
        Ok(())
    }

    async fn open_consumer(&self, connection: &Arc<dyn Connection>) -> Result<Arc<dyn Channel>> {
        let channel = connection.open_channel().await?;
        channel
            .declare_queue(
                &self.callback_queue,
                QueueOptions {
                    durable: false,
                    exclusive: false,
                    auto_delete: true,
                    expires_ms: Some(self.callback_queue_ttl_ms),
                },
            )
            .await?;
        Ok(channel)
    }
}

/// Drain deliveries and dispatch each to its waiter.
///
/// Runs until the consumer channel or connection closes, then releases the
/// generation's resources so the next send triggers a fresh startup.
async fn run_delivery_loop(
    mut stream: Box<dyn DeliveryStream>,
    registry: Arc<PendingRegistry>,
    shared: Arc<Shared>,
    epoch: u64,
) {
    while let Some(delivery) = stream.next_delivery().await {
        dispatch_delivery(delivery, &registry).await;
    }
    debug!("callback consumer stream ended");

    // Only tear down our own generation; a restart may already have
    // swapped in a newer link.
    let link = {
        let mut slot = shared.link.lock().unwrap();
        match slot.as_ref() {
            Some(link) if link.epoch == epoch => slot.take(),
            _ => None,
        }
    };
    if let Some(link) = link {
        *shared.lifecycle.lock().unwrap() = Lifecycle::Idle;
        link.consumer_channel.close().await;
        link.pool.dispose().await;
        link.connection.close().await;
    }
}

async fn dispatch_delivery(delivery: Delivery, registry: &PendingRegistry) {
    match delivery.correlation_id.as_deref() {
        Some(id) if registry.contains(id) => match parse_response(&delivery.body) {
            Ok(response) => {
                if !registry.complete(id, Ok(response)) {
                    debug!(correlation_id = %id, "waiter completed first, dropping response");
                }
            }
            Err(e) => {
                registry.complete(id, Err(e));
            }
        },
        Some(id) => {
            debug!(correlation_id = %id, "no waiter registered, dropping late response");
        }
        None => {
            debug!("delivery without correlation id, dropping");
        }
    }

    // Positive ack regardless of outcome; a response the client could not
    // parse must not be redelivered.
    if let Err(e) = delivery.acker.ack().await {
        warn!(error = %e, "failed to ack delivery");
    }
}

/// Deserialize a delivery body and force `Content-Length` to match the
/// actual byte count. A failed deserialize skips the header write.
fn parse_response(bytes: &[u8]) -> Result<crate::packet::ResponsePacket> {
    let mut response = crate::packet::ResponsePacket::deserialize(bytes)?;
    response.set_content_length();
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming;
    use crate::packet::ResponsePacket;
    use crate::transport::{MemoryBroker, MessageProperties, Publication};
    use std::time::Duration;

    fn supervisor(broker: &MemoryBroker, registry: Arc<PendingRegistry>) -> Supervisor {
        Supervisor::new(
            broker.connector(),
            "cbq".to_string(),
            60_000,
            "test-consumer".to_string(),
            registry,
        )
    }

    async fn publish_response(
        broker: &MemoryBroker,
        correlation_id: &str,
        response: &ResponsePacket,
    ) {
        let connection = broker.connector().connect().await.unwrap();
        let channel = connection.open_channel().await.unwrap();
        channel
            .publish(Publication {
                exchange: String::new(),
                routing_key: "cbq".to_string(),
                properties: MessageProperties {
                    correlation_id: Some(correlation_id.to_string()),
                    reply_to: None,
                    expiration_ms: None,
                },
                body: response.serialize().unwrap(),
            })
            .await
            .unwrap();
        connection.close().await;
    }

    #[tokio::test]
    async fn test_delivery_completes_registered_waiter() {
        let broker = MemoryBroker::new();
        let registry = Arc::new(PendingRegistry::new());
        let supervisor = supervisor(&broker, registry.clone());
        supervisor.ensure_started().await.unwrap();

        let id = naming::random_id();
        let rx = registry.register(&id).unwrap();
        publish_response(&broker, &id, &ResponsePacket::ok(b"pong".to_vec())).await;

        let response = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(response.body, b"pong");
        assert_eq!(response.headers.get("Content-Length"), Some("4"));
        assert_eq!(broker.ack_count(), 1);

        supervisor.dispose().await;
    }

    #[tokio::test]
    async fn test_unparsable_delivery_fails_waiter_and_acks() {
        let broker = MemoryBroker::new();
        let registry = Arc::new(PendingRegistry::new());
        let supervisor = supervisor(&broker, registry.clone());
        supervisor.ensure_started().await.unwrap();

        let id = naming::random_id();
        let rx = registry.register(&id).unwrap();

        let connection = broker.connector().connect().await.unwrap();
        let channel = connection.open_channel().await.unwrap();
        channel
            .publish(Publication {
                exchange: String::new(),
                routing_key: "cbq".to_string(),
                properties: MessageProperties {
                    correlation_id: Some(id.clone()),
                    reply_to: None,
                    expiration_ms: None,
                },
                body: b"\x00garbage".to_vec(),
            })
            .await
            .unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, Err(ClientError::BadResponse(_))));
        assert_eq!(broker.ack_count(), 1);

        supervisor.dispose().await;
    }

    #[tokio::test]
    async fn test_late_delivery_dropped_but_acked() {
        let broker = MemoryBroker::new();
        let registry = Arc::new(PendingRegistry::new());
        let supervisor = supervisor(&broker, registry.clone());
        supervisor.ensure_started().await.unwrap();

        publish_response(&broker, "nobody-waiting", &ResponsePacket::empty_ok()).await;

        tokio::time::timeout(Duration::from_secs(1), async {
            while broker.ack_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(registry.is_empty());

        supervisor.dispose().await;
    }

    #[tokio::test]
    async fn test_restart_after_consumer_death() {
        let broker = MemoryBroker::new();
        let registry = Arc::new(PendingRegistry::new());
        let supervisor = supervisor(&broker, registry.clone());
        supervisor.ensure_started().await.unwrap();

        // Kill the consumer channel; the loop tears its generation down.
        let channel = {
            let link = supervisor.shared.link.lock().unwrap();
            link.as_ref().unwrap().consumer_channel.clone()
        };
        channel.close().await;
        tokio::time::timeout(Duration::from_secs(1), async {
            while supervisor.healthy() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // The next ensure_started brings up a fresh generation end-to-end.
        supervisor.ensure_started().await.unwrap();
        let id = naming::random_id();
        let rx = registry.register(&id).unwrap();
        publish_response(&broker, &id, &ResponsePacket::ok(b"again".to_vec())).await;
        let response = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(response.body, b"again");

        supervisor.dispose().await;
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let broker = MemoryBroker::new();
        let registry = Arc::new(PendingRegistry::new());
        let supervisor = supervisor(&broker, registry);
        supervisor.ensure_started().await.unwrap();
        supervisor.dispose().await;
        supervisor.dispose().await;
        assert!(supervisor.pool().is_err());
    }

    #[tokio::test]
    async fn test_unreachable_broker_surfaces_error() {
        let broker = MemoryBroker::new();
        broker.set_unreachable(true);
        let registry = Arc::new(PendingRegistry::new());
        let supervisor = supervisor(&broker, registry);
        let err = supervisor.ensure_started().await.unwrap_err();
        assert!(matches!(err, ClientError::BrokerUnreachable(_)));

        broker.set_unreachable(false);
        supervisor.ensure_started().await.unwrap();
        supervisor.dispose().await;
    }
}
