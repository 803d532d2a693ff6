//! In-process broker for tests and embedded runs.
//!
//! Routes publications between queues over tokio channels with the same
//! topology semantics the AMQP path declares: direct exchanges match the
//! routing key exactly, topic exchanges honor `*`/`#` binding patterns,
//! fanout exchanges ignore the key, and the default exchange routes
//! straight to the queue named by the key. Headers exchanges fall back to
//! exact-key matching. Publications are recorded so tests can assert on
//! what hit the wire.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::{
    Acker, Channel, Connection, Connector, Delivery, DeliveryStream, MessageProperties,
    Publication, QueueOptions,
};
use crate::config::ExchangeKind;
use crate::error::{ClientError, Result};

/// A recorded publication, for test assertions.
#[derive(Debug, Clone)]
pub struct PublicationRecord {
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key.
    pub routing_key: String,
    /// Correlation ID property.
    pub correlation_id: Option<String>,
    /// Reply-to property.
    pub reply_to: Option<String>,
    /// Per-message TTL property.
    pub expiration_ms: Option<u64>,
    /// Message body.
    pub body: Vec<u8>,
}

struct QueuedMessage {
    properties: MessageProperties,
    body: Vec<u8>,
}

struct QueueEntry {
    tx: mpsc::UnboundedSender<QueuedMessage>,
    rx: Option<mpsc::UnboundedReceiver<QueuedMessage>>,
}

impl QueueEntry {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Some(rx) }
    }
}

#[derive(PartialEq)]
struct Binding {
    exchange: String,
    routing_key: String,
    queue: String,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueEntry>,
    bindings: Vec<Binding>,
    exchanges: HashMap<String, ExchangeKind>,
    published: Vec<PublicationRecord>,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    acked: AtomicU64,
    exchange_declares: AtomicU64,
    unreachable: AtomicBool,
}

/// An in-process broker shared by any number of connections.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                acked: AtomicU64::new(0),
                exchange_declares: AtomicU64::new(0),
                unreachable: AtomicBool::new(false),
            }),
        }
    }

    /// Connector handle for clients.
    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MemoryConnector {
            broker: self.inner.clone(),
        })
    }

    /// Snapshot of everything published so far.
    pub fn publications(&self) -> Vec<PublicationRecord> {
        self.inner.state.lock().unwrap().published.clone()
    }

    /// Number of deliveries acked by consumers.
    pub fn ack_count(&self) -> u64 {
        self.inner.acked.load(Ordering::SeqCst)
    }

    /// Number of exchange declarations issued.
    pub fn exchange_declare_count(&self) -> u64 {
        self.inner.exchange_declares.load(Ordering::SeqCst)
    }

    /// Whether a queue exists.
    pub fn has_queue(&self, name: &str) -> bool {
        self.inner.state.lock().unwrap().queues.contains_key(name)
    }

    /// Make subsequent connection attempts fail with `BrokerUnreachable`.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.unreachable.store(unreachable, Ordering::SeqCst);
    }
}

impl BrokerInner {
    fn route(&self, publication: &Publication) {
        let mut state = self.state.lock().unwrap();
        state.published.push(PublicationRecord {
            exchange: publication.exchange.clone(),
            routing_key: publication.routing_key.clone(),
            correlation_id: publication.properties.correlation_id.clone(),
            reply_to: publication.properties.reply_to.clone(),
            expiration_ms: publication.properties.expiration_ms,
            body: publication.body.clone(),
        });

        let targets: Vec<String> = if publication.exchange.is_empty() {
            // Default exchange: route straight to the queue named by the key.
            if state.queues.contains_key(&publication.routing_key) {
                vec![publication.routing_key.clone()]
            } else {
                debug!(queue = %publication.routing_key, "no such queue, dropping message");
                Vec::new()
            }
        } else {
            let kind = state
                .exchanges
                .get(&publication.exchange)
                .copied()
                .unwrap_or_default();
            state
                .bindings
                .iter()
                .filter(|b| {
                    b.exchange == publication.exchange
                        && match kind {
                            ExchangeKind::Fanout => true,
                            ExchangeKind::Topic => {
                                topic_matches(&b.routing_key, &publication.routing_key)
                            }
                            ExchangeKind::Direct | ExchangeKind::Headers => {
                                b.routing_key == publication.routing_key
                            }
                        }
                })
                .map(|b| b.queue.clone())
                .collect()
        };

        for queue in targets {
            if let Some(entry) = state.queues.get(&queue) {
                let _ = entry.tx.send(QueuedMessage {
                    properties: publication.properties.clone(),
                    body: publication.body.clone(),
                });
            }
        }
    }
}

/// Check a routing key against a topic binding pattern.
///
/// Patterns are `.`-separated words where `*` matches exactly one word and
/// `#` matches zero or more.
fn topic_matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    segments_match(&pattern, &key)
}

fn segments_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|i| segments_match(rest, &key[i..])),
        Some((&"*", rest)) => match key.split_first() {
            Some((_, key_rest)) => segments_match(rest, key_rest),
            None => false,
        },
        Some((&word, rest)) => match key.split_first() {
            Some((&key_word, key_rest)) => word == key_word && segments_match(rest, key_rest),
            None => false,
        },
    }
}

struct MemoryConnector {
    broker: Arc<BrokerInner>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn Connection>> {
        if self.broker.unreachable.load(Ordering::SeqCst) {
            return Err(ClientError::BrokerUnreachable(
                "memory broker marked unreachable".to_string(),
            ));
        }
        Ok(Arc::new(MemoryConnection {
            broker: self.broker.clone(),
            open: AtomicBool::new(true),
            channels: Mutex::new(Vec::new()),
        }))
    }
}

struct MemoryConnection {
    broker: Arc<BrokerInner>,
    open: AtomicBool,
    channels: Mutex<Vec<Arc<MemoryChannel>>>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>> {
        if !self.is_open() {
            return Err(ClientError::Broker("connection is closed".to_string()));
        }
        let (closed_tx, _) = watch::channel(false);
        let channel = Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            open: AtomicBool::new(true),
            closed_tx,
        });
        self.channels.lock().unwrap().push(channel.clone());
        Ok(channel)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let channels: Vec<_> = self.channels.lock().unwrap().drain(..).collect();
        for channel in channels {
            channel.shut();
        }
    }
}

struct MemoryChannel {
    broker: Arc<BrokerInner>,
    open: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl MemoryChannel {
    fn shut(&self) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.closed_tx.send(true);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(ClientError::Broker("channel is closed".to_string()))
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        _durable: bool,
        _auto_delete: bool,
    ) -> Result<()> {
        self.ensure_open()?;
        self.broker.exchange_declares.fetch_add(1, Ordering::SeqCst);
        let mut state = self.broker.state.lock().unwrap();
        state.exchanges.insert(name.to_string(), kind);
        Ok(())
    }

    async fn declare_queue(&self, name: &str, _options: QueueOptions) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock().unwrap();
        state
            .queues
            .entry(name.to_string())
            .or_insert_with(QueueEntry::new);
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        let binding = Binding {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            queue: queue.to_string(),
        };
        let mut state = self.broker.state.lock().unwrap();
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(&self, publication: Publication) -> Result<()> {
        if !self.is_open() {
            return Err(ClientError::PublishFailed("channel is closed".to_string()));
        }
        self.broker.route(&publication);
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<Box<dyn DeliveryStream>> {
        self.ensure_open()?;
        let rx = {
            let mut state = self.broker.state.lock().unwrap();
            let entry = state
                .queues
                .entry(queue.to_string())
                .or_insert_with(QueueEntry::new);
            match entry.rx.take() {
                Some(rx) => rx,
                None => {
                    // The queue was consumed before; hand the new consumer a
                    // fresh pipe and let the stale one run dry.
                    let (tx, rx) = mpsc::unbounded_channel();
                    entry.tx = tx;
                    rx
                }
            }
        };
        Ok(Box::new(MemoryDeliveryStream {
            broker: self.broker.clone(),
            rx,
            closed: self.closed_tx.subscribe(),
        }))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.shut();
    }
}

struct MemoryDeliveryStream {
    broker: Arc<BrokerInner>,
    rx: mpsc::UnboundedReceiver<QueuedMessage>,
    closed: watch::Receiver<bool>,
}

#[async_trait]
impl DeliveryStream for MemoryDeliveryStream {
    async fn next_delivery(&mut self) -> Option<Delivery> {
        loop {
            tokio::select! {
                changed = self.closed.changed() => {
                    match changed {
                        Ok(()) if *self.closed.borrow() => return None,
                        Ok(()) => continue,
                        Err(_) => return None,
                    }
                }
                message = self.rx.recv() => {
                    let message = message?;
                    return Some(Delivery {
                        correlation_id: message.properties.correlation_id.clone(),
                        reply_to: message.properties.reply_to.clone(),
                        body: message.body,
                        acker: Box::new(MemoryAcker {
                            broker: self.broker.clone(),
                        }),
                    });
                }
            }
        }
    }
}

struct MemoryAcker {
    broker: Arc<BrokerInner>,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.broker.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
