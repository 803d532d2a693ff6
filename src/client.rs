//! The RPC client: request engine, lifecycle, and caller surface.
//!
//! A [`Client`] serializes HTTP-shaped requests, publishes them to the
//! request exchange, and correlates responses arriving on its private
//! callback queue back to the awaiting caller. Connection loss is repaired
//! lazily: the next send restarts the supervisor.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{ClientOptions, ExchangeDescriptor};
use crate::error::{ClientError, Result};
use crate::mapper::{MessageMapper, WorkQueueMapper};
use crate::naming;
use crate::packet::{HeaderMap, RequestPacket, RequestTimeout, ResponsePacket};
use crate::pool::ChannelClass;
use crate::registry::PendingRegistry;
use crate::supervisor::Supervisor;
use crate::transport::{
    AmqpConnector, Channel, Connector, MessageProperties, Publication, QueueOptions,
};

/// Minimum gap between topology declarations.
const TOPOLOGY_DECLARE_INTERVAL_MS: u64 = 30_000;

/// Sentinel tick meaning the topology has never been declared.
const NEVER_DECLARED: u64 = u64::MAX;

/// Builder for a [`Client`].
pub struct ClientBuilder {
    descriptor: ExchangeDescriptor,
    connector: Option<Arc<dyn Connector>>,
    mapper: Option<Arc<dyn MessageMapper>>,
}

impl ClientBuilder {
    /// Start a builder for the given topology descriptor.
    pub fn new(descriptor: ExchangeDescriptor) -> Self {
        Self {
            descriptor,
            connector: None,
            mapper: None,
        }
    }

    /// Use a custom transport instead of AMQP (e.g. the memory broker).
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Use a custom message mapper.
    pub fn mapper(mut self, mapper: Arc<dyn MessageMapper>) -> Self {
        self.mapper = Some(mapper);
        self
    }

    /// Build the client. No connection is opened until the first send.
    pub fn build(self) -> Client {
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(AmqpConnector::new(&self.descriptor.url)));
        let mapper = self.mapper.unwrap_or_else(|| Arc::new(WorkQueueMapper));

        let client_id = naming::random_id();
        let callback_queue = naming::callback_queue_name(&self.descriptor, &client_id);
        let registry = Arc::new(PendingRegistry::new());
        let supervisor = Supervisor::new(
            connector,
            callback_queue.clone(),
            self.descriptor.callback_queue_ttl_ms,
            format!("burrow-client-{client_id}"),
            registry.clone(),
        );

        Client {
            inner: Arc::new(ClientInner {
                exchange: naming::exchange_name(&self.descriptor),
                request_queue: naming::request_queue_name(&self.descriptor),
                callback_queue,
                client_id,
                descriptor: self.descriptor,
                mapper,
                supervisor,
                registry,
                options: Mutex::new(ClientOptions::default()),
                started: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                created_at: Instant::now(),
                last_declare_ms: AtomicU64::new(NEVER_DECLARED),
                declare_guard: tokio::sync::Mutex::new(()),
            }),
        }
    }
}

struct ClientInner {
    descriptor: ExchangeDescriptor,
    mapper: Arc<dyn MessageMapper>,
    client_id: String,
    exchange: String,
    request_queue: String,
    callback_queue: String,
    supervisor: Supervisor,
    registry: Arc<PendingRegistry>,
    options: Mutex<ClientOptions>,
    started: AtomicBool,
    disposed: AtomicBool,
    created_at: Instant,
    /// Milliseconds since `created_at` of the last topology declare, or
    /// `NEVER_DECLARED`.
    last_declare_ms: AtomicU64,
    /// Serializes topology declaration within a stale window.
    declare_guard: tokio::sync::Mutex<()>,
}

/// RPC client tunneling HTTP-shaped exchanges over a message broker.
///
/// Cloning is cheap and shares the underlying state; all clones observe
/// the same lifecycle.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Create a client for the given descriptor, connecting over AMQP.
    pub fn new(descriptor: ExchangeDescriptor) -> Self {
        ClientBuilder::new(descriptor).build()
    }

    /// Start a builder for custom wiring.
    pub fn builder(descriptor: ExchangeDescriptor) -> ClientBuilder {
        ClientBuilder::new(descriptor)
    }

    /// This client's random identity, embedded in its callback queue name.
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Name of this client's private callback queue.
    pub fn callback_queue(&self) -> &str {
        &self.inner.callback_queue
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.registry.len()
    }

    /// Whether the client has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Set the base URI used to resolve relative request URIs.
    ///
    /// Fails with `InvalidState` after the first send, `Disposed` after
    /// disposal.
    pub fn set_base_uri(&self, base_uri: impl Into<String>) -> Result<()> {
        self.config_guard()?;
        self.inner.options.lock().unwrap().base_uri = Some(base_uri.into());
        Ok(())
    }

    /// Set the timeout applied to requests without an override.
    pub fn set_default_timeout(&self, timeout: Duration) -> Result<()> {
        self.config_guard()?;
        self.inner.options.lock().unwrap().default_timeout = timeout;
        Ok(())
    }

    /// Set headers merged into every request without overwriting
    /// caller-set values.
    pub fn set_default_headers(&self, headers: HeaderMap) -> Result<()> {
        self.config_guard()?;
        self.inner.options.lock().unwrap().default_headers = headers;
        Ok(())
    }

    /// GET a URI.
    pub async fn get(&self, uri: impl Into<String>) -> Result<ResponsePacket> {
        self.send(RequestPacket::get(uri), CancellationToken::new())
            .await
    }

    /// POST a body to a URI.
    pub async fn post(
        &self,
        uri: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> Result<ResponsePacket> {
        self.send(RequestPacket::post(uri, body), CancellationToken::new())
            .await
    }

    /// PUT a body to a URI.
    pub async fn put(
        &self,
        uri: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> Result<ResponsePacket> {
        self.send(RequestPacket::put(uri, body), CancellationToken::new())
            .await
    }

    /// DELETE a URI.
    pub async fn delete(&self, uri: impl Into<String>) -> Result<ResponsePacket> {
        self.send(RequestPacket::delete(uri), CancellationToken::new())
            .await
    }

    /// Send a request and await its response.
    ///
    /// The returned future completes with whichever fires first: the
    /// response delivery, the request timer (`Timeout`), the caller's
    /// token (`Canceled`), or disposal (`Disposed`).
    pub async fn send(
        &self,
        mut request: RequestPacket,
        cancel: CancellationToken,
    ) -> Result<ResponsePacket> {
        let inner = &self.inner;

        if request.method.trim().is_empty() {
            return Err(ClientError::InvalidArgument(
                "request method is empty".to_string(),
            ));
        }
        let timeout = self.prepare(&mut request)?;
        if inner.disposed.load(Ordering::SeqCst) {
            return Err(ClientError::Disposed);
        }
        // Configuration freezes at the first request that passes the
        // preconditions.
        inner.started.store(true, Ordering::SeqCst);

        inner.supervisor.ensure_started().await?;

        let correlation_id = naming::random_id();
        let routing_key = inner
            .mapper
            .routing_key(&request)
            .unwrap_or_else(naming::default_routing_key);
        let expiration_ms = match timeout {
            RequestTimeout::After(d) if inner.mapper.is_expirable(&request) => {
                Some(d.as_millis().min(i32::MAX as u128) as u64)
            }
            _ => None,
        };
        let properties = MessageProperties {
            correlation_id: Some(correlation_id.clone()),
            reply_to: Some(inner.callback_queue.clone()),
            expiration_ms,
        };
        let body = request.serialize()?;

        let receiver = if timeout == RequestTimeout::FireAndForget {
            None
        } else {
            let rx = inner.registry.register(&correlation_id)?;
            let watcher = tokio::spawn(watch_waiter(
                inner.registry.clone(),
                correlation_id.clone(),
                timeout,
                cancel.clone(),
            ));
            inner.registry.attach_watcher(&correlation_id, watcher);
            Some(rx)
        };

        debug!(
            correlation_id = %correlation_id,
            method = %request.method,
            uri = %request.uri,
            "publishing request"
        );

        if let Err(e) = self.publish(&routing_key, properties, body).await {
            inner.registry.remove(&correlation_id);
            return Err(e);
        }

        match receiver {
            None => Ok(ResponsePacket::empty_ok()),
            Some(rx) => match rx.await {
                Ok(outcome) => outcome,
                // The registry always fulfils its slots; a dropped sender
                // means the client state itself went away.
                Err(_) => Err(ClientError::Disposed),
            },
        }
    }

    /// Complete every in-flight request with `Canceled` without tearing
    /// down the connection or consumer.
    pub fn cancel_pending_requests(&self) {
        self.inner.registry.cancel_all(|| ClientError::Canceled);
    }

    /// Dispose the client: fail all pending requests with `Disposed`, stop
    /// the consumer, and close the pool and connection. Idempotent; all
    /// subsequent sends fail with `Disposed`.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.registry.cancel_all(|| ClientError::Disposed);
        self.inner.supervisor.dispose().await;
        info!(client_id = %self.inner.client_id, "client disposed");
    }

    /// Resolve the request URI and merge default headers; returns the
    /// effective timeout.
    fn prepare(&self, request: &mut RequestPacket) -> Result<RequestTimeout> {
        let options = self.inner.options.lock().unwrap().clone();

        if request.uri.is_empty() {
            match &options.base_uri {
                Some(base) => request.uri = base.clone(),
                None => {
                    return Err(ClientError::InvalidState(
                        "request has no URI and no base URI is set".to_string(),
                    ))
                }
            }
        } else if !request.uri.contains("://") {
            if let Some(base) = &options.base_uri {
                request.uri = format!(
                    "{}/{}",
                    base.trim_end_matches('/'),
                    request.uri.trim_start_matches('/')
                );
            }
        }

        request.headers.merge_missing(&options.default_headers);

        let timeout = request
            .options
            .timeout
            .unwrap_or(RequestTimeout::After(options.default_timeout));
        // A zero duration means fire-and-forget.
        Ok(match timeout {
            RequestTimeout::After(d) if d.is_zero() => RequestTimeout::FireAndForget,
            other => other,
        })
    }

    async fn publish(
        &self,
        routing_key: &str,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> Result<()> {
        let pool = self.inner.supervisor.pool()?;
        let lease = pool.get(ChannelClass::Publisher).await?;
        let result = async {
            self.declare_topology_if_stale(lease.channel()).await?;
            lease
                .channel()
                .publish(Publication {
                    exchange: self.inner.exchange.clone(),
                    routing_key: routing_key.to_string(),
                    properties,
                    body,
                })
                .await
        }
        .await;
        lease.release().await;
        result
    }

    fn topology_stale(&self) -> bool {
        let last = self.inner.last_declare_ms.load(Ordering::SeqCst);
        last == NEVER_DECLARED
            || self.elapsed_ms().saturating_sub(last) > TOPOLOGY_DECLARE_INTERVAL_MS
    }

    fn elapsed_ms(&self) -> u64 {
        self.inner.created_at.elapsed().as_millis() as u64
    }

    /// Re-declare the exchange and work queue if the last declaration is
    /// older than the stale window. A dedicated guard serializes declares
    /// so only one proceeds per window.
    async fn declare_topology_if_stale(&self, channel: &Arc<dyn Channel>) -> Result<()> {
        if !self.topology_stale() {
            return Ok(());
        }
        let _guard = self.inner.declare_guard.lock().await;
        if !self.topology_stale() {
            return Ok(());
        }
        self.inner
            .last_declare_ms
            .store(self.elapsed_ms(), Ordering::SeqCst);

        let descriptor = &self.inner.descriptor;
        channel
            .declare_exchange(
                &self.inner.exchange,
                descriptor.kind,
                descriptor.durable,
                descriptor.auto_delete,
            )
            .await?;
        channel
            .declare_queue(
                &self.inner.request_queue,
                QueueOptions {
                    durable: descriptor.durable,
                    exclusive: false,
                    auto_delete: descriptor.auto_delete,
                    expires_ms: None,
                },
            )
            .await?;
        channel
            .bind_queue(
                &self.inner.request_queue,
                &self.inner.exchange,
                &naming::default_routing_key(),
            )
            .await?;

        debug!(exchange = %self.inner.exchange, "topology declared");
        Ok(())
    }

    fn config_guard(&self) -> Result<()> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(ClientError::Disposed);
        }
        if self.inner.started.load(Ordering::SeqCst) {
            return Err(ClientError::InvalidState(
                "configuration is frozen after the first send".to_string(),
            ));
        }
        Ok(())
    }
}

/// Complete the waiter when its timer fires or its token cancels,
/// whichever comes first. Aborted by the registry when the waiter reaches
/// a terminal state some other way.
async fn watch_waiter(
    registry: Arc<PendingRegistry>,
    correlation_id: String,
    timeout: RequestTimeout,
    cancel: CancellationToken,
) {
    let timer = async {
        match timeout {
            RequestTimeout::After(d) => tokio::time::sleep(d).await,
            _ => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = timer => {
            registry.complete(&correlation_id, Err(ClientError::Timeout));
        }
        _ = cancel.cancelled() => {
            registry.complete(&correlation_id, Err(ClientError::Canceled));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryBroker;

    fn memory_client() -> (MemoryBroker, Client) {
        let broker = MemoryBroker::new();
        let descriptor = ExchangeDescriptor::new("amqp://unused", "test");
        let client = Client::builder(descriptor)
            .connector(broker.connector())
            .build();
        (broker, client)
    }

    #[tokio::test]
    async fn test_empty_method_is_invalid_argument() {
        let (_broker, client) = memory_client();
        let err = client
            .send(RequestPacket::new("", "/x"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_missing_uri_without_base_is_invalid_state() {
        let (_broker, client) = memory_client();
        let err = client
            .send(RequestPacket::new("GET", ""), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_relative_uri_resolves_against_base() {
        let (broker, client) = memory_client();
        client.set_base_uri("http://svc.internal/api/").unwrap();
        let _ = client
            .send(
                RequestPacket::get("/orders").with_timeout(RequestTimeout::FireAndForget),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let published = broker.publications();
        let request = RequestPacket::deserialize(&published.last().unwrap().body).unwrap();
        assert_eq!(request.uri, "http://svc.internal/api/orders");
    }

    #[tokio::test]
    async fn test_default_headers_do_not_overwrite_request_headers() {
        let (broker, client) = memory_client();
        let mut defaults = HeaderMap::new();
        defaults.set("Accept", "text/html");
        defaults.set("User-Agent", "burrow");
        client.set_default_headers(defaults).unwrap();

        let request = RequestPacket::get("http://x/y")
            .with_header("Accept", "application/json")
            .with_timeout(RequestTimeout::FireAndForget);
        client.send(request, CancellationToken::new()).await.unwrap();

        let published = broker.publications();
        let wire = RequestPacket::deserialize(&published.last().unwrap().body).unwrap();
        assert_eq!(wire.headers.get("Accept"), Some("application/json"));
        assert_eq!(wire.headers.get("User-Agent"), Some("burrow"));
    }

    #[tokio::test]
    async fn test_config_frozen_after_first_send() {
        let (_broker, client) = memory_client();
        client.set_base_uri("http://a").unwrap();

        client
            .send(
                RequestPacket::get("http://x/y").with_timeout(RequestTimeout::FireAndForget),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let err = client.set_base_uri("http://b").unwrap_err();
        assert!(matches!(err, ClientError::InvalidState(_)));
        let err = client
            .set_default_timeout(Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_config_rejected_after_dispose() {
        let (_broker, client) = memory_client();
        client.dispose().await;
        let err = client.set_base_uri("http://a").unwrap_err();
        assert!(matches!(err, ClientError::Disposed));
    }

    #[tokio::test]
    async fn test_zero_duration_timeout_is_fire_and_forget() {
        let (broker, client) = memory_client();
        let response = client
            .send(
                RequestPacket::get("http://x/y")
                    .with_timeout(RequestTimeout::After(Duration::ZERO)),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert!(response.body.is_empty());
        assert_eq!(client.pending_requests(), 0);
        assert_eq!(broker.publications().len(), 1);
    }

    #[tokio::test]
    async fn test_expirable_request_carries_message_ttl() {
        let (broker, client) = memory_client();
        // No responder; the send times out, which is fine — the publication
        // record is what is under test.
        let outcome = client
            .send(
                RequestPacket::get("http://x/y")
                    .with_timeout(RequestTimeout::After(Duration::from_millis(40))),
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(outcome, Err(ClientError::Timeout)));

        let published = broker.publications();
        assert_eq!(published.last().unwrap().expiration_ms, Some(40));
    }

    #[tokio::test]
    async fn test_topology_declared_once_within_window() {
        let (broker, client) = memory_client();
        for _ in 0..5 {
            client
                .send(
                    RequestPacket::get("http://x/y").with_timeout(RequestTimeout::FireAndForget),
                    CancellationToken::new(),
                )
                .await
                .unwrap();
        }
        assert_eq!(broker.exchange_declare_count(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_broker_surfaces_from_send() {
        let (broker, client) = memory_client();
        broker.set_unreachable(true);
        let err = client
            .send(
                RequestPacket::get("http://x/y").with_timeout(RequestTimeout::FireAndForget),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::BrokerUnreachable(_)));
        assert_eq!(client.pending_requests(), 0);
    }
}
