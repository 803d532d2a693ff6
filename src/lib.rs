//! burrow — HTTP-shaped request/response RPC over AMQP 0-9-1.
//!
//! Callers submit HTTP-like requests; the client serializes them, publishes
//! to a request exchange, and correlates response messages delivered to a
//! per-client callback queue back to the awaiting caller. Timeouts,
//! cancellation, and disposal each complete a pending request at most once.
//!
//! ```ignore
//! let client = Client::new(ExchangeDescriptor::new("amqp://localhost:5672", "orders"));
//! let response = client.get("http://orders.internal/orders/42").await?;
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod mapper;
pub mod naming;
pub mod packet;
pub mod pool;
mod registry;
mod supervisor;
pub mod transport;

pub use client::{Client, ClientBuilder};
pub use config::{ClientOptions, ExchangeDescriptor, ExchangeKind};
pub use error::{ClientError, Result};
pub use mapper::{MessageMapper, WorkQueueMapper};
pub use packet::{HeaderMap, RequestOptions, RequestPacket, RequestTimeout, ResponsePacket};

// Cancellation tokens appear in the `send` signature; re-exported so
// callers need not depend on tokio-util directly.
pub use tokio_util::sync::CancellationToken;
