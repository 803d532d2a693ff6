//! Client and topology configuration types.

use std::time::Duration;

use serde::Deserialize;

use crate::packet::HeaderMap;

/// Default request timeout, matching the conventional HTTP client default.
pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(100);

/// Default callback queue expiry: 30 minutes of inactivity.
const DEFAULT_CALLBACK_QUEUE_TTL_MS: u64 = 30 * 60 * 1000;

/// AMQP exchange kind for the request exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Direct exchange: exact routing-key match.
    #[default]
    Direct,
    /// Topic exchange: pattern routing.
    Topic,
    /// Fanout exchange: routing key ignored.
    Fanout,
    /// Headers exchange: header-table routing.
    Headers,
}

impl ExchangeKind {
    /// Wire name of the exchange kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Headers => "headers",
        }
    }
}

/// Describes the server-side topology a client publishes into.
///
/// Immutable after client construction. Names derived from the descriptor
/// are stable across restarts; only the per-client callback queue carries a
/// fresh random component.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExchangeDescriptor {
    /// AMQP connection URL (e.g., amqp://localhost:5672).
    pub url: String,
    /// Service name hint; all topology names derive from it.
    pub name: String,
    /// Kind of the request exchange.
    pub kind: ExchangeKind,
    /// Whether the exchange and work queue survive a broker restart.
    pub durable: bool,
    /// Whether the exchange and work queue are deleted when unused.
    pub auto_delete: bool,
    /// Callback queue `x-expires` in milliseconds.
    pub callback_queue_ttl_ms: u64,
}

impl Default for ExchangeDescriptor {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            name: "default".to_string(),
            kind: ExchangeKind::Direct,
            durable: false,
            auto_delete: true,
            callback_queue_ttl_ms: DEFAULT_CALLBACK_QUEUE_TTL_MS,
        }
    }
}

impl ExchangeDescriptor {
    /// Create a descriptor for a named service on the given broker.
    pub fn new(url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Callback queue expiry as a `Duration`.
    pub fn callback_queue_ttl(&self) -> Duration {
        Duration::from_millis(self.callback_queue_ttl_ms)
    }
}

/// Caller-facing configuration, settable only before the first send.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Base URI used to resolve relative or absent request URIs.
    pub base_uri: Option<String>,
    /// Timeout applied when a request carries no override.
    pub default_timeout: Duration,
    /// Headers merged into every request without overwriting caller-set values.
    pub default_headers: HeaderMap,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            base_uri: None,
            default_timeout: DEFAULT_TIMEOUT,
            default_headers: HeaderMap::new(),
        }
    }
}
