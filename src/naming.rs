//! Topology naming and correlation ID generation.
//!
//! Names are deterministic functions of the exchange descriptor so that
//! clients and servers agree on topology across restarts. The callback
//! queue is the exception: it embeds a per-client random component so each
//! client owns a private queue.

use uuid::Uuid;

use crate::config::ExchangeDescriptor;

/// Namespace prefix for all burrow topology names.
const NAME_PREFIX: &str = "burrow";

/// Routing key for the shared request work queue.
const WORK_QUEUE_ROUTING_KEY: &str = "requests";

/// Name of the request exchange for a descriptor.
pub fn exchange_name(descriptor: &ExchangeDescriptor) -> String {
    format!("{}.{}", NAME_PREFIX, descriptor.name)
}

/// Name of the shared work queue servers consume requests from.
pub fn request_queue_name(descriptor: &ExchangeDescriptor) -> String {
    format!("{}.{}.requests", NAME_PREFIX, descriptor.name)
}

/// Name of a client's private callback queue.
pub fn callback_queue_name(descriptor: &ExchangeDescriptor, client_id: &str) -> String {
    format!("{}.{}.callback.{}", NAME_PREFIX, descriptor.name, client_id)
}

/// Routing key used when the message mapper does not supply one.
pub fn default_routing_key() -> String {
    WORK_QUEUE_ROUTING_KEY.to_string()
}

/// Fresh random identifier with 122 bits of entropy.
///
/// Used both for correlation IDs and for the per-client queue component.
pub fn random_id() -> String {
    Uuid::new_v4().simple().to_string()
}
