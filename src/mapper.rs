//! Message-to-topology mapping policy.

use crate::packet::RequestPacket;

/// Decides how an individual request maps onto the broker topology.
///
/// Injected at client construction. The exchange itself comes from the
/// [`ExchangeDescriptor`](crate::config::ExchangeDescriptor); the mapper
/// only influences per-message routing and expiry.
pub trait MessageMapper: Send + Sync {
    /// Routing key for a request; `None` selects the default work-queue key.
    fn routing_key(&self, _request: &RequestPacket) -> Option<String> {
        None
    }

    /// Whether the broker may expire the message once the request timeout
    /// has passed. Expirable messages get a per-message TTL on publish.
    fn is_expirable(&self, _request: &RequestPacket) -> bool {
        true
    }
}

/// Default mapper: every request goes to the shared work queue and may be
/// expired by the broker at the request timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkQueueMapper;

impl MessageMapper for WorkQueueMapper {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_queue_mapper_defaults() {
        let mapper = WorkQueueMapper;
        let req = RequestPacket::get("/x");
        assert_eq!(mapper.routing_key(&req), None);
        assert!(mapper.is_expirable(&req));
    }
}
