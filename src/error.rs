//! Error types for the burrow client library.

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur during client operations.
///
/// Every error surfaces through the future returned by
/// [`Client::send`](crate::Client::send); the precondition variants
/// (`InvalidArgument`, `InvalidState`, `Disposed`) are produced before any
/// message is published.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// The caller supplied an unusable request.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The client is not in a state that permits the operation.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The client has been disposed.
    #[error("client is disposed")]
    Disposed,

    /// A broker connection could not be established.
    #[error("broker unreachable: {0}")]
    BrokerUnreachable(String),

    /// The request timer fired before a response delivery arrived.
    #[error("request timed out")]
    Timeout,

    /// The caller's cancellation token triggered.
    #[error("request canceled")]
    Canceled,

    /// The response body could not be deserialized.
    #[error("bad response: {0}")]
    BadResponse(String),

    /// The broker rejected the publish or the channel closed mid-publish.
    #[error("publish failed: {0}")]
    PublishFailed(String),

    /// A broker operation other than publish failed (declare, bind, consume, ack).
    #[error("broker error: {0}")]
    Broker(String),

    /// A correlation ID collided with a live waiter. Correlation IDs carry
    /// 122 bits of entropy, so this indicates a programmer error.
    #[error("correlation id already registered: {0}")]
    AlreadyRegistered(String),
}

impl ClientError {
    /// Returns true if the request timed out.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout)
    }

    /// Returns true if the request was canceled by the caller's token.
    pub fn is_canceled(&self) -> bool {
        matches!(self, ClientError::Canceled)
    }

    /// Returns true if the client was disposed.
    pub fn is_disposed(&self) -> bool {
        matches!(self, ClientError::Disposed)
    }

    /// Returns true if the error came from the broker side (connection,
    /// publish, or any other wire operation).
    pub fn is_broker_error(&self) -> bool {
        matches!(
            self,
            ClientError::BrokerUnreachable(_)
                | ClientError::PublishFailed(_)
                | ClientError::Broker(_)
        )
    }
}
