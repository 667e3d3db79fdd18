//! Abstract stream transport.
//!
//! The delivery loop is written against this trait; whether events arrive
//! over the event store's native streaming protocol or the HTTP long-poll
//! API is a binding detail hidden behind it.

use super::NakAction;
use crate::config::DeviceSubscription;
use async_trait::async_trait;

/// Transport failure; any of these sends the consumer into its reconnect
/// state.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// One event handed to the delivery loop.
#[derive(Debug, Clone)]
pub struct ReceivedEvent {
    pub event_id: String,
    pub event_type: String,
    pub stream_id: String,
    /// Stream revision; strictly increasing within a subscription.
    pub position: u64,
    /// Creation time in UTC milliseconds, when the backend reports one.
    pub created_ms: Option<i64>,
    /// Raw JSON payload.
    pub data: String,
    /// Backend-specific acknowledgement hints (the long-poll binding
    /// stores its per-event ack/nack URIs here).
    pub ack_uri: Option<String>,
    pub nack_uri: Option<String>,
}

/// Fetch/ack primitives of a durable subscription backend.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Establishes or verifies the connection.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Fetches the next batch. `from` is the first wanted position; a
    /// backend that tracks the cursor server-side may ignore it.
    async fn fetch(
        &self,
        subscription: &DeviceSubscription,
        from: Option<u64>,
        max: usize,
    ) -> Result<Vec<ReceivedEvent>, TransportError>;

    async fn ack(
        &self,
        subscription: &DeviceSubscription,
        event: &ReceivedEvent,
    ) -> Result<(), TransportError>;

    /// Negative acknowledgement; the action reaches the backend verbatim.
    async fn nak(
        &self,
        subscription: &DeviceSubscription,
        event: &ReceivedEvent,
        action: NakAction,
    ) -> Result<(), TransportError>;
}
