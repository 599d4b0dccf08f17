//! Resilient broker client.
//!
//! This module contains:
//! - `ConnectionManager`: sole owner of the broker session, runs the reconnect loop
//! - `Publisher`: confirmed publish that resends until the broker acknowledges
//! - `ConsumerPool`: concurrent workers with per-message acknowledgment
//! - `BrokerClient`: startup gating and graceful shutdown
//! - Transport seam: `Dialer`, `Session`, `Acknowledger`
//! - Implementations: AMQP (RabbitMQ), Mock

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tokio::sync::watch;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod client;
pub mod connection;
pub mod consumer;
pub mod mock;
pub mod processing;
pub mod publisher;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpDialer;
pub use client::BrokerClient;
pub use connection::ConnectionManager;
pub use consumer::ConsumerPool;
pub use mock::MockBroker;
pub use publisher::Publisher;

/// Content type stamped on every published envelope.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Unacknowledged deliveries the broker may hand one consumer at a time.
pub const PREFETCH_PER_WORKER: u16 = 1;

// ============================================================================
// Errors
// ============================================================================

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur during broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Topology setup failed: {0}")]
    Setup(String),

    #[error("Not connected to broker")]
    NotConnected,

    #[error("Disconnected from broker, trying to reconnect")]
    Disconnected,

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Publish not confirmed after {attempts} attempts")]
    PublishExhausted { attempts: u32 },

    #[error("Consume failed: {0}")]
    Consume(String),

    #[error("Acknowledge failed: {0}")]
    Acknowledge(String),

    #[error("Shutdown failed: {0}")]
    Shutdown(String),

    #[error("Broker client is closed")]
    Closed,

    #[error("Encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl BrokerError {
    /// Connectivity errors drive the reconnect loop and are never fatal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::Connection(_) | BrokerError::Setup(_) | BrokerError::Disconnected
        )
    }
}

/// Errors returned by domain event handlers.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

// ============================================================================
// State and topology
// ============================================================================

/// Connection state, written only by the reconnect loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Exchange, queue and bindings declared on every successful connect.
///
/// The exchange is always a durable topic exchange. When a queue is set it is
/// declared durable and bound once per routing key in `bindings`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub queue: Option<String>,
    pub bindings: Vec<String>,
}

impl Topology {
    /// Topology for a client that only publishes.
    pub fn publisher(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            queue: None,
            bindings: Vec::new(),
        }
    }

    /// Topology for a client that consumes `queue`, bound to each routing key.
    pub fn subscriber(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        bindings: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue: Some(queue.into()),
            bindings: bindings.into_iter().map(Into::into).collect(),
        }
    }
}

// ============================================================================
// Inbound messages
// ============================================================================

/// Terminal action applied to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Processed successfully.
    Ack,
    /// Seen but processing failed.
    Nack { requeue: bool },
    /// Not a message this consumer understands.
    Reject { requeue: bool },
}

/// Per-delivery acknowledgment handle supplied by the transport.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
    async fn reject(&self, requeue: bool) -> Result<()>;
}

/// A delivery owned by exactly one worker until it is settled.
pub struct InboundMessage {
    content_type: Option<String>,
    routing_key: String,
    body: Vec<u8>,
    acker: Box<dyn Acknowledger>,
}

impl InboundMessage {
    pub fn new(
        content_type: Option<String>,
        routing_key: impl Into<String>,
        body: Vec<u8>,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            content_type,
            routing_key: routing_key.into(),
            body,
            acker,
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Apply the terminal action. Consumes the message, so it can only happen once.
    pub async fn settle(self, settlement: Settlement) -> Result<()> {
        match settlement {
            Settlement::Ack => self.acker.ack().await,
            Settlement::Nack { requeue } => self.acker.nack(requeue).await,
            Settlement::Reject { requeue } => self.acker.reject(requeue).await,
        }
    }
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("content_type", &self.content_type)
            .field("routing_key", &self.routing_key)
            .field("body_len", &self.body.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Transport seam
// ============================================================================

/// Resolves once the broker confirms one publish: `true` for ack, `false` for nack.
pub type PendingConfirm = BoxFuture<'static, Result<bool>>;

/// Deliveries for one consumer registration. Ends when the channel goes away.
pub type DeliveryStream = BoxStream<'static, Result<InboundMessage>>;

/// An open connection plus channel with publisher confirms enabled.
///
/// Implementations:
/// - `AmqpSession`: RabbitMQ via lapin
/// - `MockSession`: in-memory double for tests
#[async_trait]
pub trait Session: Send + Sync {
    /// Raw send. The returned confirmation belongs to this publish only.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content_type: &str,
        body: &[u8],
    ) -> Result<PendingConfirm>;

    async fn qos(&self, prefetch: u16) -> Result<()>;

    /// Register a consumer with manual acknowledgment; exclusive, no-local and
    /// no-wait are all off.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    /// Close the channel, then the connection.
    async fn close(&self) -> Result<()>;

    /// Close notification for this session. Fresh per session.
    fn closed(&self) -> BoxFuture<'static, ()>;
}

/// Opens sessions: one dial, channel open, then topology declaration.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, url: &str, topology: &Topology) -> Result<Arc<dyn Session>>;
}

/// Resolves once `flag` is raised. A dropped sender never raises it.
pub(crate) async fn raised(flag: &mut watch::Receiver<bool>) {
    let dropped = flag.wait_for(|raised| *raised).await.is_err();
    if dropped {
        futures::future::pending::<()>().await;
    }
}

// ============================================================================
// Domain handlers
// ============================================================================

/// Capability set a consumer needs from the domain: decode, then dispatch.
pub trait EventHandler: Send + Sync + 'static {
    /// Typed events this handler understands.
    type Event: Send;

    /// Decode `payload` as the event named `kind`.
    ///
    /// `Ok(None)` means the type is not one this handler consumes; the message is rejected.
    fn decode(&self, kind: &str, payload: &str) -> serde_json::Result<Option<Self::Event>>;

    /// Process one decoded event.
    fn dispatch(&self, event: Self::Event) -> BoxFuture<'_, std::result::Result<(), HandlerError>>;
}
