//! ---
//! hive_section: "02-messaging-ipc-data-model"
//! hive_subsection: "module"
//! hive_type: "source"
//! hive_scope: "code"
//! hive_description: "Broker transport seam shared by every backend."
//! hive_version: "v0.1.0"
//! hive_owner: "messaging"
//! ---
//! A [`Connector`] opens a [`Link`]: one connection plus one channel. The bus
//! task is the only owner of a link; it never shares one across tasks.
use async_trait::async_trait;

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

/// Errors raised by a transport backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The connection could not be opened.
    #[error("connection refused: {0}")]
    Connect(String),
    /// The connection or channel is gone.
    #[error("link closed: {0}")]
    Closed(String),
    /// A referenced exchange or queue does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// A declaration conflicts with an existing object.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    /// The broker negatively acknowledged a publish.
    #[error("rejected by broker: {0}")]
    Rejected(String),
    /// Any other protocol or socket failure.
    #[error("transport io: {0}")]
    Io(String),
}

impl TransportError {
    /// Whether the error means the link can no longer be used.
    pub fn is_link_lost(&self) -> bool {
        matches!(self, TransportError::Closed(_) | TransportError::Io(_))
    }
}

/// Shape of a durable queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    /// Queue name.
    pub name: String,
    /// Survives broker restart.
    pub durable: bool,
    /// Per-message expiry in milliseconds.
    pub message_ttl_ms: Option<u32>,
    /// Maximum number of ready messages; the oldest are dropped beyond it.
    pub max_length: Option<u32>,
}

/// Transport-level metadata attached to a published frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishProperties {
    /// Survive broker restart.
    pub persistent: bool,
    /// MIME type of the body.
    pub content_type: String,
    /// Mirrors the envelope `messageId`.
    pub message_id: String,
    /// Mirrors the envelope `timestamp` (milliseconds).
    pub timestamp: u64,
}

/// A frame pushed to this client's consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    /// Broker-assigned tag used to ack or reject the frame.
    pub delivery_tag: u64,
    /// Raw body bytes.
    pub body: Vec<u8>,
    /// `message_id` property when the publisher set one.
    pub message_id: Option<String>,
    /// The broker delivered this frame before without an ack.
    pub redelivered: bool,
}

/// What a link reports while the bus waits on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A consumed frame.
    Frame(InboundFrame),
    /// The connection or channel closed without being asked to.
    Closed {
        /// Broker or socket supplied reason.
        reason: String,
    },
}

/// Opens links to a broker.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection and a channel on it.
    async fn connect(&self, url: &str) -> Result<Box<dyn Link>, TransportError>;

    /// Backend name for logs.
    fn name(&self) -> &'static str;
}

/// One open connection plus channel.
#[async_trait]
pub trait Link: Send {
    /// Declare a topic exchange. Re-declaring with the same shape succeeds.
    async fn declare_exchange(&mut self, name: &str, durable: bool) -> Result<(), TransportError>;

    /// Declare a queue. Re-declaring with the same shape succeeds.
    async fn declare_queue(&mut self, spec: &QueueSpec) -> Result<(), TransportError>;

    /// Bind `queue` to `exchange` under `routing_key`.
    async fn bind_queue(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError>;

    /// Start pushing frames from `queue` to [`Link::next_event`].
    async fn consume(&mut self, queue: &str, consumer_tag: &str) -> Result<(), TransportError>;

    /// Publish `body` and wait for the broker to accept it.
    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &PublishProperties,
    ) -> Result<(), TransportError>;

    /// Acknowledge a delivered frame.
    async fn ack(&mut self, delivery_tag: u64) -> Result<(), TransportError>;

    /// Reject a delivered frame.
    async fn reject(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError>;

    /// Wait for the next frame or an unsolicited close.
    ///
    /// Must be cancel safe: the bus races this against its request channel.
    async fn next_event(&mut self) -> LinkEvent;

    /// Close the channel.
    async fn close_channel(&mut self) -> Result<(), TransportError>;

    /// Close the connection.
    async fn close_connection(&mut self) -> Result<(), TransportError>;
}
