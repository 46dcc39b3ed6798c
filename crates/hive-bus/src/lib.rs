//! ---
//! hive_section: "02-messaging-ipc-data-model"
//! hive_subsection: "module"
//! hive_type: "source"
//! hive_scope: "code"
//! hive_description: "Topic-routed cross-client message bus."
//! hive_version: "v0.1.0"
//! hive_owner: "messaging"
//! ---
//! Every platform adapter holds one [`MessageBus`]. The bus keeps a single
//! broker connection alive, declares the shared topic exchange and the
//! client's own queue, publishes [`Envelope`]s and fans inbound ones out to
//! registered listeners.
#![warn(missing_docs)]

pub mod config;
pub mod dispatcher;
pub mod envelope;
pub mod metrics;
pub mod publisher;
pub mod state;
pub mod supervisor;
pub mod topology;
pub mod transport;

/// Shared result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors surfaced by the bus to its callers.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Publish was attempted while no link is established. Nothing was written.
    #[error("not connected to the message broker")]
    NotConnected,
    /// The broker refused the write or the link dropped mid-publish.
    #[error("publish failed: {0}")]
    PublishFailed(#[source] transport::TransportError),
    /// Closing the channel or connection reported an error.
    #[error("disconnect failed: {0}")]
    DisconnectFailed(#[source] transport::TransportError),
    /// A connection attempt did not reach the connected state.
    #[error("connect failed: {0}")]
    ConnectFailed(#[source] transport::TransportError),
    /// The envelope could not be sealed or encoded.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(#[from] envelope::CodecError),
    /// Configuration was rejected before the bus started.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Metric registration failed.
    #[error("metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),
    /// The bus was shut down with [`MessageBus::disconnect`] or its task ended.
    #[error("message bus has been shut down")]
    Terminated,
}

pub use config::BusConfig;
pub use dispatcher::ListenerId;
pub use envelope::{decode, encode, CodecError, Draft, Envelope, EnvelopeKind};
pub use metrics::{log_envelope, BusMetrics, MessageDirection};
pub use state::ConnectionState;
pub use supervisor::{BusBuilder, MessageBus};
pub use topology::{Topology, BROADCAST_KEY, DEFAULT_EXCHANGE};
#[cfg(feature = "amqp")]
pub use transport::amqp::AmqpConnector;
pub use transport::memory::MemoryBroker;
pub use transport::{Connector, Link, LinkEvent, TransportError};
