//! ---
//! hive_section: "02-messaging-ipc-data-model"
//! hive_subsection: "module"
//! hive_type: "source"
//! hive_scope: "code"
//! hive_description: "Broker-side exchange, queue and bindings for one client."
//! hive_version: "v0.1.0"
//! hive_owner: "messaging"
//! ---
use tracing::debug;

use crate::config::BusConfig;
use crate::transport::{Link, QueueSpec, TransportError};

/// Routing key every client queue is bound to.
pub const BROADCAST_KEY: &str = "broadcast";
/// Exchange used when the configuration does not name one.
pub const DEFAULT_EXCHANGE: &str = "social.messages";
/// Per-message expiry on client queues.
pub const MESSAGE_TTL_MS: u32 = 60_000;
/// Ready-message bound on client queues.
pub const MAX_LENGTH: u32 = 1_000;

/// The durable objects one client needs on the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Shared topic exchange.
    pub exchange: String,
    /// This client's queue.
    pub queue: QueueSpec,
    /// Routing keys bound from the exchange to the queue.
    pub bindings: Vec<String>,
}

impl Topology {
    /// Topology for the client described by `config`.
    pub fn for_client(config: &BusConfig) -> Self {
        Self {
            exchange: config.exchange.clone(),
            queue: QueueSpec {
                name: config.queue_name(),
                durable: true,
                message_ttl_ms: Some(MESSAGE_TTL_MS),
                max_length: Some(MAX_LENGTH),
            },
            bindings: vec![config.client_id.clone(), BROADCAST_KEY.to_owned()],
        }
    }

    /// Declare exchange, queue and bindings. Safe to repeat on every connect.
    pub async fn declare(&self, link: &mut dyn Link) -> Result<(), TransportError> {
        link.declare_exchange(&self.exchange, true).await?;
        link.declare_queue(&self.queue).await?;
        for routing_key in &self.bindings {
            link.bind_queue(&self.queue.name, &self.exchange, routing_key)
                .await?;
        }
        debug!(
            exchange = %self.exchange,
            queue = %self.queue.name,
            bindings = ?self.bindings,
            "topology declared"
        );
        Ok(())
    }
}
