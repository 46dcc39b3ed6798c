//! ---
//! hive_section: "05-networking-external-interfaces"
//! hive_subsection: "binary"
//! hive_type: "source"
//! hive_scope: "code"
//! hive_description: "Streams inbound envelopes to stdout."
//! hive_version: "v0.1.0"
//! hive_owner: "messaging"
//! ---
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use hive_bus::{Envelope, EnvelopeKind, MessageBus};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::info;

use crate::{connect_within, shutdown_signal, BusArgs};

#[derive(Debug, Args)]
pub struct ListenCommand {
    /// Only print envelopes of this kind.
    #[arg(long, value_name = "KIND")]
    kind: Option<EnvelopeKind>,
}

impl ListenCommand {
    /// Subscribe on `bus`, then connect it.
    ///
    /// The queue backlog is delivered as soon as the consumer attaches, so
    /// the subscription must exist before the connection does.
    async fn attach(
        &self,
        bus: &MessageBus,
        limit: Duration,
    ) -> Result<UnboundedReceiver<Envelope>> {
        let inbound = match self.kind {
            Some(kind) => bus.subscribe_kind(kind)?,
            None => bus.subscribe()?,
        };
        connect_within(bus, limit).await?;
        Ok(inbound)
    }

    pub async fn execute(self, args: &BusArgs) -> Result<()> {
        let config = args.resolve()?;
        let bus = MessageBus::builder(config).spawn()?;
        let mut inbound = self.attach(&bus, args.connect_timeout()).await?;
        info!(
            client_id = %bus.config().client_id,
            kind = self.kind.map(|k| k.as_str()).unwrap_or("*"),
            "listening for envelopes"
        );

        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                envelope = inbound.recv() => match envelope {
                    Some(envelope) => println!("{}", serde_json::to_string(&envelope)?),
                    None => break,
                },
            }
        }

        info!("shutting down listener");
        bus.disconnect().await.context("disconnect failed")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use hive_bus::{BusConfig, Draft, MemoryBroker};
    use serde_json::json;

    use super::*;

    fn bus(broker: &MemoryBroker, client_id: &str) -> MessageBus {
        MessageBus::builder(BusConfig::new("memory://hive", client_id))
            .connector(Arc::new(broker.clone()))
            .spawn()
            .unwrap()
    }

    #[tokio::test]
    async fn backlog_reaches_the_listener() {
        let broker = MemoryBroker::new();
        let offline = bus(&broker, "discord");
        offline.connect().await.unwrap();
        offline.disconnect().await.unwrap();

        let sender = bus(&broker, "telegram");
        sender.connect().await.unwrap();
        sender
            .publish(Draft::command(json!({"op": "resync"})).to("discord"))
            .await
            .unwrap();
        assert_eq!(broker.queue_depth("social.messages.discord"), Some(1));

        let listener = bus(&broker, "discord");
        let command = ListenCommand { kind: None };
        let mut inbound = command
            .attach(&listener, Duration::from_secs(1))
            .await
            .unwrap();

        let envelope = inbound.recv().await.unwrap();
        assert_eq!(envelope.kind, EnvelopeKind::Command);
        assert_eq!(envelope.payload, json!({"op": "resync"}));
    }

    #[tokio::test]
    async fn kind_filter_applies_to_backlog() {
        let broker = MemoryBroker::new();
        let offline = bus(&broker, "discord");
        offline.connect().await.unwrap();
        offline.disconnect().await.unwrap();

        let sender = bus(&broker, "telegram");
        sender.connect().await.unwrap();
        sender.publish(Draft::message(json!({})).to("discord")).await.unwrap();
        sender.publish(Draft::alert(json!({"n": 2})).to("discord")).await.unwrap();

        let listener = bus(&broker, "discord");
        let command = ListenCommand {
            kind: Some(EnvelopeKind::Alert),
        };
        let mut inbound = command
            .attach(&listener, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(inbound.recv().await.unwrap().payload, json!({"n": 2}));
        assert!(inbound.try_recv().is_err());
    }
}
