//! ---
//! hive_section: "05-networking-external-interfaces"
//! hive_subsection: "binary"
//! hive_type: "source"
//! hive_scope: "code"
//! hive_description: "One-shot envelope publishing."
//! hive_version: "v0.1.0"
//! hive_owner: "messaging"
//! ---
use anyhow::{Context, Result};
use clap::Args;
use hive_bus::{Draft, EnvelopeKind, MessageBus};
use serde_json::Value as JsonValue;
use tracing::info;

use crate::{connect_within, BusArgs};

#[derive(Debug, Args)]
pub struct PublishCommand {
    /// Envelope kind: MESSAGE, ALERT, NOTIFICATION or COMMAND.
    #[arg(long, value_name = "KIND", default_value = "MESSAGE")]
    kind: EnvelopeKind,

    /// Payload as a JSON document.
    #[arg(long, value_name = "JSON")]
    payload: String,

    /// Recipient client id; broadcast when omitted.
    #[arg(long, value_name = "ID")]
    target: Option<String>,

    /// Source client id; defaults to the bus client id.
    #[arg(long, value_name = "ID")]
    source: Option<String>,
}

impl PublishCommand {
    fn draft(&self) -> Result<Draft> {
        let payload: JsonValue =
            serde_json::from_str(&self.payload).context("--payload must be valid JSON")?;
        let mut draft = Draft::new(self.kind, payload);
        if let Some(target) = &self.target {
            draft = draft.to(target.clone());
        }
        if let Some(source) = &self.source {
            draft = draft.with_source(source.clone());
        }
        Ok(draft)
    }

    pub async fn execute(self, args: &BusArgs) -> Result<()> {
        let draft = self.draft()?;
        let config = args.resolve()?;
        let bus = MessageBus::builder(config).spawn()?;
        connect_within(&bus, args.connect_timeout()).await?;

        let published = bus.publish(draft).await;
        let closed = bus.disconnect().await;
        let envelope = published.context("publish failed")?;
        closed.context("disconnect failed")?;

        info!(message_id = %envelope.message_id, "envelope published");
        println!("{}", serde_json::to_string(&envelope)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(payload: &str) -> PublishCommand {
        PublishCommand {
            kind: EnvelopeKind::Alert,
            payload: payload.into(),
            target: Some("discord".into()),
            source: None,
        }
    }

    #[test]
    fn builds_directed_draft() {
        let draft = command(r#"{"text":"hi"}"#).draft().unwrap();
        assert_eq!(draft.kind, EnvelopeKind::Alert);
        assert_eq!(draft.target.as_deref(), Some("discord"));
        assert_eq!(draft.source, None);
        assert_eq!(draft.payload["text"], "hi");
    }

    #[test]
    fn rejects_non_json_payload() {
        let err = command("text: hi").draft().unwrap_err();
        assert!(err.to_string().contains("--payload"));
    }
}
