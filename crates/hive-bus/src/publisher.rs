//! ---
//! hive_section: "02-messaging-ipc-data-model"
//! hive_subsection: "module"
//! hive_type: "source"
//! hive_scope: "code"
//! hive_description: "Outbound envelope sealing, routing and publishing."
//! hive_version: "v0.1.0"
//! hive_owner: "messaging"
//! ---
use crate::envelope::{self, CodecError, Draft, Envelope};
use crate::topology::BROADCAST_KEY;
use crate::transport::{Link, PublishProperties, TransportError};

/// MIME type of every published body.
pub const CONTENT_TYPE: &str = "application/json";

/// A sealed envelope ready to hand to a link.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    /// The envelope as it will be seen by receivers.
    pub envelope: Envelope,
    /// Encoded body.
    pub body: Vec<u8>,
    /// Exchange routing key.
    pub routing_key: String,
    /// Transport metadata mirroring the envelope.
    pub properties: PublishProperties,
}

/// Routing key for an envelope: its target, or [`BROADCAST_KEY`].
pub fn routing_key(envelope: &Envelope) -> &str {
    envelope.target.as_deref().unwrap_or(BROADCAST_KEY)
}

/// Seal `draft` for `client_id` and encode it.
pub fn prepare(draft: Draft, client_id: &str) -> Result<Outbound, CodecError> {
    let envelope = draft.seal(client_id)?;
    finish(envelope)
}

fn finish(envelope: Envelope) -> Result<Outbound, CodecError> {
    let body = envelope::encode(&envelope)?;
    let properties = PublishProperties {
        persistent: true,
        content_type: CONTENT_TYPE.to_owned(),
        message_id: envelope.message_id.clone(),
        timestamp: envelope.timestamp,
    };
    Ok(Outbound {
        routing_key: routing_key(&envelope).to_owned(),
        envelope,
        body,
        properties,
    })
}

/// Publish a prepared envelope on `exchange`.
pub async fn send(
    link: &mut dyn Link,
    exchange: &str,
    outbound: &Outbound,
) -> Result<(), TransportError> {
    link.publish(
        exchange,
        &outbound.routing_key,
        &outbound.body,
        &outbound.properties,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeKind;
    use serde_json::json;

    #[test]
    fn broadcast_and_direct_routing() {
        let broadcast = prepare(Draft::message(json!({"text": "hi"})), "telegram").unwrap();
        assert_eq!(broadcast.routing_key, "broadcast");

        let direct = prepare(Draft::alert(json!({})).to("discord"), "telegram").unwrap();
        assert_eq!(direct.routing_key, "discord");
        assert_eq!(direct.envelope.kind, EnvelopeKind::Alert);
    }

    #[test]
    fn properties_mirror_envelope() {
        let outbound = prepare(Draft::notification(json!([1, 2])), "email").unwrap();
        assert!(outbound.properties.persistent);
        assert_eq!(outbound.properties.content_type, "application/json");
        assert_eq!(outbound.properties.message_id, outbound.envelope.message_id);
        assert_eq!(outbound.properties.timestamp, outbound.envelope.timestamp);
        assert_eq!(outbound.envelope.source, "email");

        let decoded = envelope::decode(&outbound.body).unwrap();
        assert_eq!(decoded, outbound.envelope);
    }

    #[test]
    fn fixed_identity_is_carried_through() {
        let envelope = Draft::command(json!({"op": "sync"}))
            .seal_with("twitter", 42, "fixed-id".into())
            .unwrap();
        let outbound = finish(envelope).unwrap();
        assert_eq!(outbound.properties.timestamp, 42);
        assert_eq!(outbound.properties.message_id, "fixed-id");
    }

    #[test]
    fn empty_target_is_refused_before_io() {
        assert!(matches!(
            prepare(Draft::message(json!({})).to(""), "email"),
            Err(CodecError::EmptyTarget)
        ));
    }
}
