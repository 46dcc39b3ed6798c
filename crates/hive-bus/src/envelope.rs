//! ---
//! hive_section: "02-messaging-ipc-data-model"
//! hive_subsection: "module"
//! hive_type: "source"
//! hive_scope: "code"
//! hive_description: "Envelope model and JSON wire codec."
//! hive_version: "v0.1.0"
//! hive_owner: "messaging"
//! ---
use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Errors raised while encoding, decoding or sealing an envelope.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The body is not JSON or does not have the envelope shape.
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
    /// `source` was missing or empty.
    #[error("envelope source must not be empty")]
    EmptySource,
    /// `target` was present but empty.
    #[error("envelope target must not be empty when present")]
    EmptyTarget,
}

/// Intent classification carried in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeKind {
    /// Conversational content relayed between platforms.
    Message,
    /// Something that needs attention.
    Alert,
    /// Informational update.
    Notification,
    /// Instruction for the receiving client.
    Command,
}

impl EnvelopeKind {
    /// All kinds in wire order.
    pub const ALL: [EnvelopeKind; 4] = [
        EnvelopeKind::Message,
        EnvelopeKind::Alert,
        EnvelopeKind::Notification,
        EnvelopeKind::Command,
    ];

    /// Wire representation of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::Message => "MESSAGE",
            EnvelopeKind::Alert => "ALERT",
            EnvelopeKind::Notification => "NOTIFICATION",
            EnvelopeKind::Command => "COMMAND",
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvelopeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EnvelopeKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown envelope kind: {}", s))
    }
}

/// The unit of cross-client communication.
///
/// `timestamp` and `message_id` are assigned by the publisher when a [`Draft`]
/// is sealed; callers never supply them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Identifier of the producing client.
    pub source: String,
    /// Single intended recipient; `None` means broadcast.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Intent classification.
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    /// Adapter-defined body, carried unmodified.
    pub payload: JsonValue,
    /// Creation time in milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Opaque unique token for deduplication and tracing.
    pub message_id: String,
}

impl Envelope {
    /// Whether the envelope was addressed to every client.
    pub fn is_broadcast(&self) -> bool {
        self.target.is_none()
    }

    /// The caller-controlled part of the envelope.
    pub fn to_draft(&self) -> Draft {
        Draft {
            source: Some(self.source.clone()),
            target: self.target.clone(),
            kind: self.kind,
            payload: self.payload.clone(),
        }
    }

    fn check(&self) -> Result<(), CodecError> {
        if self.source.trim().is_empty() {
            return Err(CodecError::EmptySource);
        }
        if matches!(self.target.as_deref(), Some(target) if target.trim().is_empty()) {
            return Err(CodecError::EmptyTarget);
        }
        Ok(())
    }
}

/// An outbound envelope before the bus stamps identity and time onto it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    /// Producing client; the bus client id is used when unset.
    #[serde(default)]
    pub source: Option<String>,
    /// Recipient client; `None` broadcasts.
    #[serde(default)]
    pub target: Option<String>,
    /// Intent classification.
    pub kind: EnvelopeKind,
    /// Adapter-defined body.
    pub payload: JsonValue,
}

impl Draft {
    /// Create a broadcast draft with no explicit source.
    pub fn new(kind: EnvelopeKind, payload: impl Into<JsonValue>) -> Self {
        Self {
            source: None,
            target: None,
            kind,
            payload: payload.into(),
        }
    }

    /// Shorthand for a [`EnvelopeKind::Message`] draft.
    pub fn message(payload: impl Into<JsonValue>) -> Self {
        Self::new(EnvelopeKind::Message, payload)
    }

    /// Shorthand for an [`EnvelopeKind::Alert`] draft.
    pub fn alert(payload: impl Into<JsonValue>) -> Self {
        Self::new(EnvelopeKind::Alert, payload)
    }

    /// Shorthand for a [`EnvelopeKind::Notification`] draft.
    pub fn notification(payload: impl Into<JsonValue>) -> Self {
        Self::new(EnvelopeKind::Notification, payload)
    }

    /// Shorthand for a [`EnvelopeKind::Command`] draft.
    pub fn command(payload: impl Into<JsonValue>) -> Self {
        Self::new(EnvelopeKind::Command, payload)
    }

    /// Address the draft to a single client.
    pub fn to(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Override the producing client.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Stamp a fresh timestamp and message id onto the draft.
    pub fn seal(self, default_source: &str) -> Result<Envelope, CodecError> {
        self.seal_with(default_source, now_millis(), Uuid::new_v4().to_string())
    }

    pub(crate) fn seal_with(
        self,
        default_source: &str,
        timestamp: u64,
        message_id: String,
    ) -> Result<Envelope, CodecError> {
        let envelope = Envelope {
            source: self.source.unwrap_or_else(|| default_source.to_owned()),
            target: self.target,
            kind: self.kind,
            payload: self.payload,
            timestamp,
            message_id,
        };
        envelope.check()?;
        Ok(envelope)
    }
}

/// Serialise an envelope into its UTF-8 JSON wire form.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(envelope)?)
}

/// Parse a frame body into an envelope.
///
/// Unknown fields are ignored; missing fields, an unknown `type` or an empty
/// `source` are errors.
pub fn decode(bytes: &[u8]) -> Result<Envelope, CodecError> {
    let envelope: Envelope = serde_json::from_slice(bytes)?;
    envelope.check()?;
    Ok(envelope)
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default()
}
