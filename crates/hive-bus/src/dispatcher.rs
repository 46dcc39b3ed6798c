//! ---
//! hive_section: "02-messaging-ipc-data-model"
//! hive_subsection: "module"
//! hive_type: "source"
//! hive_scope: "code"
//! hive_description: "Inbound frame decoding and local listener fan-out."
//! hive_version: "v0.1.0"
//! hive_owner: "messaging"
//! ---
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

use crate::envelope::{self, CodecError, Envelope, EnvelopeKind};

/// Callback invoked for each dispatched envelope.
pub type Listener = Box<dyn Fn(&Envelope) + Send + 'static>;

/// Handle returned when a listener is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

static NEXT_LISTENER: AtomicU64 = AtomicU64::new(1);

impl ListenerId {
    pub(crate) fn next() -> Self {
        Self(NEXT_LISTENER.fetch_add(1, Ordering::Relaxed))
    }
}

pub(crate) enum Sink {
    Callback(Listener),
    Channel(UnboundedSender<Envelope>),
}

struct Entry {
    id: ListenerId,
    filter: Option<EnvelopeKind>,
    sink: Sink,
}

/// What happened to an inbound frame.
#[derive(Debug)]
pub enum Outcome {
    /// Decoded and handed to `listeners` listeners. Ack it.
    Dispatched {
        /// The decoded envelope.
        envelope: Envelope,
        /// Listeners that saw it.
        listeners: usize,
    },
    /// Decoded but produced by this client. Ack it without dispatching.
    OwnBroadcast(Envelope),
    /// Not an envelope. Reject it without requeue.
    Malformed(CodecError),
}

/// Listener registry for one bus, in registration order.
pub struct Dispatcher {
    client_id: String,
    echo_own: bool,
    entries: Vec<Entry>,
}

impl Dispatcher {
    /// Registry for `client_id`; `echo_own` dispatches this client's own envelopes.
    pub fn new(client_id: impl Into<String>, echo_own: bool) -> Self {
        Self {
            client_id: client_id.into(),
            echo_own,
            entries: Vec::new(),
        }
    }

    /// Register `sink` under an id allocated by the caller.
    pub(crate) fn insert(&mut self, id: ListenerId, filter: Option<EnvelopeKind>, sink: Sink) {
        self.entries.push(Entry { id, filter, sink });
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != id);
        self.entries.len() != before
    }

    /// Registered listeners.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decode `body` and hand the envelope to every matching listener.
    pub fn handle(&mut self, body: &[u8]) -> Outcome {
        let envelope = match envelope::decode(body) {
            Ok(envelope) => envelope,
            Err(err) => return Outcome::Malformed(err),
        };
        if !self.echo_own && envelope.source == self.client_id {
            return Outcome::OwnBroadcast(envelope);
        }
        let listeners = self.dispatch(&envelope);
        Outcome::Dispatched {
            envelope,
            listeners,
        }
    }

    fn dispatch(&mut self, envelope: &Envelope) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();
        for entry in &self.entries {
            if entry.filter.is_some_and(|kind| kind != envelope.kind) {
                continue;
            }
            match &entry.sink {
                Sink::Callback(listener) => {
                    let result = panic::catch_unwind(AssertUnwindSafe(|| listener(envelope)));
                    if result.is_err() {
                        warn!(
                            listener = entry.id.0,
                            message_id = %envelope.message_id,
                            "listener panicked; continuing with the next one"
                        );
                    }
                }
                Sink::Channel(sender) => {
                    if sender.send(envelope.clone()).is_err() {
                        closed.push(entry.id);
                        continue;
                    }
                }
            }
            delivered += 1;
        }
        for id in closed {
            self.remove(id);
        }
        delivered
    }
}
