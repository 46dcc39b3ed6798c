//! ---
//! hive_section: "02-messaging-ipc-data-model"
//! hive_subsection: "module"
//! hive_type: "source"
//! hive_scope: "code"
//! hive_description: "In-process topic broker used for tests and local runs."
//! hive_version: "v0.1.0"
//! hive_owner: "messaging"
//! ---
//! [`MemoryBroker`] behaves like a single-node AMQP broker restricted to what
//! the bus uses: topic exchanges, durable queues with TTL and max-length,
//! one consumer per queue, ack and reject. Unacknowledged deliveries go back
//! to the head of their queue when the owning link closes.
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{
    Connector, InboundFrame, Link, LinkEvent, PublishProperties, QueueSpec, TransportError,
};

/// Counters describing everything the broker has seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Calls to [`Connector::connect`], refused ones included.
    pub connect_attempts: u64,
    /// Links successfully opened.
    pub connections_opened: u64,
    /// Links closed by their owner through `close_connection`.
    pub connections_closed: u64,
    /// Exchange declarations accepted.
    pub exchange_declares: u64,
    /// Queue declarations accepted.
    pub queue_declares: u64,
    /// Frames accepted from link publishes.
    pub published: u64,
    /// Deliveries rejected without requeue.
    pub discarded: u64,
    /// Ready messages dropped on TTL expiry.
    pub expired: u64,
    /// Ready messages dropped from the head on max-length overflow.
    pub overflowed: u64,
}

#[derive(Debug, Clone)]
struct Stored {
    body: Vec<u8>,
    message_id: Option<String>,
    expires_at: Option<Instant>,
    redelivered: bool,
}

impl Stored {
    fn frame(&self, delivery_tag: u64) -> InboundFrame {
        InboundFrame {
            delivery_tag,
            body: self.body.clone(),
            message_id: self.message_id.clone(),
            redelivered: self.redelivered,
        }
    }
}

#[derive(Debug)]
struct Unacked {
    link: u64,
    message: Stored,
}

#[derive(Debug)]
struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<Stored>,
    unacked: HashMap<u64, Unacked>,
    consumer: Option<u64>,
}

#[derive(Debug)]
struct ExchangeState {
    durable: bool,
    bindings: Vec<(String, String)>,
}

#[derive(Debug)]
struct LinkSlot {
    events: mpsc::UnboundedSender<LinkEvent>,
    channel_open: bool,
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    links: HashMap<u64, LinkSlot>,
    next_link: u64,
    next_tag: u64,
    refuse_connections: bool,
    fail_next_connects: usize,
    fail_next_declares: usize,
    nack_next_publishes: usize,
    fail_next_closes: usize,
    stats: BrokerStats,
}

impl BrokerState {
    fn take_declare_failure(&mut self) -> Result<(), TransportError> {
        if self.fail_next_declares > 0 {
            self.fail_next_declares -= 1;
            return Err(TransportError::Io("injected declaration failure".into()));
        }
        Ok(())
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, TransportError> {
        let exchange = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| TransportError::NotFound(format!("exchange {exchange}")))?;
        let mut targets: Vec<String> = Vec::new();
        for (queue, pattern) in &exchange.bindings {
            if topic_matches(pattern, routing_key) && !targets.contains(queue) {
                targets.push(queue.clone());
            }
        }
        Ok(targets)
    }

    fn enqueue(&mut self, queue_name: &str, body: &[u8], message_id: Option<&str>) {
        let now = Instant::now();
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };
        queue.ready.push_back(Stored {
            body: body.to_vec(),
            message_id: message_id.map(str::to_owned),
            expires_at: queue
                .spec
                .message_ttl_ms
                .map(|ms| now + Duration::from_millis(u64::from(ms))),
            redelivered: false,
        });
        if let Some(max) = queue.spec.max_length {
            while queue.ready.len() > max as usize {
                queue.ready.pop_front();
                self.stats.overflowed += 1;
            }
        }
        self.pump(queue_name);
    }

    /// Drop expired messages and hand the rest to the queue's consumer.
    fn pump(&mut self, queue_name: &str) {
        let now = Instant::now();
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };
        let before = queue.ready.len();
        queue
            .ready
            .retain(|message| message.expires_at.map_or(true, |at| at > now));
        self.stats.expired += (before - queue.ready.len()) as u64;

        let Some(link_id) = queue.consumer else {
            return;
        };
        let Some(slot) = self.links.get(&link_id).filter(|slot| slot.channel_open) else {
            queue.consumer = None;
            return;
        };
        while let Some(message) = queue.ready.pop_front() {
            self.next_tag += 1;
            let tag = self.next_tag;
            if slot.events.send(LinkEvent::Frame(message.frame(tag))).is_err() {
                queue.ready.push_front(message);
                queue.consumer = None;
                break;
            }
            queue.unacked.insert(tag, Unacked { link: link_id, message });
        }
    }

    fn settle(&mut self, link_id: u64, tag: u64) -> Result<(String, Stored), TransportError> {
        for (name, queue) in self.queues.iter_mut() {
            if queue.unacked.get(&tag).is_some_and(|u| u.link == link_id) {
                if let Some(unacked) = queue.unacked.remove(&tag) {
                    return Ok((name.clone(), unacked.message));
                }
            }
        }
        Err(TransportError::PreconditionFailed(format!(
            "unknown delivery tag {tag}"
        )))
    }

    /// Cancel the link's consumers and return its unacked deliveries to their queues.
    fn detach(&mut self, link_id: u64) {
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            let Some(queue) = self.queues.get_mut(&name) else {
                continue;
            };
            if queue.consumer == Some(link_id) {
                queue.consumer = None;
            }
            let mut tags: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, unacked)| unacked.link == link_id)
                .map(|(tag, _)| *tag)
                .collect();
            tags.sort_unstable();
            for tag in tags.into_iter().rev() {
                if let Some(mut unacked) = queue.unacked.remove(&tag) {
                    unacked.message.redelivered = true;
                    queue.ready.push_front(unacked.message);
                }
            }
        }
    }

    fn release(&mut self, link_id: u64) -> bool {
        if self.links.remove(&link_id).is_none() {
            return false;
        }
        self.detach(link_id);
        true
    }
}

/// Shared handle to an in-process broker. Clones see the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every connection attempt while `refuse` is set.
    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.lock().refuse_connections = refuse;
    }

    /// Refuse the next `count` connection attempts.
    pub fn fail_next_connects(&self, count: usize) {
        self.inner.lock().fail_next_connects = count;
    }

    /// Fail the next `count` exchange or queue declarations.
    pub fn fail_next_declares(&self, count: usize) {
        self.inner.lock().fail_next_declares = count;
    }

    /// Negatively acknowledge the next `count` publishes.
    pub fn nack_next_publishes(&self, count: usize) {
        self.inner.lock().nack_next_publishes = count;
    }

    /// Fail the next `count` channel closes. The connection close still runs.
    pub fn fail_next_closes(&self, count: usize) {
        self.inner.lock().fail_next_closes = count;
    }

    /// Close every open channel but keep the connections up, as a broker
    /// does after a channel-level error or consumer cancellation.
    ///
    /// Returns the number of channels closed.
    pub fn close_channels(&self) -> usize {
        let mut state = self.inner.lock();
        let ids: Vec<u64> = state
            .links
            .iter()
            .filter(|(_, slot)| slot.channel_open)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            state.detach(*id);
            if let Some(slot) = state.links.get_mut(id) {
                slot.channel_open = false;
                let _ = slot.events.send(LinkEvent::Closed {
                    reason: "channel closed by broker".into(),
                });
            }
        }
        let names: Vec<String> = state.queues.keys().cloned().collect();
        for name in names {
            state.pump(&name);
        }
        warn!(channels = ids.len(), "memory broker closed all channels");
        ids.len()
    }

    /// Drop every open link as if the broker restarted its listeners.
    ///
    /// Returns the number of links closed.
    pub fn sever_connections(&self) -> usize {
        let mut state = self.inner.lock();
        let ids: Vec<u64> = state.links.keys().copied().collect();
        for id in &ids {
            state.release(*id);
        }
        let names: Vec<String> = state.queues.keys().cloned().collect();
        for name in names {
            state.pump(&name);
        }
        warn!(links = ids.len(), "memory broker severed all connections");
        ids.len()
    }

    /// Publish a raw body without a link, bypassing the codec.
    ///
    /// Returns the number of queues the frame was routed to.
    pub fn inject(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<usize, TransportError> {
        let mut state = self.inner.lock();
        let targets = state.route(exchange, routing_key)?;
        for queue in &targets {
            state.enqueue(queue, body, None);
        }
        Ok(targets.len())
    }

    /// Snapshot of the broker counters.
    pub fn stats(&self) -> BrokerStats {
        self.inner.lock().stats.clone()
    }

    /// Frames accepted from link publishes.
    pub fn published_count(&self) -> u64 {
        self.inner.lock().stats.published
    }

    /// Ready messages in `queue`, after dropping expired ones.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        let mut state = self.inner.lock();
        state.pump(queue);
        state.queues.get(queue).map(|q| q.ready.len())
    }

    /// Delivered but not yet settled messages in `queue`.
    pub fn unacked_count(&self, queue: &str) -> Option<usize> {
        self.inner.lock().queues.get(queue).map(|q| q.unacked.len())
    }

    /// Links currently open.
    pub fn open_links(&self) -> usize {
        self.inner.lock().links.len()
    }

    /// Whether `queue` currently has a consumer attached.
    pub fn has_consumer(&self, queue: &str) -> bool {
        self.inner
            .lock()
            .queues
            .get(queue)
            .is_some_and(|q| q.consumer.is_some())
    }

    /// `(queue, routing key)` bindings on `exchange`.
    pub fn bindings(&self, exchange: &str) -> Vec<(String, String)> {
        self.inner
            .lock()
            .exchanges
            .get(exchange)
            .map(|e| e.bindings.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, url: &str) -> Result<Box<dyn Link>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.inner.lock();
            state.stats.connect_attempts += 1;
            if state.refuse_connections {
                return Err(TransportError::Connect(format!("{url}: connection refused")));
            }
            if state.fail_next_connects > 0 {
                state.fail_next_connects -= 1;
                return Err(TransportError::Connect(format!("{url}: connection refused")));
            }
            state.next_link += 1;
            let id = state.next_link;
            state.links.insert(
                id,
                LinkSlot {
                    events: tx,
                    channel_open: true,
                },
            );
            state.stats.connections_opened += 1;
            id
        };
        debug!(link = id, url, "memory broker accepted connection");
        Ok(Box::new(MemoryLink {
            id,
            broker: self.clone(),
            events: rx,
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// A connection plus channel on a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryLink {
    id: u64,
    broker: MemoryBroker,
    events: mpsc::UnboundedReceiver<LinkEvent>,
}

impl MemoryLink {
    fn with_open<T>(
        &self,
        f: impl FnOnce(&mut BrokerState) -> Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        let mut state = self.broker.inner.lock();
        match state.links.get(&self.id).map(|slot| slot.channel_open) {
            Some(true) => f(&mut *state),
            Some(false) => Err(TransportError::Closed("channel closed".into())),
            None => Err(TransportError::Closed("connection closed".into())),
        }
    }

    fn is_open(&self) -> bool {
        self.broker
            .inner
            .lock()
            .links
            .get(&self.id)
            .is_some_and(|slot| slot.channel_open)
    }
}

#[async_trait]
impl Link for MemoryLink {
    async fn declare_exchange(&mut self, name: &str, durable: bool) -> Result<(), TransportError> {
        self.with_open(|state| {
            state.take_declare_failure()?;
            match state.exchanges.get(name) {
                Some(existing) if existing.durable != durable => {
                    return Err(TransportError::PreconditionFailed(format!(
                        "exchange {name} exists with durable={}",
                        existing.durable
                    )));
                }
                Some(_) => {}
                None => {
                    state.exchanges.insert(
                        name.to_owned(),
                        ExchangeState {
                            durable,
                            bindings: Vec::new(),
                        },
                    );
                }
            }
            state.stats.exchange_declares += 1;
            Ok(())
        })
    }

    async fn declare_queue(&mut self, spec: &QueueSpec) -> Result<(), TransportError> {
        self.with_open(|state| {
            state.take_declare_failure()?;
            match state.queues.get(&spec.name) {
                Some(existing) if existing.spec != *spec => {
                    return Err(TransportError::PreconditionFailed(format!(
                        "queue {} exists with different arguments",
                        spec.name
                    )));
                }
                Some(_) => {}
                None => {
                    state.queues.insert(
                        spec.name.clone(),
                        QueueState {
                            spec: spec.clone(),
                            ready: VecDeque::new(),
                            unacked: HashMap::new(),
                            consumer: None,
                        },
                    );
                }
            }
            state.stats.queue_declares += 1;
            Ok(())
        })
    }

    async fn bind_queue(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.with_open(|state| {
            if !state.queues.contains_key(queue) {
                return Err(TransportError::NotFound(format!("queue {queue}")));
            }
            let exchange_state = state
                .exchanges
                .get_mut(exchange)
                .ok_or_else(|| TransportError::NotFound(format!("exchange {exchange}")))?;
            let binding = (queue.to_owned(), routing_key.to_owned());
            if !exchange_state.bindings.contains(&binding) {
                exchange_state.bindings.push(binding);
            }
            Ok(())
        })
    }

    async fn consume(&mut self, queue: &str, consumer_tag: &str) -> Result<(), TransportError> {
        let id = self.id;
        self.with_open(|state| {
            let queue_state = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| TransportError::NotFound(format!("queue {queue}")))?;
            match queue_state.consumer {
                Some(owner) if owner != id => {
                    return Err(TransportError::PreconditionFailed(format!(
                        "queue {queue} already has a consumer"
                    )));
                }
                _ => queue_state.consumer = Some(id),
            }
            debug!(link = id, queue, consumer_tag, "memory broker attached consumer");
            state.pump(queue);
            Ok(())
        })
    }

    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &PublishProperties,
    ) -> Result<(), TransportError> {
        self.with_open(|state| {
            let targets = state.route(exchange, routing_key)?;
            if state.nack_next_publishes > 0 {
                state.nack_next_publishes -= 1;
                return Err(TransportError::Rejected(format!(
                    "message {} nacked",
                    properties.message_id
                )));
            }
            state.stats.published += 1;
            for queue in &targets {
                state.enqueue(queue, body, Some(&properties.message_id));
            }
            Ok(())
        })
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), TransportError> {
        let id = self.id;
        self.with_open(|state| state.settle(id, delivery_tag).map(|_| ()))
    }

    async fn reject(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        let id = self.id;
        self.with_open(|state| {
            let (queue, mut message) = state.settle(id, delivery_tag)?;
            if requeue {
                message.redelivered = true;
                if let Some(queue_state) = state.queues.get_mut(&queue) {
                    queue_state.ready.push_front(message);
                }
                state.pump(&queue);
            } else {
                state.stats.discarded += 1;
            }
            Ok(())
        })
    }

    async fn next_event(&mut self) -> LinkEvent {
        let event = self.events.recv().await;
        if !self.is_open() {
            return LinkEvent::Closed {
                reason: "connection closed by broker".into(),
            };
        }
        event.unwrap_or_else(|| LinkEvent::Closed {
            reason: "connection closed by broker".into(),
        })
    }

    async fn close_channel(&mut self) -> Result<(), TransportError> {
        let id = self.id;
        self.with_open(|state| {
            if state.fail_next_closes > 0 {
                state.fail_next_closes -= 1;
                return Err(TransportError::Io("injected close failure".into()));
            }
            state.detach(id);
            if let Some(slot) = state.links.get_mut(&id) {
                slot.channel_open = false;
            }
            Ok(())
        })
    }

    async fn close_connection(&mut self) -> Result<(), TransportError> {
        let mut state = self.broker.inner.lock();
        if state.release(self.id) {
            state.stats.connections_closed += 1;
            Ok(())
        } else {
            Err(TransportError::Closed("connection already closed".into()))
        }
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        self.broker.inner.lock().release(self.id);
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` is zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| matches_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&head, tail)) => (word == "*" || word == head) && matches_words(rest, tail),
            None => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(name: &str, ttl: Option<u32>, max: Option<u32>) -> QueueSpec {
        QueueSpec {
            name: name.into(),
            durable: true,
            message_ttl_ms: ttl,
            max_length: max,
        }
    }

    fn props(id: &str) -> PublishProperties {
        PublishProperties {
            persistent: true,
            content_type: "application/json".into(),
            message_id: id.into(),
            timestamp: 0,
        }
    }

    async fn bound_link(broker: &MemoryBroker, spec: QueueSpec, key: &str) -> Box<dyn Link> {
        let mut link = broker.connect("memory://").await.unwrap();
        link.declare_exchange("ex", true).await.unwrap();
        link.declare_queue(&spec).await.unwrap();
        link.bind_queue(&spec.name, "ex", key).await.unwrap();
        link
    }

    #[test]
    fn topic_patterns() {
        assert!(topic_matches("broadcast", "broadcast"));
        assert!(!topic_matches("broadcast", "telegram"));
        assert!(topic_matches("events.*", "events.alert"));
        assert!(!topic_matches("events.*", "events.alert.high"));
        assert!(topic_matches("events.#", "events"));
        assert!(topic_matches("events.#", "events.alert.high"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("*.alert.#", "svc.alert"));
        assert!(!topic_matches("*.alert", "alert"));
    }

    #[tokio::test]
    async fn publish_routes_and_counts() {
        let broker = MemoryBroker::new();
        let mut link = bound_link(&broker, queue("ex.a", None, None), "a").await;
        link.publish("ex", "a", b"one", &props("1")).await.unwrap();
        link.publish("ex", "b", b"two", &props("2")).await.unwrap();

        assert_eq!(broker.published_count(), 2);
        assert_eq!(broker.queue_depth("ex.a"), Some(1));

        let missing = link.publish("nope", "a", b"x", &props("3")).await;
        assert!(matches!(missing, Err(TransportError::NotFound(_))));
        assert_eq!(broker.published_count(), 2);
    }

    #[tokio::test]
    async fn redeclare_is_idempotent_but_mismatch_fails() {
        let broker = MemoryBroker::new();
        let mut link = bound_link(&broker, queue("ex.a", Some(10), Some(5)), "a").await;
        link.declare_exchange("ex", true).await.unwrap();
        link.declare_queue(&queue("ex.a", Some(10), Some(5))).await.unwrap();
        link.bind_queue("ex.a", "ex", "a").await.unwrap();
        assert_eq!(broker.bindings("ex").len(), 1);

        let exchange = link.declare_exchange("ex", false).await;
        assert!(matches!(exchange, Err(TransportError::PreconditionFailed(_))));
        let queue_result = link.declare_queue(&queue("ex.a", Some(20), Some(5))).await;
        assert!(matches!(queue_result, Err(TransportError::PreconditionFailed(_))));
    }

    #[tokio::test]
    async fn max_length_drops_oldest() {
        let broker = MemoryBroker::new();
        let mut link = bound_link(&broker, queue("ex.a", None, Some(2)), "a").await;
        for body in [b"1", b"2", b"3"] {
            link.publish("ex", "a", body, &props("m")).await.unwrap();
        }
        link.consume("ex.a", "c").await.unwrap();

        let mut bodies = Vec::new();
        for _ in 0..2 {
            match link.next_event().await {
                LinkEvent::Frame(frame) => bodies.push(frame.body),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(bodies, vec![b"2".to_vec(), b"3".to_vec()]);
        assert_eq!(broker.stats().overflowed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ready_messages_expire() {
        let broker = MemoryBroker::new();
        let mut link = bound_link(&broker, queue("ex.a", Some(1_000), None), "a").await;
        link.publish("ex", "a", b"old", &props("1")).await.unwrap();
        tokio::time::advance(Duration::from_millis(600)).await;
        link.publish("ex", "a", b"new", &props("2")).await.unwrap();
        tokio::time::advance(Duration::from_millis(500)).await;

        assert_eq!(broker.queue_depth("ex.a"), Some(1));
        assert_eq!(broker.stats().expired, 1);
    }

    #[tokio::test]
    async fn unacked_frames_return_after_sever() {
        let broker = MemoryBroker::new();
        let mut link = bound_link(&broker, queue("ex.a", None, None), "a").await;
        link.consume("ex.a", "c").await.unwrap();
        link.publish("ex", "a", b"payload", &props("1")).await.unwrap();
        assert!(matches!(link.next_event().await, LinkEvent::Frame(_)));
        assert_eq!(broker.unacked_count("ex.a"), Some(1));

        assert_eq!(broker.sever_connections(), 1);
        assert!(matches!(link.next_event().await, LinkEvent::Closed { .. }));
        assert!(matches!(
            link.ack(1).await,
            Err(TransportError::Closed(_))
        ));
        assert_eq!(broker.queue_depth("ex.a"), Some(1));

        let mut again = broker.connect("memory://").await.unwrap();
        again.consume("ex.a", "c").await.unwrap();
        match again.next_event().await {
            LinkEvent::Frame(frame) => {
                assert!(frame.redelivered);
                assert_eq!(frame.message_id.as_deref(), Some("1"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn reject_without_requeue_discards() {
        let broker = MemoryBroker::new();
        let mut link = bound_link(&broker, queue("ex.a", None, None), "a").await;
        link.consume("ex.a", "c").await.unwrap();
        broker.inject("ex", "a", b"junk").unwrap();
        let LinkEvent::Frame(frame) = link.next_event().await else {
            panic!("expected frame");
        };
        link.reject(frame.delivery_tag, false).await.unwrap();

        assert_eq!(broker.queue_depth("ex.a"), Some(0));
        assert_eq!(broker.unacked_count("ex.a"), Some(0));
        assert_eq!(broker.stats().discarded, 1);
    }

    #[tokio::test]
    async fn scripted_connect_failures() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(1);
        assert!(matches!(
            broker.connect("memory://").await,
            Err(TransportError::Connect(_))
        ));
        assert!(broker.connect("memory://").await.is_ok());

        broker.refuse_connections(true);
        assert!(broker.connect("memory://").await.is_err());
        assert_eq!(broker.stats().connect_attempts, 3);
        assert_eq!(broker.stats().connections_opened, 1);
    }

    #[tokio::test]
    async fn closed_channel_keeps_connection_until_closed() {
        let broker = MemoryBroker::new();
        let mut link = bound_link(&broker, queue("ex.a", None, None), "a").await;
        link.consume("ex.a", "c").await.unwrap();

        assert_eq!(broker.close_channels(), 1);
        assert!(matches!(link.next_event().await, LinkEvent::Closed { .. }));
        assert!(!broker.has_consumer("ex.a"));
        assert_eq!(broker.open_links(), 1);

        assert!(link.close_channel().await.is_err());
        link.close_connection().await.unwrap();
        assert_eq!(broker.open_links(), 0);
        assert_eq!(broker.stats().connections_closed, 1);
    }

    #[tokio::test]
    async fn injected_close_failure_still_releases_connection() {
        let broker = MemoryBroker::new();
        let mut link = broker.connect("memory://").await.unwrap();
        broker.fail_next_closes(1);

        assert!(matches!(
            link.close_channel().await,
            Err(TransportError::Io(_))
        ));
        link.close_connection().await.unwrap();
        assert_eq!(broker.open_links(), 0);
    }

    #[tokio::test]
    async fn dropping_link_releases_consumer() {
        let broker = MemoryBroker::new();
        let mut link = bound_link(&broker, queue("ex.a", None, None), "a").await;
        link.consume("ex.a", "c").await.unwrap();
        assert!(broker.has_consumer("ex.a"));
        drop(link);
        assert!(!broker.has_consumer("ex.a"));
        assert_eq!(broker.open_links(), 0);
    }
}
