//! ---
//! hive_section: "02-messaging-ipc-data-model"
//! hive_subsection: "module"
//! hive_type: "source"
//! hive_scope: "code"
//! hive_description: "Bus task owning the broker link, reconnect timer and listeners."
//! hive_version: "v0.1.0"
//! hive_owner: "messaging"
//! ---
//! One task per bus owns the link, the [`Machine`], the reconnect timer and
//! the [`Dispatcher`]. [`MessageBus`] handles talk to it over an unbounded
//! request channel; connection state is published on a watch channel.
//!
//! A connection attempt is a future polled by the same loop, so requests are
//! served while it runs.
use std::future::{self, Future};
use std::pin::Pin;
use std::sync::Arc;

use hive_common::Validate;
use prometheus::Registry;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant, Sleep};
use tracing::{debug, info, warn};

use crate::config::BusConfig;
use crate::dispatcher::{Dispatcher, ListenerId, Outcome, Sink};
use crate::envelope::{Draft, Envelope, EnvelopeKind};
use crate::metrics::{log_envelope, BusMetrics, MessageDirection};
use crate::publisher;
use crate::state::{Command, ConnectionState, Input, Machine};
use crate::topology::Topology;
use crate::transport::{Connector, InboundFrame, Link, LinkEvent, TransportError};
use crate::{BusError, Result};

enum Request {
    Connect {
        respond_to: oneshot::Sender<ConnectionState>,
    },
    Publish {
        draft: Draft,
        respond_to: oneshot::Sender<Result<Envelope>>,
    },
    AddListener {
        id: ListenerId,
        filter: Option<EnvelopeKind>,
        sink: Sink,
    },
    RemoveListener {
        id: ListenerId,
    },
    Disconnect {
        respond_to: oneshot::Sender<Result<()>>,
    },
}

/// Configures and starts a [`MessageBus`].
pub struct BusBuilder {
    config: BusConfig,
    connector: Option<Arc<dyn Connector>>,
    registry: Option<Registry>,
}

impl BusBuilder {
    /// Use `connector` to reach the broker instead of the AMQP default.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Export bus metrics on `registry`.
    pub fn metrics(mut self, registry: &Registry) -> Self {
        self.registry = Some(registry.clone());
        self
    }

    /// Validate the configuration and start the bus task.
    ///
    /// Must be called from within a Tokio runtime. The bus starts
    /// [`ConnectionState::Disconnected`]; call [`MessageBus::connect`].
    pub fn spawn(self) -> Result<MessageBus> {
        self.config
            .validate()
            .map_err(|err| BusError::InvalidConfig(format!("{err:#}")))?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            BusError::InvalidConfig("the bus must be started inside a tokio runtime".into())
        })?;
        let connector = match self.connector {
            Some(connector) => connector,
            None => default_connector()?,
        };
        let metrics = match &self.registry {
            Some(registry) => BusMetrics::register(registry)?,
            None => BusMetrics::unregistered()?,
        };

        let config = Arc::new(self.config);
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        metrics.set_state(ConnectionState::Disconnected);

        let task = BusTask {
            topology: Topology::for_client(&config),
            machine: Machine::new(config.reconnect_interval),
            dispatcher: Dispatcher::new(config.client_id.clone(), config.echo_own_broadcasts),
            consumer_tag: format!("hive-bus.{}", config.client_id),
            config: Arc::clone(&config),
            connector,
            link: None,
            attempt: None,
            awaiting_connect: Vec::new(),
            reconnect: None,
            metrics,
            state_tx,
            requests: requests_rx,
        };
        info!(
            client_id = %config.client_id,
            exchange = %config.exchange,
            transport = task.connector.name(),
            "message bus started"
        );
        runtime.spawn(task.run());

        Ok(MessageBus {
            requests: requests_tx,
            state: state_rx,
            config,
        })
    }
}

#[cfg(feature = "amqp")]
fn default_connector() -> Result<Arc<dyn Connector>> {
    Ok(Arc::new(crate::transport::amqp::AmqpConnector::default()))
}

#[cfg(not(feature = "amqp"))]
fn default_connector() -> Result<Arc<dyn Connector>> {
    Err(BusError::InvalidConfig(
        "no broker connector configured and the amqp feature is disabled".into(),
    ))
}

/// Cloneable handle to a running bus.
///
/// Dropping the last handle tears the bus down as if
/// [`MessageBus::disconnect`] had been called.
#[derive(Clone)]
pub struct MessageBus {
    requests: mpsc::UnboundedSender<Request>,
    state: watch::Receiver<ConnectionState>,
    config: Arc<BusConfig>,
}

impl MessageBus {
    /// Start configuring a bus.
    pub fn builder(config: BusConfig) -> BusBuilder {
        BusBuilder {
            config,
            connector: None,
            registry: None,
        }
    }

    /// Attempt to reach [`ConnectionState::Connected`].
    ///
    /// A failed attempt is logged and retried after the reconnect interval;
    /// it is not an error. The returned state says where the attempt ended,
    /// or is [`ConnectionState::Closed`] if the bus was disconnected first.
    pub async fn connect(&self) -> Result<ConnectionState> {
        self.call(|respond_to| Request::Connect { respond_to }).await
    }

    /// Seal, route and publish `draft`, returning the envelope as sent.
    ///
    /// Fails with [`BusError::NotConnected`] unless the bus is
    /// [`ConnectionState::Connected`], including while an attempt runs.
    pub async fn publish(&self, draft: Draft) -> Result<Envelope> {
        self.call(|respond_to| Request::Publish { draft, respond_to })
            .await?
    }

    /// Register a listener for every dispatched envelope.
    pub fn on_message<F>(&self, listener: F) -> Result<ListenerId>
    where
        F: Fn(&Envelope) + Send + 'static,
    {
        self.register(None, Sink::Callback(Box::new(listener)))
    }

    /// Register a listener for envelopes of one kind.
    pub fn on_kind<F>(&self, kind: EnvelopeKind, listener: F) -> Result<ListenerId>
    where
        F: Fn(&Envelope) + Send + 'static,
    {
        self.register(Some(kind), Sink::Callback(Box::new(listener)))
    }

    /// Receive every dispatched envelope on a channel.
    pub fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<Envelope>> {
        self.subscribe_filtered(None)
    }

    /// Receive envelopes of one kind on a channel.
    pub fn subscribe_kind(&self, kind: EnvelopeKind) -> Result<mpsc::UnboundedReceiver<Envelope>> {
        self.subscribe_filtered(Some(kind))
    }

    fn subscribe_filtered(
        &self,
        filter: Option<EnvelopeKind>,
    ) -> Result<mpsc::UnboundedReceiver<Envelope>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.register(filter, Sink::Channel(tx))?;
        Ok(rx)
    }

    fn register(&self, filter: Option<EnvelopeKind>, sink: Sink) -> Result<ListenerId> {
        let id = ListenerId::next();
        self.send(Request::AddListener { id, filter, sink })?;
        Ok(id)
    }

    /// Stop delivering to a listener or subscription.
    pub fn remove_listener(&self, id: ListenerId) -> Result<()> {
        self.send(Request::RemoveListener { id })
    }

    /// Close the channel and connection, cancel any pending reconnect and
    /// stop the bus. Every later call on any handle returns
    /// [`BusError::Terminated`].
    pub async fn disconnect(&self) -> Result<()> {
        self.call(|respond_to| Request::Disconnect { respond_to })
            .await?
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Wait until the bus reports `target`.
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<()> {
        let mut state = self.state.clone();
        state
            .wait_for(|current| *current == target)
            .await
            .map(|_| ())
            .map_err(|_| BusError::Terminated)
    }

    /// Configuration the bus was built with.
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    fn send(&self, request: Request) -> Result<()> {
        self.requests
            .send(request)
            .map_err(|_| BusError::Terminated)
    }

    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx))?;
        rx.await.map_err(|_| BusError::Terminated)
    }
}

type LinkResult<T> = std::result::Result<T, TransportError>;

/// An in-flight open, declare and consume sequence.
type Attempt = Pin<Box<dyn Future<Output = LinkResult<Box<dyn Link>>> + Send>>;

enum Wake {
    Request(Option<Request>),
    ReconnectDue,
    AttemptDone(LinkResult<Box<dyn Link>>),
    Link(LinkEvent),
}

struct BusTask {
    config: Arc<BusConfig>,
    connector: Arc<dyn Connector>,
    topology: Topology,
    consumer_tag: String,
    machine: Machine,
    link: Option<Box<dyn Link>>,
    attempt: Option<Attempt>,
    /// `connect()` callers waiting for the running attempt to settle.
    awaiting_connect: Vec<oneshot::Sender<ConnectionState>>,
    reconnect: Option<Pin<Box<Sleep>>>,
    dispatcher: Dispatcher,
    metrics: BusMetrics,
    state_tx: watch::Sender<ConnectionState>,
    requests: mpsc::UnboundedReceiver<Request>,
}

impl BusTask {
    async fn run(mut self) {
        loop {
            let wake = tokio::select! {
                biased;
                request = self.requests.recv() => Wake::Request(request),
                () = reconnect_due(&mut self.reconnect) => Wake::ReconnectDue,
                outcome = attempt_done(&mut self.attempt) => Wake::AttemptDone(outcome),
                event = next_link_event(&mut self.link) => Wake::Link(event),
            };

            match wake {
                Wake::Request(Some(request)) => {
                    if !self.handle_request(request).await {
                        break;
                    }
                }
                Wake::Request(None) => {
                    debug!(client_id = %self.config.client_id, "all bus handles dropped");
                    if let Err(err) = self.feed(Input::DisconnectRequested).await {
                        warn!(error = %err, "closing broker link on drop failed");
                    }
                    self.answer_connects();
                    break;
                }
                Wake::ReconnectDue => {
                    self.reconnect = None;
                    self.metrics.record_reconnect();
                    info!(client_id = %self.config.client_id, "reconnecting to broker");
                    self.feed_quiet(Input::ReconnectTimerFired).await;
                }
                Wake::AttemptDone(outcome) => {
                    self.attempt = None;
                    let input = self.settle_attempt(outcome);
                    self.feed_quiet(input).await;
                    self.answer_connects();
                }
                Wake::Link(LinkEvent::Frame(frame)) => self.handle_frame(frame).await,
                Wake::Link(LinkEvent::Closed { reason }) => {
                    warn!(
                        client_id = %self.config.client_id,
                        reason = %reason,
                        "broker link closed unexpectedly"
                    );
                    self.feed_quiet(Input::LinkLost {
                        now: Instant::now(),
                    })
                    .await;
                }
            }
        }
        info!(client_id = %self.config.client_id, "message bus stopped");
    }

    /// Returns `false` once the bus should stop.
    async fn handle_request(&mut self, request: Request) -> bool {
        match request {
            Request::Connect { respond_to } => {
                self.feed_quiet(Input::ConnectRequested).await;
                if self.attempt.is_some() {
                    self.awaiting_connect.push(respond_to);
                } else {
                    let _ = respond_to.send(self.machine.state());
                }
            }
            Request::Publish { draft, respond_to } => {
                let result = self.publish(draft).await;
                let _ = respond_to.send(result);
            }
            Request::AddListener { id, filter, sink } => {
                self.dispatcher.insert(id, filter, sink);
            }
            Request::RemoveListener { id } => {
                if !self.dispatcher.remove(id) {
                    debug!(listener = ?id, "listener already removed");
                }
            }
            Request::Disconnect { respond_to } => {
                let result = self
                    .feed(Input::DisconnectRequested)
                    .await
                    .map_err(BusError::DisconnectFailed);
                self.answer_connects();
                let _ = respond_to.send(result);
                return false;
            }
        }
        true
    }

    async fn publish(&mut self, draft: Draft) -> Result<Envelope> {
        let link = match self.link.as_mut() {
            Some(link) if self.machine.state() == ConnectionState::Connected => link,
            _ => {
                self.metrics.record_publish_failure();
                debug!(state = %self.machine.state(), "publish refused while not connected");
                return Err(BusError::NotConnected);
            }
        };
        let outbound = publisher::prepare(draft, &self.config.client_id)?;

        match publisher::send(link.as_mut(), &self.topology.exchange, &outbound).await {
            Ok(()) => {
                self.metrics.record_published();
                log_envelope(MessageDirection::Outbound, &outbound.envelope);
                Ok(outbound.envelope)
            }
            Err(err) => {
                self.metrics.record_publish_failure();
                warn!(
                    message_id = %outbound.envelope.message_id,
                    routing_key = %outbound.routing_key,
                    error = %err,
                    "publish failed"
                );
                if err.is_link_lost() {
                    self.feed_quiet(Input::LinkLost {
                        now: Instant::now(),
                    })
                    .await;
                }
                Err(BusError::PublishFailed(err))
            }
        }
    }

    async fn handle_frame(&mut self, frame: InboundFrame) {
        let tag = frame.delivery_tag;
        let ack = match self.dispatcher.handle(&frame.body) {
            Outcome::Dispatched {
                envelope,
                listeners,
            } => {
                self.metrics.record_delivered();
                log_envelope(MessageDirection::Inbound, &envelope);
                debug!(
                    delivery_tag = tag,
                    redelivered = frame.redelivered,
                    listeners,
                    "envelope dispatched"
                );
                true
            }
            Outcome::OwnBroadcast(envelope) => {
                debug!(
                    delivery_tag = tag,
                    message_id = %envelope.message_id,
                    "skipping own envelope"
                );
                true
            }
            Outcome::Malformed(err) => {
                self.metrics.record_rejected();
                warn!(
                    delivery_tag = tag,
                    redelivered = frame.redelivered,
                    message_id = frame.message_id.as_deref().unwrap_or("-"),
                    error = %err,
                    "discarding malformed frame"
                );
                false
            }
        };

        let Some(link) = self.link.as_mut() else {
            return;
        };
        let settled = if ack {
            link.ack(tag).await
        } else {
            link.reject(tag, false).await
        };
        if let Err(err) = settled {
            warn!(delivery_tag = tag, error = %err, "settling frame failed");
            if err.is_link_lost() {
                self.feed_quiet(Input::LinkLost {
                    now: Instant::now(),
                })
                .await;
            }
        }
    }

    fn answer_connects(&mut self) {
        let state = self.machine.state();
        for respond_to in self.awaiting_connect.drain(..) {
            let _ = respond_to.send(state);
        }
    }

    async fn feed_quiet(&mut self, input: Input) {
        if let Err(err) = self.feed(input).await {
            warn!(error = %err, "closing broker link failed");
        }
    }

    /// Apply `input` and run the commands it produces.
    ///
    /// Returns the error from closing the link, if one was closed.
    async fn feed(&mut self, input: Input) -> LinkResult<()> {
        let mut closed = Ok(());
        for command in self.machine.apply(input) {
            match command {
                Command::Establish => self.attempt = Some(self.start_attempt()),
                Command::AbandonAttempt => {
                    if self.attempt.take().is_some() {
                        debug!(client_id = %self.config.client_id, "connection attempt abandoned");
                    }
                }
                Command::ScheduleReconnect { at } => {
                    info!(
                        client_id = %self.config.client_id,
                        retry_in_ms = self.config.reconnect_interval.as_millis() as u64,
                        "reconnect scheduled"
                    );
                    self.reconnect = Some(Box::pin(sleep_until(at)));
                }
                Command::CancelReconnect => self.reconnect = None,
                Command::ReleaseLink => {
                    if let Some(link) = self.link.take() {
                        tokio::spawn(async move {
                            if let Err(err) = close_link(link).await {
                                debug!(error = %err, "closing lost link failed");
                            }
                        });
                    }
                }
                Command::CloseLink => {
                    if let Some(link) = self.link.take() {
                        closed = close_link(link).await;
                    }
                }
                Command::Notify(state) => {
                    self.metrics.set_state(state);
                    self.state_tx.send_replace(state);
                    info!(client_id = %self.config.client_id, state = %state, "bus state changed");
                }
            }
        }
        closed
    }

    fn start_attempt(&self) -> Attempt {
        let connector = Arc::clone(&self.connector);
        let config = Arc::clone(&self.config);
        let topology = self.topology.clone();
        let consumer_tag = self.consumer_tag.clone();
        Box::pin(async move {
            open_link(connector.as_ref(), &config.url, &topology, &consumer_tag).await
        })
    }

    fn settle_attempt(&mut self, outcome: LinkResult<Box<dyn Link>>) -> Input {
        match outcome {
            Ok(link) => {
                self.link = Some(link);
                info!(
                    client_id = %self.config.client_id,
                    exchange = %self.topology.exchange,
                    queue = %self.topology.queue.name,
                    "connected to broker"
                );
                Input::Established
            }
            Err(err) => {
                self.metrics.record_connect_failure();
                let err = BusError::ConnectFailed(err);
                warn!(
                    client_id = %self.config.client_id,
                    error = %err,
                    "connection attempt failed"
                );
                Input::SetupFailed {
                    now: Instant::now(),
                }
            }
        }
    }
}

/// Connect, declare topology and attach the consumer.
///
/// A link that fails part-way through setup is closed before returning.
async fn open_link(
    connector: &dyn Connector,
    url: &str,
    topology: &Topology,
    consumer_tag: &str,
) -> LinkResult<Box<dyn Link>> {
    let mut link = connector.connect(url).await?;
    if let Err(err) = prepare_link(topology, link.as_mut(), consumer_tag).await {
        if let Err(close_err) = link.close_connection().await {
            debug!(error = %close_err, "closing half-open link failed");
        }
        return Err(err);
    }
    Ok(link)
}

async fn prepare_link(
    topology: &Topology,
    link: &mut dyn Link,
    consumer_tag: &str,
) -> LinkResult<()> {
    topology.declare(link).await?;
    link.consume(&topology.queue.name, consumer_tag).await
}

/// Close the channel first so pending acks flush, then the connection.
async fn close_link(mut link: Box<dyn Link>) -> LinkResult<()> {
    let channel = link.close_channel().await;
    let connection = link.close_connection().await;
    channel.and(connection)
}

async fn reconnect_due(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => future::pending().await,
    }
}

async fn attempt_done(attempt: &mut Option<Attempt>) -> LinkResult<Box<dyn Link>> {
    match attempt {
        Some(attempt) => attempt.as_mut().await,
        None => future::pending().await,
    }
}

async fn next_link_event(link: &mut Option<Box<dyn Link>>) -> LinkEvent {
    match link {
        Some(link) => link.next_event().await,
        None => future::pending().await,
    }
}
