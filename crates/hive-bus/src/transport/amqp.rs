//! ---
//! hive_section: "02-messaging-ipc-data-model"
//! hive_subsection: "module"
//! hive_type: "source"
//! hive_scope: "code"
//! hive_description: "AMQP 0-9-1 broker backend."
//! hive_version: "v0.1.0"
//! hive_owner: "messaging"
//! ---
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicRejectOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{
    Connector, InboundFrame, Link, LinkEvent, PublishProperties, QueueSpec, TransportError,
};

const REPLY_SUCCESS: u16 = 200;

/// Opens links to an AMQP broker such as RabbitMQ.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpConnector;

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Link>, TransportError> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;

        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        connection.on_error(move |err| {
            let _ = errors_tx.send(err.to_string());
        });

        let channel = connection.create_channel().await.map_err(classify)?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(classify)?;
        debug!(channel = channel.id(), "amqp channel opened with publisher confirms");

        Ok(Box::new(AmqpLink {
            connection,
            channel,
            consumer: None,
            errors: errors_rx,
        }))
    }

    fn name(&self) -> &'static str {
        "amqp"
    }
}

/// One AMQP connection with a single confirm-mode channel.
pub struct AmqpLink {
    connection: Connection,
    channel: Channel,
    consumer: Option<Consumer>,
    errors: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Link for AmqpLink {
    async fn declare_exchange(&mut self, name: &str, durable: bool) -> Result<(), TransportError> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(classify)
    }

    async fn declare_queue(&mut self, spec: &QueueSpec) -> Result<(), TransportError> {
        self.channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    ..QueueDeclareOptions::default()
                },
                queue_arguments(spec),
            )
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn bind_queue(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(classify)
    }

    async fn consume(&mut self, queue: &str, consumer_tag: &str) -> Result<(), TransportError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(classify)?;
        self.consumer = Some(consumer);
        Ok(())
    }

    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &PublishProperties,
    ) -> Result<(), TransportError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                basic_properties(properties),
            )
            .await
            .map_err(classify)?;
        let confirmation = confirm.await.map_err(classify)?;
        if confirmation.is_nack() {
            return Err(TransportError::Rejected(format!(
                "broker nacked message {}",
                properties.message_id
            )));
        }
        Ok(())
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), TransportError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(classify)
    }

    async fn reject(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(classify)
    }

    async fn next_event(&mut self) -> LinkEvent {
        let Some(consumer) = self.consumer.as_mut() else {
            return connection_lost(self.errors.recv().await);
        };
        tokio::select! {
            delivery = consumer.next() => match delivery {
                Some(Ok(delivery)) => LinkEvent::Frame(InboundFrame {
                    delivery_tag: delivery.delivery_tag,
                    message_id: delivery
                        .properties
                        .message_id()
                        .as_ref()
                        .map(|id| id.as_str().to_owned()),
                    redelivered: delivery.redelivered,
                    body: delivery.data,
                }),
                Some(Err(err)) => LinkEvent::Closed {
                    reason: err.to_string(),
                },
                None => LinkEvent::Closed {
                    reason: "consumer cancelled by broker".into(),
                },
            },
            error = self.errors.recv() => connection_lost(error),
        }
    }

    async fn close_channel(&mut self) -> Result<(), TransportError> {
        self.consumer = None;
        self.channel
            .close(REPLY_SUCCESS, "client disconnect")
            .await
            .map_err(classify)
    }

    async fn close_connection(&mut self) -> Result<(), TransportError> {
        self.connection
            .close(REPLY_SUCCESS, "client disconnect")
            .await
            .map_err(classify)
    }
}

fn connection_lost(error: Option<String>) -> LinkEvent {
    let reason = error.unwrap_or_else(|| "connection error stream ended".into());
    warn!(reason = %reason, "amqp connection reported an error");
    LinkEvent::Closed { reason }
}

fn queue_arguments(spec: &QueueSpec) -> FieldTable {
    let mut arguments = FieldTable::default();
    if let Some(ttl) = spec.message_ttl_ms {
        arguments.insert(
            ShortString::from("x-message-ttl"),
            AMQPValue::LongInt(i32::try_from(ttl).unwrap_or(i32::MAX)),
        );
    }
    if let Some(max) = spec.max_length {
        arguments.insert(
            ShortString::from("x-max-length"),
            AMQPValue::LongInt(i32::try_from(max).unwrap_or(i32::MAX)),
        );
    }
    arguments
}

fn basic_properties(properties: &PublishProperties) -> BasicProperties {
    BasicProperties::default()
        .with_delivery_mode(if properties.persistent { 2 } else { 1 })
        .with_content_type(ShortString::from(properties.content_type.as_str()))
        .with_message_id(ShortString::from(properties.message_id.as_str()))
        .with_timestamp(properties.timestamp)
}

fn classify(err: lapin::Error) -> TransportError {
    match &err {
        lapin::Error::ProtocolError(amqp) => match amqp.kind() {
            AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => TransportError::NotFound(err.to_string()),
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                TransportError::PreconditionFailed(err.to_string())
            }
            _ => TransportError::Closed(err.to_string()),
        },
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
            TransportError::Closed(err.to_string())
        }
        _ => TransportError::Io(err.to_string()),
    }
}
