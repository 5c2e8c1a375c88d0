//! AMQP 0-9-1 transport over `lapin`.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use secrecy::ExposeSecret;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::ports::{
    BrokerChannel, BrokerError, BrokerMessage, BrokerTransport, ConnectOptions, DeliveryAcker,
    DeliveryStream, InboundDelivery, MessageProperties, JSON_CONTENT_TYPE,
};

const PERSISTENT_DELIVERY_MODE: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

/// Connects to RabbitMQ (or any AMQP 0-9-1 broker) with `lapin`.
#[derive(Debug, Clone, Default)]
pub struct LapinTransport;

impl LapinTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrokerTransport for LapinTransport {
    async fn connect(&self, options: &ConnectOptions) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let connection = Connection::connect(options.uri.expose_secret(), connection_properties(options))
            .await
            .map_err(map_error)?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => return Err(abandon(&connection, "channel open failed", e).await),
        };

        if let Err(e) = channel.confirm_select(ConfirmSelectOptions::default()).await {
            return Err(abandon(&connection, "confirm select failed", e).await);
        }

        tracing::debug!(channel_id = channel.id(), "AMQP channel opened");
        Ok(Arc::new(LapinChannel { connection, channel }))
    }
}

/// Connection I/O and lapin's internal tasks run on the current tokio runtime.
fn connection_properties(options: &ConnectOptions) -> ConnectionProperties {
    let properties = ConnectionProperties::default()
        .with_executor(tokio_executor_trait::Tokio::current())
        .with_reactor(tokio_reactor_trait::Tokio);
    match &options.connection_name {
        Some(name) => properties.with_connection_name(LongString::from(name.clone())),
        None => properties,
    }
}

/// Closes a connection whose channel setup failed and returns the setup error.
async fn abandon(connection: &Connection, reason: &str, err: lapin::Error) -> BrokerError {
    if let Err(close) = connection.close(REPLY_SUCCESS, reason).await {
        tracing::debug!(error = %close, "Failed to close AMQP connection");
    }
    map_error(err)
}

struct LapinChannel {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn declare_exchange(&self, exchange: &str) -> Result<(), BrokerError> {
        self.channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_error)
    }

    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_error)
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(map_error)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &BrokerMessage,
    ) -> Result<(), BrokerError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                to_basic_properties(&message.properties),
            )
            .await
            .map_err(map_error)?;

        let confirmation = confirm.await.map_err(map_error)?;
        if confirmation.is_nack() {
            return Err(BrokerError::Protocol(format!(
                "broker rejected message {}",
                message.properties.message_id
            )));
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_error)?;

        Ok(consumer
            .map(|delivery| delivery.map(to_inbound).map_err(map_error))
            .boxed())
    }

    async fn close_channel(&self) -> Result<(), BrokerError> {
        self.channel
            .close(REPLY_SUCCESS, "Bye")
            .await
            .map_err(map_error)
    }

    async fn close_connection(&self) -> Result<(), BrokerError> {
        self.connection
            .close(REPLY_SUCCESS, "Bye")
            .await
            .map_err(map_error)
    }
}

struct LapinAcker(Acker);

#[async_trait]
impl DeliveryAcker for LapinAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.0.ack(BasicAckOptions::default()).await.map_err(map_error)
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(map_error)
    }
}

fn to_inbound(delivery: Delivery) -> InboundDelivery {
    let message = BrokerMessage {
        properties: from_basic_properties(&delivery.properties),
        body: delivery.data,
    };
    InboundDelivery::new(
        delivery.delivery_tag,
        delivery.redelivered,
        delivery.routing_key.as_str(),
        message,
        Box::new(LapinAcker(delivery.acker)),
    )
}

fn to_basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut headers = FieldTable::default();
    for (key, value) in &properties.headers {
        headers.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }

    let delivery_mode = if properties.persistent {
        PERSISTENT_DELIVERY_MODE
    } else {
        1
    };

    BasicProperties::default()
        .with_message_id(ShortString::from(properties.message_id.clone()))
        .with_timestamp(properties.timestamp)
        .with_content_type(ShortString::from(properties.content_type.clone()))
        .with_kind(ShortString::from(properties.type_tag.clone()))
        .with_delivery_mode(delivery_mode)
        .with_headers(headers)
}

fn from_basic_properties(properties: &BasicProperties) -> MessageProperties {
    let headers: BTreeMap<String, String> = properties
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(key, value)| header_text(value).map(|v| (key.as_str().to_string(), v)))
                .collect()
        })
        .unwrap_or_default();

    MessageProperties {
        message_id: short_text(properties.message_id()),
        timestamp: properties.timestamp().unwrap_or(0),
        content_type: properties
            .content_type()
            .as_ref()
            .map(|c| c.as_str().to_string())
            .unwrap_or_else(|| JSON_CONTENT_TYPE.to_string()),
        type_tag: short_text(properties.kind()),
        persistent: *properties.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE),
        headers,
    }
}

fn short_text(value: &Option<ShortString>) -> String {
    value
        .as_ref()
        .map(|s| s.as_str().to_string())
        .unwrap_or_default()
}

fn header_text(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        _ => None,
    }
}

fn map_error(err: lapin::Error) -> BrokerError {
    match err {
        lapin::Error::ProtocolError(e) => BrokerError::Protocol(e.to_string()),
        other => BrokerError::ConnectionUnavailable(other.to_string()),
    }
}
