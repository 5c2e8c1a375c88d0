//! BrokerPublisher - Durable JSON publishes to the shared topic exchange.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::BrokerConnection;
use crate::domain::foundation::{DomainError, PendingEvent, PublishableEvent};
use crate::ports::{BrokerError, BrokerMessage, EventPublisher};

/// Header carrying the domain event type name.
pub const EVENT_TYPE_HEADER: &str = "EventType";

/// Header carrying the event occurrence time (RFC 3339).
pub const OCCURRED_AT_HEADER: &str = "OccurredAt";

/// Routing key for a domain event type: `events.<lowercase type name>`.
pub fn event_routing_key(event_type: &str) -> String {
    format!("events.{}", event_type.to_lowercase())
}

/// Publishes messages through a shared [`BrokerConnection`].
///
/// One broker round-trip per message, no batching and no local buffering.
/// When the connection is not ready a single lazy initialization is
/// attempted before failing with a retryable error.
#[derive(Clone, Debug)]
pub struct BrokerPublisher {
    connection: BrokerConnection,
}

impl BrokerPublisher {
    pub fn new(connection: BrokerConnection) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &BrokerConnection {
        &self.connection
    }

    /// Serializes `message` as JSON and publishes it under `routing_key`.
    ///
    /// Object keys are sent in camelCase whatever `T`'s serde naming is.
    /// The type tag is the unqualified Rust type name of `T`.
    pub async fn publish<T>(
        &self,
        message: &T,
        routing_key: &str,
        cancel: &CancellationToken,
    ) -> Result<(), BrokerError>
    where
        T: Serialize + ?Sized,
    {
        let type_tag = short_type_name::<T>();
        let body = serde_json::to_value(message)
            .and_then(encode_body)
            .map_err(|e| {
                tracing::error!(
                    routing_key = %routing_key,
                    message_type = %type_tag,
                    error = %e,
                    "Failed to serialize message"
                );
                BrokerError::from(e)
            })?;

        self.publish_message(BrokerMessage::new(body, type_tag), routing_key, cancel)
            .await
    }

    /// Publishes a domain event under `events.<lowercase type name>` with
    /// the `EventType` and `OccurredAt` headers attached.
    pub async fn publish_domain_event(
        &self,
        event: &dyn PublishableEvent,
        cancel: &CancellationToken,
    ) -> Result<(), BrokerError> {
        let event_type = event.event_type();
        let routing_key = event_routing_key(event_type);

        let payload = event.to_json().map_err(|e| {
            tracing::error!(
                event_id = %event.event_id(),
                message_type = %event_type,
                error = %e,
                "Failed to serialize domain event"
            );
            BrokerError::from(e)
        })?;
        let body = encode_body(payload)?;

        let message = BrokerMessage::new(body, event_type)
            .with_header(EVENT_TYPE_HEADER, event_type)
            .with_header(OCCURRED_AT_HEADER, event.occurred_at().to_rfc3339());

        self.publish_message(message, &routing_key, cancel).await
    }

    /// Publishes a prepared envelope as-is.
    pub async fn publish_message(
        &self,
        message: BrokerMessage,
        routing_key: &str,
        cancel: &CancellationToken,
    ) -> Result<(), BrokerError> {
        let message_type = message.properties.type_tag.clone();

        let channel = self.connection.ensure_ready(cancel).await.map_err(|e| {
            tracing::warn!(
                routing_key = %routing_key,
                message_type = %message_type,
                error = %e,
                "Broker not ready, publish rejected"
            );
            e
        })?;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BrokerError::Cancelled),
            result = channel.publish(self.connection.exchange(), routing_key, &message) => result,
        };

        match result {
            Ok(()) => {
                tracing::debug!(
                    routing_key = %routing_key,
                    message_type = %message_type,
                    message_id = %message.properties.message_id,
                    "Published message"
                );
                Ok(())
            }
            Err(err) => {
                tracing::error!(
                    routing_key = %routing_key,
                    message_type = %message_type,
                    error = %err,
                    "Failed to publish message"
                );
                self.connection.report_failure(&channel, &err);
                Err(err)
            }
        }
    }
}

#[async_trait]
impl EventPublisher for BrokerPublisher {
    async fn publish(&self, event: PendingEvent) -> Result<(), DomainError> {
        let cancel = self.connection.shutdown_token().child_token();
        self.publish_domain_event(event.as_ref(), &cancel)
            .await
            .map_err(DomainError::from)
    }
}

/// Wire body: camelCase object keys at every depth.
fn encode_body(payload: JsonValue) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&camel_case_keys(payload))
}

fn camel_case_keys(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => JsonValue::Object(
            map.into_iter()
                .map(|(key, value)| (camel_case(&key), camel_case_keys(value)))
                .collect(),
        ),
        JsonValue::Array(items) => JsonValue::Array(items.into_iter().map(camel_case_keys).collect()),
        other => other,
    }
}

/// `order_number` becomes `orderNumber`; keys without underscores are kept.
fn camel_case(key: &str) -> String {
    if !key.contains('_') {
        return key.to_string();
    }
    let mut out = String::with_capacity(key.len());
    let mut upper_next = false;
    for c in key.chars() {
        if c == '_' {
            upper_next = !out.is_empty();
        } else if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// `my_crate::orders::OrderPlaced<Foo>` becomes `OrderPlaced`.
fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::messaging::{ConnectionSettings, InMemoryBrokerTransport};
    use crate::domain::foundation::{ErrorCode, EventId, Timestamp};
    use crate::domain_event;
    use crate::ports::ConnectOptions;
    use secrecy::SecretString;
    use serde::Serializer;
    use std::time::Duration;

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    struct OrderCreated {
        event_id: EventId,
        order_number: String,
        occurred_at: Timestamp,
    }

    domain_event!(OrderCreated, occurred_at = occurred_at, event_id = event_id);

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct StockReserved {
        sku: String,
        quantity_reserved: u32,
    }

    #[derive(Debug, Serialize)]
    struct StockReleased {
        event_id: EventId,
        order_number: String,
        line_items: Vec<LineItem>,
        occurred_at: Timestamp,
    }

    domain_event!(StockReleased, occurred_at = occurred_at, event_id = event_id);

    #[derive(Debug, Serialize)]
    struct LineItem {
        sku_code: String,
        quantity: u32,
    }

    struct Unencodable;

    impl Serialize for Unencodable {
        fn serialize<S: Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("cannot encode"))
        }
    }

    fn publisher(transport: &InMemoryBrokerTransport, automatic_recovery: bool) -> BrokerPublisher {
        let settings = ConnectionSettings {
            connect: ConnectOptions {
                uri: SecretString::new("amqp://localhost".to_string()),
                connection_name: None,
            },
            exchange: "ecommerce.events".to_string(),
            automatic_recovery,
            recovery_interval: Duration::from_millis(20),
        };
        BrokerPublisher::new(BrokerConnection::with_settings(Arc::new(transport.clone()), settings))
    }

    #[test]
    fn routing_key_is_lowercased_event_type() {
        assert_eq!(event_routing_key("OrderCreated"), "events.ordercreated");
    }

    #[test]
    fn short_type_name_strips_path_and_generics() {
        assert_eq!(short_type_name::<StockReserved>(), "StockReserved");
        assert_eq!(short_type_name::<Vec<String>>(), "Vec");
    }

    #[tokio::test]
    async fn publish_builds_persistent_json_envelope() {
        let transport = InMemoryBrokerTransport::new();
        let publisher = publisher(&transport, true);
        let message = StockReserved {
            sku: "SKU-7".to_string(),
            quantity_reserved: 3,
        };

        publisher
            .publish(&message, "inventory.reserved", &CancellationToken::new())
            .await
            .unwrap();

        let published = transport.published();
        assert_eq!(published.len(), 1);
        let (exchange, routing_key, envelope) = &published[0];
        assert_eq!(exchange, "ecommerce.events");
        assert_eq!(routing_key, "inventory.reserved");
        assert!(envelope.properties.persistent);
        assert_eq!(envelope.properties.type_tag, "StockReserved");
        assert_eq!(envelope.properties.content_type, "application/json");

        let body: serde_json::Value = serde_json::from_slice(&envelope.body).unwrap();
        assert_eq!(body["quantityReserved"], 3);
    }

    #[tokio::test]
    async fn publish_domain_event_attaches_headers() {
        let transport = InMemoryBrokerTransport::new();
        let publisher = publisher(&transport, true);
        let event = OrderCreated {
            event_id: EventId::new(),
            order_number: "SO-42".to_string(),
            occurred_at: Timestamp::now(),
        };

        publisher
            .publish_domain_event(&event, &CancellationToken::new())
            .await
            .unwrap();

        let (_, routing_key, envelope) = &transport.published()[0];
        assert_eq!(routing_key, "events.ordercreated");
        assert_eq!(envelope.header(EVENT_TYPE_HEADER), Some("OrderCreated"));
        assert_eq!(
            envelope.header(OCCURRED_AT_HEADER),
            Some(event.occurred_at.to_rfc3339().as_str())
        );
    }

    #[test]
    fn camel_case_rewrites_snake_case_only() {
        assert_eq!(camel_case("order_number"), "orderNumber");
        assert_eq!(camel_case("orderNumber"), "orderNumber");
        assert_eq!(camel_case("sku"), "sku");
        assert_eq!(camel_case("_private_field"), "privateField");
        assert_eq!(camel_case("line_2_total"), "line2Total");
    }

    #[tokio::test]
    async fn event_without_serde_renames_goes_out_in_camel_case() {
        let transport = InMemoryBrokerTransport::new();
        let publisher = publisher(&transport, true);
        let event = StockReleased {
            event_id: EventId::new(),
            order_number: "SO-1".to_string(),
            line_items: vec![LineItem {
                sku_code: "SKU-9".to_string(),
                quantity: 2,
            }],
            occurred_at: Timestamp::now(),
        };

        publisher
            .publish_domain_event(&event, &CancellationToken::new())
            .await
            .unwrap();

        let (_, _, envelope) = &transport.published()[0];
        let body: serde_json::Value = serde_json::from_slice(&envelope.body).unwrap();
        assert_eq!(body["orderNumber"], "SO-1");
        assert!(body.get("order_number").is_none());
        assert!(body.get("eventId").is_some());
        assert!(body.get("occurredAt").is_some());
        assert_eq!(body["lineItems"][0]["skuCode"], "SKU-9");
        assert_eq!(body["lineItems"][0]["quantity"], 2);
    }

    #[tokio::test]
    async fn serialization_failure_is_not_retryable_and_sends_nothing() {
        let transport = InMemoryBrokerTransport::new();
        let publisher = publisher(&transport, true);

        let err = publisher
            .publish(&Unencodable, "anything", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, BrokerError::Serialization(_)));
        assert!(!err.is_retryable());
        assert!(transport.published().is_empty());
        assert_eq!(transport.connect_attempts(), 0);
    }

    #[tokio::test]
    async fn unreachable_broker_fails_fast_as_retryable() {
        let transport = InMemoryBrokerTransport::new();
        transport.set_reachable(false);
        let publisher = publisher(&transport, false);

        let err = publisher
            .publish(&"ping", "health", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(transport.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn event_publisher_maps_to_domain_error() {
        let transport = InMemoryBrokerTransport::new();
        transport.set_reachable(false);
        let publisher = publisher(&transport, false);
        let event: PendingEvent = Arc::new(OrderCreated {
            event_id: EventId::new(),
            order_number: "SO-1".to_string(),
            occurred_at: Timestamp::now(),
        });

        let err = EventPublisher::publish(&publisher, event).await.unwrap_err();

        assert_eq!(err.code, ErrorCode::BrokerUnavailable);
    }

    #[tokio::test]
    async fn message_ids_differ_between_publishes() {
        let transport = InMemoryBrokerTransport::new();
        let publisher = publisher(&transport, true);
        let cancel = CancellationToken::new();

        publisher.publish(&"a", "k", &cancel).await.unwrap();
        publisher.publish(&"a", "k", &cancel).await.unwrap();

        let published = transport.published();
        assert_ne!(published[0].2.properties.message_id, published[1].2.properties.message_id);
    }
}
