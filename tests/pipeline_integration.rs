//! Integration tests for tenant-isolated saves with post-commit publication.
//!
//! These tests verify the end-to-end flow:
//! 1. A unit of work bound to one tenant adds and mutates entities
//! 2. Saving commits them to the entity store
//! 3. Events raised before the save reach the broker exchange once
//! 4. Other tenants never see the committed entities
//!
//! Uses in-memory implementations of the store and the broker.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use ecommerce_common::adapters::messaging::{
    BrokerConnection, BrokerConsumer, BrokerPublisher, ConnectionSettings, InMemoryBrokerTransport,
};
use ecommerce_common::adapters::{FanoutEventPublisher, InMemoryEntityStore, LocalEventDispatcher};
use ecommerce_common::application::{TransactionalEventPipeline, UnitOfWork};
use ecommerce_common::domain::foundation::{DomainError, ErrorCode, EventId, PendingEvent, TenantId, Timestamp};
use ecommerce_common::domain::tenancy::{EntityCore, HasTenantScope, Persisted, TenantScope};
use ecommerce_common::domain_event;
use ecommerce_common::ports::{
    ConnectOptions, EventPublisher, EventSubscriber, LocalEventHandler, MessageHandler,
};

// =============================================================================
// Test Domain
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderCreated {
    event_id: EventId,
    order_number: String,
    tenant_id: TenantId,
    occurred_at: Timestamp,
}

domain_event!(OrderCreated, occurred_at = occurred_at, event_id = event_id);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderShipped {
    event_id: EventId,
    order_number: String,
    occurred_at: Timestamp,
}

domain_event!(OrderShipped, occurred_at = occurred_at, event_id = event_id);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Order {
    order_number: String,
    shipped: bool,
    #[serde(flatten)]
    core: EntityCore,
}

impl Order {
    fn place(tenant: TenantId, order_number: &str) -> Self {
        let mut core = EntityCore::new(tenant);
        core.raise(OrderCreated {
            event_id: EventId::new(),
            order_number: order_number.to_string(),
            tenant_id: tenant,
            occurred_at: Timestamp::now(),
        });
        Self {
            order_number: order_number.to_string(),
            shipped: false,
            core,
        }
    }

    fn ship(&mut self) {
        self.shipped = true;
        self.core.mark_updated();
        self.core.raise(OrderShipped {
            event_id: EventId::new(),
            order_number: self.order_number.clone(),
            occurred_at: Timestamp::now(),
        });
    }
}

impl HasTenantScope for Order {
    fn tenant_id(&self) -> &TenantId {
        self.core.tenant_id()
    }
}

impl Persisted for Order {
    const ENTITY_NAME: &'static str = "Order";

    fn entity_key(&self) -> String {
        self.order_number.clone()
    }

    fn tenant_scope() -> TenantScope<Self> {
        TenantScope::scoped()
    }

    fn pending_events(&self) -> &[PendingEvent] {
        self.core.pending_events()
    }

    fn clear_pending_events(&mut self) {
        self.core.clear_pending_events()
    }
}

// =============================================================================
// Test Infrastructure
// =============================================================================

struct Harness {
    store: Arc<InMemoryEntityStore>,
    transport: InMemoryBrokerTransport,
    connection: BrokerConnection,
    pipeline: Arc<TransactionalEventPipeline>,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(InMemoryEntityStore::new());
        let transport = InMemoryBrokerTransport::new();
        let connection = BrokerConnection::with_settings(
            Arc::new(transport.clone()),
            ConnectionSettings {
                connect: ConnectOptions {
                    uri: secrecy::SecretString::new("amqp://localhost".to_string()),
                    connection_name: Some("pipeline-tests".to_string()),
                },
                exchange: "ecommerce.events".to_string(),
                automatic_recovery: true,
                recovery_interval: Duration::from_millis(20),
            },
        );
        let publisher = BrokerPublisher::new(connection.clone());
        let pipeline = Arc::new(TransactionalEventPipeline::new(Arc::new(publisher)));
        Self {
            store,
            transport,
            connection,
            pipeline,
        }
    }

    fn unit_for(&self, tenant: TenantId) -> UnitOfWork {
        UnitOfWork::for_tenant(tenant, self.store.clone(), self.pipeline.clone())
    }

    fn routing_keys(&self) -> Vec<String> {
        self.transport
            .published()
            .into_iter()
            .map(|(_, routing_key, _)| routing_key)
            .collect()
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn created_order_is_published_and_visible_only_to_its_tenant() {
    let harness = Harness::new();
    let tenant_a = TenantId::new();
    let tenant_b = TenantId::new();

    let mut uow = harness.unit_for(tenant_a);
    uow.add(Order::place(tenant_a, "SO-1001")).unwrap();
    let outcome = uow.save_changes().await.unwrap();

    assert_eq!(outcome.entities_written, 1);
    assert_eq!(outcome.events_published, 1);
    assert!(outcome.fully_published());

    let published = harness.transport.published();
    assert_eq!(published.len(), 1);
    let (exchange, routing_key, message) = &published[0];
    assert_eq!(exchange, "ecommerce.events");
    assert_eq!(routing_key, "events.ordercreated");
    assert_eq!(message.header("EventType"), Some("OrderCreated"));
    let body: serde_json::Value = serde_json::from_slice(&message.body).unwrap();
    assert_eq!(body["orderNumber"], "SO-1001");

    let mut reader_a = harness.unit_for(tenant_a);
    let orders = reader_a.query::<Order>().await.unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].order_number, "SO-1001");

    let mut reader_b = harness.unit_for(tenant_b);
    assert!(reader_b.query::<Order>().await.unwrap().is_empty());
    assert!(reader_b.find::<Order>("SO-1001").await.unwrap().is_none());
}

#[tokio::test]
async fn events_are_published_in_harvest_order() {
    let harness = Harness::new();
    let tenant = TenantId::new();

    let mut uow = harness.unit_for(tenant);
    uow.add(Order::place(tenant, "SO-1")).unwrap();
    uow.add(Order::place(tenant, "SO-2")).unwrap();
    uow.tracked_mut::<Order>("SO-1").unwrap().unwrap().ship();
    uow.save_changes().await.unwrap();

    assert_eq!(
        harness.routing_keys(),
        vec![
            "events.ordercreated".to_string(),
            "events.ordershipped".to_string(),
            "events.ordercreated".to_string(),
        ]
    );
}

#[tokio::test]
async fn commit_failure_publishes_nothing_and_keeps_events() {
    let harness = Harness::new();
    let tenant = TenantId::new();

    let mut uow = harness.unit_for(tenant);
    uow.add(Order::place(tenant, "SO-7")).unwrap();
    harness.store.fail_next_commit();

    let err = uow.save_changes().await.unwrap_err();
    assert_eq!(err.code, ErrorCode::CommitFailed);
    assert!(harness.transport.published().is_empty());

    let order = uow.tracked_mut::<Order>("SO-7").unwrap().unwrap();
    assert_eq!(order.pending_events().len(), 1);

    let outcome = uow.save_changes().await.unwrap();
    assert_eq!(outcome.events_published, 1);
    assert_eq!(harness.routing_keys(), vec!["events.ordercreated".to_string()]);
}

#[tokio::test]
async fn repeated_saves_do_not_republish() {
    let harness = Harness::new();
    let tenant = TenantId::new();

    let mut uow = harness.unit_for(tenant);
    uow.add(Order::place(tenant, "SO-9")).unwrap();
    uow.save_changes().await.unwrap();

    let outcome = uow.save_changes().await.unwrap();
    assert_eq!(outcome.entities_written, 0);
    assert_eq!(outcome.events_published, 0);

    uow.tracked_mut::<Order>("SO-9").unwrap().unwrap().ship();
    let outcome = uow.save_changes().await.unwrap();
    assert_eq!(outcome.events_published, 1);

    assert_eq!(
        harness.routing_keys(),
        vec!["events.ordercreated".to_string(), "events.ordershipped".to_string()]
    );
}

#[tokio::test]
async fn broker_outage_does_not_undo_the_commit() {
    let harness = Harness::new();
    let tenant = TenantId::new();
    harness.transport.set_reachable(false);

    let mut uow = harness.unit_for(tenant);
    uow.add(Order::place(tenant, "SO-11")).unwrap();
    let outcome = uow.save_changes().await.unwrap();

    assert_eq!(outcome.entities_written, 1);
    assert_eq!(outcome.publish_failures.len(), 1);
    assert_eq!(outcome.publish_failures[0].event_type, "OrderCreated");
    assert_eq!(outcome.publish_failures[0].error.code, ErrorCode::BrokerUnavailable);

    let order = uow.tracked_mut::<Order>("SO-11").unwrap().unwrap();
    assert!(order.pending_events().is_empty());
    assert_eq!(harness.store.row_count(), 1);

    harness.connection.close().await;
}

#[tokio::test]
async fn writes_for_another_tenant_are_rejected() {
    let harness = Harness::new();
    let tenant_a = TenantId::new();
    let tenant_b = TenantId::new();

    let mut uow = harness.unit_for(tenant_a);
    let err = uow.add(Order::place(tenant_b, "SO-12")).unwrap_err();

    assert_eq!(err.code, ErrorCode::CrossTenantAccess);
    assert_eq!(uow.tracked_count(), 0);
}

#[tokio::test]
async fn key_taken_by_another_tenant_is_a_permanent_conflict() {
    let harness = Harness::new();
    let tenant_a = TenantId::new();
    let tenant_b = TenantId::new();

    let mut owner = harness.unit_for(tenant_a);
    owner.add(Order::place(tenant_a, "SO-13")).unwrap();
    owner.save_changes().await.unwrap();

    let mut other = harness.unit_for(tenant_b);
    other.add(Order::place(tenant_b, "SO-13")).unwrap();
    let err = other.save_changes().await.unwrap_err();

    assert_eq!(err.code, ErrorCode::KeyConflict);
    assert!(!err.is_retryable());
    assert!(!err.message.contains(&tenant_a.to_string()));
    assert_eq!(harness.routing_keys(), vec!["events.ordercreated".to_string()]);

    let retried = other.save_changes().await.unwrap_err();
    assert_eq!(retried.code, ErrorCode::KeyConflict);
}

// =============================================================================
// Downstream consumption
// =============================================================================

struct ConfirmationMailer {
    sent: Mutex<Vec<String>>,
}

#[async_trait]
impl MessageHandler<OrderCreated> for ConfirmationMailer {
    async fn handle(&self, message: OrderCreated) -> Result<(), DomainError> {
        self.sent.lock().unwrap().push(message.order_number);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ConfirmationMailer"
    }
}

#[tokio::test]
async fn subscribed_service_receives_committed_event() {
    let harness = Harness::new();
    let tenant = TenantId::new();
    let mailer = Arc::new(ConfirmationMailer {
        sent: Mutex::new(Vec::new()),
    });

    let consumer = BrokerConsumer::new(harness.connection.clone());
    let cancel = CancellationToken::new();
    let subscription = consumer
        .subscribe::<OrderCreated>("events.ordercreated", mailer.clone(), &cancel)
        .await
        .unwrap();

    let mut uow = harness.unit_for(tenant);
    uow.add(Order::place(tenant, "SO-21")).unwrap();
    uow.save_changes().await.unwrap();

    eventually(|| harness.transport.acked_count() == 1).await;
    assert_eq!(*mailer.sent.lock().unwrap(), vec!["SO-21".to_string()]);

    subscription.cancel();
    subscription.join().await;
    harness.connection.close().await;
}

struct AuditTrail {
    seen: Mutex<Vec<&'static str>>,
}

#[async_trait]
impl LocalEventHandler for AuditTrail {
    async fn handle(&self, event: PendingEvent) -> Result<(), DomainError> {
        self.seen.lock().unwrap().push(event.event_type());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "AuditTrail"
    }
}

#[tokio::test]
async fn fanout_reaches_broker_and_local_handlers() {
    let harness = Harness::new();
    let tenant = TenantId::new();

    let audit = Arc::new(AuditTrail {
        seen: Mutex::new(Vec::new()),
    });
    let local = LocalEventDispatcher::new();
    local.subscribe("OrderCreated", audit.clone());

    let broker: Arc<dyn EventPublisher> = Arc::new(BrokerPublisher::new(harness.connection.clone()));
    let local: Arc<dyn EventPublisher> = Arc::new(local);
    let fanout = FanoutEventPublisher::new(vec![broker, local]);
    let pipeline = Arc::new(TransactionalEventPipeline::new(Arc::new(fanout)));

    let mut uow = UnitOfWork::for_tenant(tenant, harness.store.clone(), pipeline);
    uow.add(Order::place(tenant, "SO-31")).unwrap();
    let outcome = uow.save_changes().await.unwrap();

    assert!(outcome.fully_published());
    assert_eq!(harness.routing_keys(), vec!["events.ordercreated".to_string()]);
    assert_eq!(*audit.seen.lock().unwrap(), vec!["OrderCreated"]);
}
