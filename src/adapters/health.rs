//! Readiness probes for the broker and the entity store.

use async_trait::async_trait;
use std::sync::Arc;

use super::messaging::{BrokerConnection, ConnectionState};
use crate::ports::{EntityStore, HealthCheck, HealthStatus};

/// Healthy while the broker connection is `Ready` with an open channel.
///
/// Never initiates a connection.
pub struct BrokerHealthCheck {
    connection: BrokerConnection,
}

impl BrokerHealthCheck {
    pub fn new(connection: BrokerConnection) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl HealthCheck for BrokerHealthCheck {
    fn name(&self) -> &'static str {
        "rabbitmq"
    }

    async fn check(&self) -> HealthStatus {
        if self.connection.is_ready() {
            return HealthStatus::Healthy;
        }
        match self.connection.state() {
            ConnectionState::Ready => HealthStatus::Unhealthy("channel is closed".to_string()),
            state => HealthStatus::Unhealthy(format!("connection is {}", state)),
        }
    }
}

/// Healthy while the entity store answers a ping.
pub struct DatabaseHealthCheck {
    store: Arc<dyn EntityStore>,
}

impl DatabaseHealthCheck {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl HealthCheck for DatabaseHealthCheck {
    fn name(&self) -> &'static str {
        "database"
    }

    async fn check(&self) -> HealthStatus {
        match self.store.ping().await {
            Ok(()) => HealthStatus::Healthy,
            Err(e) => {
                tracing::warn!(error = %e, "Database health check failed");
                HealthStatus::Unhealthy(e.message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::messaging::{ConnectionSettings, InMemoryBrokerTransport};
    use crate::adapters::persistence::InMemoryEntityStore;
    use crate::ports::ConnectOptions;
    use secrecy::SecretString;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn connection(transport: &InMemoryBrokerTransport) -> BrokerConnection {
        let settings = ConnectionSettings {
            connect: ConnectOptions {
                uri: SecretString::new("amqp://localhost".to_string()),
                connection_name: None,
            },
            exchange: "ecommerce.events".to_string(),
            automatic_recovery: false,
            recovery_interval: Duration::from_millis(20),
        };
        BrokerConnection::with_settings(Arc::new(transport.clone()), settings)
    }

    #[tokio::test]
    async fn broker_check_follows_connection_state() {
        let transport = InMemoryBrokerTransport::new();
        let connection = connection(&transport);
        let check = BrokerHealthCheck::new(connection.clone());

        assert_eq!(
            check.check().await,
            HealthStatus::Unhealthy("connection is uninitialized".to_string())
        );

        connection.initialize(&CancellationToken::new()).await.unwrap();
        assert!(check.check().await.is_healthy());

        transport.drop_connections();
        assert_eq!(
            check.check().await,
            HealthStatus::Unhealthy("channel is closed".to_string())
        );
        assert_eq!(transport.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn database_check_pings_store() {
        let check = DatabaseHealthCheck::new(Arc::new(InMemoryEntityStore::new()));
        assert_eq!(check.name(), "database");
        assert!(check.check().await.is_healthy());
    }
}
