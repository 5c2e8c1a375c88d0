//! HealthCheck port - Readiness probes for infrastructure dependencies.

use async_trait::async_trait;
use std::fmt;

/// Result of one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy(reason) => write!(f, "unhealthy: {}", reason),
        }
    }
}

/// A named probe of one dependency.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Name used in readiness reports (e.g. "rabbitmq").
    fn name(&self) -> &'static str;

    async fn check(&self) -> HealthStatus;
}
