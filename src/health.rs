//! Health check module
//! Provides health status for the application and its dependencies

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{error, warn};

use crate::api::ApiState;
use crate::database::Repositories;
use crate::payments::factory::ProviderRegistry;
use crate::payments::types::ProviderKind;

/// Health status response
#[derive(Debug, Serialize, Clone)]
pub struct HealthStatus {
    pub status: HealthState,
    pub checks: HashMap<String, ComponentHealth>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Overall health state
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Individual component health status
#[derive(Debug, Serialize, Clone)]
pub struct ComponentHealth {
    pub status: ComponentState,
    pub response_time_ms: Option<u128>,
    pub details: Option<String>,
}

/// Component state
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Up,
    Down,
    Warning,
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthStatus {
    pub fn new() -> Self {
        Self {
            status: HealthState::Healthy,
            checks: HashMap::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.status, HealthState::Healthy)
    }

    fn insert(&mut self, name: &str, component: ComponentHealth) {
        self.status = match (self.status, component.status) {
            (_, ComponentState::Down) | (HealthState::Unhealthy, _) => HealthState::Unhealthy,
            (_, ComponentState::Warning) | (HealthState::Degraded, _) => HealthState::Degraded,
            (HealthState::Healthy, ComponentState::Up) => HealthState::Healthy,
        };
        self.checks.insert(name.to_string(), component);
    }
}

impl ComponentHealth {
    pub fn up(response_time_ms: Option<u128>) -> Self {
        Self {
            status: ComponentState::Up,
            response_time_ms,
            details: None,
        }
    }

    pub fn down(details: Option<String>) -> Self {
        Self {
            status: ComponentState::Down,
            response_time_ms: None,
            details,
        }
    }

    pub fn warning(response_time_ms: Option<u128>, details: Option<String>) -> Self {
        Self {
            status: ComponentState::Warning,
            response_time_ms,
            details,
        }
    }
}

/// Health checker for the application
#[derive(Clone)]
pub struct HealthChecker {
    repos: Repositories,
    providers: ProviderRegistry,
}

impl HealthChecker {
    pub fn new(repos: Repositories, providers: ProviderRegistry) -> Self {
        Self { repos, providers }
    }

    /// Perform comprehensive health check
    pub async fn check_health(&self) -> HealthStatus {
        let mut health_status = HealthStatus::new();

        // Check storage health
        let start = Instant::now();
        match timeout(Duration::from_secs(5), self.repos.health_check()).await {
            Ok(Ok(())) if self.repos.is_persistent() => {
                health_status.insert(
                    "database",
                    ComponentHealth::up(Some(start.elapsed().as_millis())),
                );
            }
            Ok(Ok(())) => {
                health_status.insert(
                    "database",
                    ComponentHealth::warning(
                        None,
                        Some("in-memory store, data is not persisted".to_string()),
                    ),
                );
            }
            Ok(Err(e)) => {
                error!("Database health check failed: {}", e);
                health_status.insert("database", ComponentHealth::down(Some(e.to_string())));
            }
            Err(_) => {
                error!("Database health check timed out");
                health_status.insert(
                    "database",
                    ComponentHealth::down(Some("Timeout".to_string())),
                );
            }
        }

        // Check configured payment providers
        let available = self.providers.list_available();
        let missing: Vec<&str> = [ProviderKind::Push, ProviderKind::Hosted]
            .iter()
            .filter(|kind| !available.contains(kind))
            .map(|kind| kind.as_str())
            .collect();
        let providers = if available.is_empty() {
            ComponentHealth::down(Some("no payment provider configured".to_string()))
        } else if !missing.is_empty() {
            warn!(missing = ?missing, "payment providers not configured");
            ComponentHealth::warning(None, Some(format!("not configured: {}", missing.join(", "))))
        } else {
            ComponentHealth::up(None)
        };
        health_status.insert("payment_providers", providers);

        health_status
    }
}

/// GET /health
pub async fn health_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let status = state.health.check_health().await;
    let code = match status.status {
        HealthState::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthState::Healthy | HealthState::Degraded => StatusCode::OK,
    };
    (code, Json(status))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_status_creation() {
        let health_status = HealthStatus::new();
        assert!(matches!(health_status.status, HealthState::Healthy));
        assert!(health_status.checks.is_empty());
        assert!(health_status.timestamp <= chrono::Utc::now());
    }

    #[test]
    fn test_component_health_states() {
        let up_health = ComponentHealth::up(Some(100));
        assert!(matches!(up_health.status, ComponentState::Up));
        assert_eq!(up_health.response_time_ms, Some(100));

        let down_health = ComponentHealth::down(Some("Test error".to_string()));
        assert!(matches!(down_health.status, ComponentState::Down));
        assert_eq!(down_health.details, Some("Test error".to_string()));

        let warning_health = ComponentHealth::warning(Some(500), Some("Slow response".to_string()));
        assert!(matches!(warning_health.status, ComponentState::Warning));
        assert_eq!(warning_health.response_time_ms, Some(500));
    }

    #[test]
    fn worst_component_decides_overall_state() {
        let mut status = HealthStatus::new();
        status.insert("a", ComponentHealth::up(None));
        assert_eq!(status.status, HealthState::Healthy);
        status.insert("b", ComponentHealth::warning(None, None));
        assert_eq!(status.status, HealthState::Degraded);
        status.insert("c", ComponentHealth::down(None));
        assert_eq!(status.status, HealthState::Unhealthy);
        status.insert("d", ComponentHealth::up(None));
        assert_eq!(status.status, HealthState::Unhealthy);
    }

    #[tokio::test]
    async fn in_memory_without_providers_is_unhealthy() {
        let checker = HealthChecker::new(Repositories::in_memory(), ProviderRegistry::new());
        let status = checker.check_health().await;
        assert_eq!(status.status, HealthState::Unhealthy);
        assert!(matches!(
            status.checks["database"].status,
            ComponentState::Warning
        ));
        assert!(matches!(
            status.checks["payment_providers"].status,
            ComponentState::Down
        ));
    }
}
