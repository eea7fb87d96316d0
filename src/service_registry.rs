use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ErrorCode, GatewayError};
use crate::store::{ChangeEvent, ChangeEventStore, ChangeType};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Healthy,
    Unhealthy,
    Unknown,
    Maintenance,
}

impl ServiceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceStatus::Healthy => "healthy",
            ServiceStatus::Unhealthy => "unhealthy",
            ServiceStatus::Unknown => "unknown",
            ServiceStatus::Maintenance => "maintenance",
        }
    }
}

/// Identity and live state of one backend GraphQL service. Status and
/// last-check timestamp are written only by health probes and deregistration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    pub health_check_url: String,
    pub tags: Vec<String>,
    pub weight: u32,
    pub status: ServiceStatus,
    pub last_health_check: Option<DateTime<Utc>>,
    pub schema_id: Option<Uuid>,
    pub metadata: HashMap<String, String>,
    pub registered_at: DateTime<Utc>,
}

/// Caller-supplied registration payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub health_check_url: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_weight() -> u32 {
    1
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterServiceResponse {
    pub service_id: Uuid,
    pub status: ServiceStatus,
    pub registered_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthCheckResult {
    pub service: String,
    pub status: ServiceStatus,
    pub checked_at: DateTime<Utc>,
}

/// Live catalog of backend services plus their probed health.
///
/// Cloning is cheap; all clones share the same catalog, which lets probe
/// tasks be spawned without holding any lock across an await.
#[derive(Clone)]
pub struct ServiceRegistry {
    services: Arc<RwLock<HashMap<String, ServiceDescriptor>>>,
    events: Arc<dyn ChangeEventStore>,
    client: reqwest::Client,
    probe_timeout: Duration,
}

impl ServiceRegistry {
    pub fn new(events: Arc<dyn ChangeEventStore>, probe_timeout: Duration) -> Self {
        ServiceRegistry {
            services: Arc::new(RwLock::new(HashMap::new())),
            events,
            client: reqwest::Client::new(),
            probe_timeout,
        }
    }

    /// Upserts a service by name. Re-registration updates metadata in place
    /// without resetting health status; first registration starts at
    /// `Unknown`, emits a change event and schedules one initial probe that
    /// the call does not wait for.
    pub async fn register(
        &self,
        registration: ServiceRegistration,
    ) -> Result<RegisterServiceResponse, GatewayError> {
        if registration.name.trim().is_empty() {
            return Err(GatewayError::new(
                ErrorCode::SchemaValidation,
                "service name is required",
            )
            .with_operation("register_service"));
        }
        if registration.url.trim().is_empty() {
            return Err(GatewayError::new(
                ErrorCode::SchemaValidation,
                "service url is required",
            )
            .with_service(&registration.name)
            .with_operation("register_service"));
        }

        let health_check_url = registration
            .health_check_url
            .clone()
            .unwrap_or_else(|| format!("{}/health", registration.url.trim_end_matches('/')));

        let mut services = self.services.write().await;
        if let Some(existing) = services.get_mut(&registration.name) {
            existing.url = registration.url;
            existing.health_check_url = health_check_url;
            existing.tags = registration.tags;
            existing.weight = registration.weight;
            existing.metadata = registration.metadata;
            debug!(service = %existing.name, "service re-registered, metadata updated");
            return Ok(RegisterServiceResponse {
                service_id: existing.id,
                status: existing.status,
                registered_at: existing.registered_at,
            });
        }

        let descriptor = ServiceDescriptor {
            id: Uuid::new_v4(),
            name: registration.name.clone(),
            url: registration.url,
            health_check_url,
            tags: registration.tags,
            weight: registration.weight,
            status: ServiceStatus::Unknown,
            last_health_check: None,
            schema_id: None,
            metadata: registration.metadata,
            registered_at: Utc::now(),
        };
        let response = RegisterServiceResponse {
            service_id: descriptor.id,
            status: descriptor.status,
            registered_at: descriptor.registered_at,
        };
        let name = descriptor.name.clone();
        services.insert(name.clone(), descriptor);
        drop(services);

        let mut event = ChangeEvent::new(&name, ChangeType::ServiceRegistered);
        event.details.insert("initial_status".into(), "unknown".into());
        self.events.append(event).await;
        info!(service = %name, "service registered");

        // Fire-and-forget initial probe; registration does not wait for it.
        let registry = self.clone();
        tokio::spawn(async move {
            registry.probe_service(&name).await;
        });

        Ok(response)
    }

    pub async fn deregister(&self, name: &str) -> Result<(), GatewayError> {
        let removed = self.services.write().await.remove(name);
        let Some(descriptor) = removed else {
            return Err(GatewayError::new(
                ErrorCode::ServiceUnavailable,
                format!("service '{name}' is not registered"),
            )
            .with_service(name)
            .with_operation("deregister_service"));
        };

        let mut event = ChangeEvent::new(name, ChangeType::ServiceDeregistered);
        event.details.insert("last_url".into(), descriptor.url);
        event
            .details
            .insert("last_status".into(), descriptor.status.as_str().into());
        self.events.append(event).await;
        info!(service = %name, "service deregistered");
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<ServiceDescriptor> {
        self.services.read().await.get(name).cloned()
    }

    pub async fn all_services(&self) -> Vec<ServiceDescriptor> {
        self.services.read().await.values().cloned().collect()
    }

    /// Snapshot of services currently marked healthy. Never probes; returns
    /// last known state only.
    pub async fn healthy_services(&self) -> Vec<ServiceDescriptor> {
        self.services
            .read()
            .await
            .values()
            .filter(|s| s.status == ServiceStatus::Healthy)
            .cloned()
            .collect()
    }

    /// Records the active schema for a service, creating the descriptor when
    /// a schema arrives before explicit registration.
    pub async fn attach_schema(&self, name: &str, url: &str, schema_id: Uuid) {
        let mut services = self.services.write().await;
        match services.get_mut(name) {
            Some(descriptor) => descriptor.schema_id = Some(schema_id),
            None => {
                let descriptor = ServiceDescriptor {
                    id: Uuid::new_v4(),
                    name: name.to_string(),
                    url: url.to_string(),
                    health_check_url: format!("{}/health", url.trim_end_matches('/')),
                    tags: Vec::new(),
                    weight: 1,
                    status: ServiceStatus::Unknown,
                    last_health_check: None,
                    schema_id: Some(schema_id),
                    metadata: HashMap::new(),
                    registered_at: Utc::now(),
                };
                services.insert(name.to_string(), descriptor);
            }
        }
    }

    /// Long-lived probe loop. Every tick fans out one independent task per
    /// registered service so a slow backend never delays the others. Flipping
    /// the shutdown channel stops the loop before its next tick.
    pub async fn run_health_monitoring(
        &self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(interval_ms = interval.as_millis() as u64, "health monitoring started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let names: Vec<String> = {
                        let services = self.services.read().await;
                        services.keys().cloned().collect()
                    };
                    for name in names {
                        let registry = self.clone();
                        tokio::spawn(async move {
                            registry.probe_service(&name).await;
                        });
                    }
                }
                _ = shutdown.changed() => {
                    info!("health monitoring stopped");
                    return;
                }
            }
        }
    }

    /// On-demand probe pass that waits for every result, used by diagnostics.
    pub async fn perform_health_checks(&self) -> Vec<HealthCheckResult> {
        let services = self.all_services().await;
        let probes = services.into_iter().map(|descriptor| {
            let registry = self.clone();
            async move {
                let status = registry.probe_service(&descriptor.name).await;
                HealthCheckResult {
                    service: descriptor.name,
                    status,
                    checked_at: Utc::now(),
                }
            }
        });
        futures::future::join_all(probes).await
    }

    /// One bounded-timeout GET against the service's health endpoint. A 2xx
    /// response means healthy; anything else, including timeout or connect
    /// failure, means unhealthy. The descriptor is updated either way; probe
    /// failures are state, never errors.
    async fn probe_service(&self, name: &str) -> ServiceStatus {
        let health_url = match self.get(name).await {
            Some(descriptor) => descriptor.health_check_url,
            // Deregistered between snapshot and probe.
            None => return ServiceStatus::Unknown,
        };

        let status = match self
            .client
            .get(&health_url)
            .timeout(self.probe_timeout)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => ServiceStatus::Healthy,
            Ok(response) => {
                debug!(service = %name, status = %response.status(), "health probe rejected");
                ServiceStatus::Unhealthy
            }
            Err(e) => {
                warn!(service = %name, error = %e, "health probe failed");
                ServiceStatus::Unhealthy
            }
        };

        let mut services = self.services.write().await;
        if let Some(descriptor) = services.get_mut(name) {
            descriptor.status = status;
            descriptor.last_health_check = Some(Utc::now());
        }
        status
    }
}
