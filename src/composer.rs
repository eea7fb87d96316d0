use chrono::Utc;
use graphql_parser::parse_schema;
use graphql_parser::schema::{Definition, TypeDefinition};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ErrorCode, GatewayError};
use crate::schema_registry::{SchemaRecord, SchemaRegistry};
use crate::service_registry::ServiceRegistry;
use crate::store::{
    ChangeEvent, ChangeEventStore, ChangeType, Composition, CompositionStatus, CompositionStore,
};

/// Contributing services above this count draw a performance warning.
const SERVICE_COUNT_WARNING_THRESHOLD: usize = 10;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ComposeOptions {
    /// When set, only these services are considered (still intersected with
    /// the healthy set).
    #[serde(default)]
    pub services: Option<Vec<String>>,
}

/// One backend's contribution to the federated schema.
#[derive(Clone, Debug)]
pub struct ServiceEndpoint {
    pub url: String,
    pub sdl: String,
}

/// Composition-time ownership index: which services define which types and
/// fields. This is what a field-routing executor would partition queries by.
#[derive(Clone, Default)]
pub struct FederatedSchema {
    pub services: HashMap<String, ServiceEndpoint>,
    pub type_to_service_map: HashMap<String, Vec<String>>,
}

/// Builds point-in-time compositions from the healthy service set and their
/// active schemas. Composition is SDL concatenation; type-level merging is a
/// known non-goal, but the ownership index is built here so an executor can
/// route by field ownership.
#[derive(Clone)]
pub struct SchemaComposer {
    registry: ServiceRegistry,
    schemas: SchemaRegistry,
    compositions: Arc<dyn CompositionStore>,
    events: Arc<dyn ChangeEventStore>,
    active_cache: Arc<RwLock<Option<Composition>>>,
    federated_cache: Arc<RwLock<Option<FederatedSchema>>>,
}

impl SchemaComposer {
    pub fn new(
        registry: ServiceRegistry,
        schemas: SchemaRegistry,
        compositions: Arc<dyn CompositionStore>,
        events: Arc<dyn ChangeEventStore>,
    ) -> Self {
        SchemaComposer {
            registry,
            schemas,
            compositions,
            events,
            active_cache: Arc::new(RwLock::new(None)),
            federated_cache: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn compose(&self, options: ComposeOptions) -> Result<Composition, GatewayError> {
        let healthy = self.registry.healthy_services().await;
        let candidates: Vec<String> = match &options.services {
            Some(allowed) => healthy
                .iter()
                .filter(|s| allowed.contains(&s.name))
                .map(|s| s.name.clone())
                .collect(),
            None => healthy.iter().map(|s| s.name.clone()).collect(),
        };

        let mut warnings = Vec::new();
        let mut contributing: Vec<(String, SchemaRecord)> = Vec::new();
        for name in candidates {
            match self.schemas.latest_active_valid(&name).await {
                Some(record) => contributing.push((name, record)),
                None => {
                    warn!(service = %name, "service has no active schema, skipped from composition");
                    warnings.push(format!("service '{name}' has no active schema, skipped"));
                }
            }
        }

        if contributing.is_empty() {
            let failed = Composition {
                id: Uuid::new_v4(),
                services: Vec::new(),
                composed_sdl: String::new(),
                status: CompositionStatus::Failed,
                validation_errors: vec!["no valid schemas available for composition".into()],
                warnings: warnings.clone(),
                version: self.next_version().await,
                created_at: Utc::now(),
            };
            self.compositions.insert(failed).await;
            return Err(GatewayError::new(
                ErrorCode::CompositionFailed,
                "no valid schemas available for composition",
            )
            .with_operation("compose_schema"));
        }

        let composed_sdl = contributing
            .iter()
            .map(|(_, record)| record.sdl.trim())
            .collect::<Vec<_>>()
            .join("\n\n");

        let mut validation_errors = Vec::new();
        if composed_sdl.trim().is_empty() {
            validation_errors.push("composed schema is empty".into());
        }
        if contributing.len() > SERVICE_COUNT_WARNING_THRESHOLD {
            warnings.push(format!(
                "composition spans {} services, which may slow query planning",
                contributing.len()
            ));
        }

        let status = if validation_errors.is_empty() {
            CompositionStatus::Active
        } else {
            CompositionStatus::Invalid
        };

        let composition = Composition {
            id: Uuid::new_v4(),
            services: contributing.iter().map(|(name, _)| name.clone()).collect(),
            composed_sdl,
            status,
            validation_errors: validation_errors.clone(),
            warnings: warnings.clone(),
            version: self.next_version().await,
            created_at: Utc::now(),
        };

        self.compositions.insert(composition.clone()).await;
        self.refresh_caches(&contributing).await;

        let mut event = ChangeEvent::new("gateway", ChangeType::Composition);
        event
            .details
            .insert("services".into(), composition.services.join(","));
        event
            .details
            .insert("status".into(), format!("{:?}", composition.status).to_lowercase());
        if !validation_errors.is_empty() {
            event
                .details
                .insert("validation_errors".into(), validation_errors.join("; "));
        }
        if !warnings.is_empty() {
            event.details.insert("warnings".into(), warnings.join("; "));
        }
        self.events.append(event).await;

        info!(
            version = %composition.version,
            services = composition.services.len(),
            status = ?composition.status,
            "schema composition finished"
        );
        Ok(composition)
    }

    /// Cached active composition, falling back to the store and repopulating
    /// the cache on a miss.
    pub async fn active_composition(&self) -> Result<Composition, GatewayError> {
        if let Some(cached) = self.active_cache.read().await.clone() {
            return Ok(cached);
        }
        let active = self.compositions.active().await.ok_or_else(|| {
            GatewayError::new(ErrorCode::CompositionFailed, "no active composition available")
                .with_operation("get_active_composition")
        })?;
        *self.active_cache.write().await = Some(active.clone());
        Ok(active)
    }

    /// Ownership index from the most recent composition, for executors that
    /// route by type/field ownership.
    pub async fn federated_schema(&self) -> Option<FederatedSchema> {
        self.federated_cache.read().await.clone()
    }

    async fn next_version(&self) -> String {
        format!("v{}", self.compositions.count().await + 1)
    }

    /// Swaps both caches to complete new values; readers never observe a
    /// partial write.
    async fn refresh_caches(&self, contributing: &[(String, SchemaRecord)]) {
        let active = self.compositions.active().await;
        *self.active_cache.write().await = active;

        let mut federated = FederatedSchema::default();
        for (name, record) in contributing {
            let url = match self.registry.get(name).await {
                Some(descriptor) => descriptor.url,
                None => continue,
            };
            index_schema(&mut federated.type_to_service_map, name, &record.sdl);
            federated.services.insert(
                name.clone(),
                ServiceEndpoint {
                    url,
                    sdl: record.sdl.clone(),
                },
            );
        }
        *self.federated_cache.write().await = Some(federated);
    }
}

/// Records which service defines each type, `Type.field` and
/// `Type.field.arg` key.
fn index_schema(index: &mut HashMap<String, Vec<String>>, service: &str, sdl: &str) {
    let Ok(document) = parse_schema::<String>(sdl) else {
        return;
    };
    let mut push = |key: String, index: &mut HashMap<String, Vec<String>>| {
        index.entry(key).or_default().push(service.to_string());
    };
    for definition in &document.definitions {
        let Definition::TypeDefinition(typedef) = definition else {
            continue;
        };
        match typedef {
            TypeDefinition::Object(object) => {
                push(object.name.clone(), index);
                for field in &object.fields {
                    push(format!("{}.{}", object.name, field.name), index);
                    for arg in &field.arguments {
                        push(format!("{}.{}.{}", object.name, field.name, arg.name), index);
                    }
                }
            }
            TypeDefinition::Interface(interface) => push(interface.name.clone(), index),
            TypeDefinition::InputObject(input) => push(input.name.clone(), index),
            TypeDefinition::Enum(e) => push(e.name.clone(), index),
            TypeDefinition::Scalar(s) => push(s.name.clone(), index),
            TypeDefinition::Union(u) => push(u.name.clone(), index),
        }
    }
}
