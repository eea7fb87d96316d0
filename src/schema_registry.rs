use chrono::{DateTime, Utc};
use graphql_parser::parse_schema;
use graphql_parser::schema::{Definition, Type, TypeDefinition};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ErrorCode, GatewayError};
use crate::service_registry::ServiceRegistry;
use crate::store::{ChangeEvent, ChangeEventStore, ChangeType};

/// One schema submission for a (service, version) pair. Immutable once
/// stored, apart from the active flag.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchemaRecord {
    pub id: Uuid,
    pub service_name: String,
    pub service_version: String,
    pub sdl: String,
    pub hash: String,
    pub is_active: bool,
    pub is_valid: bool,
    pub validation_errors: Vec<String>,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterSchemaRequest {
    pub service_name: String,
    pub service_version: String,
    pub sdl: String,
    pub url: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterSchemaResponse {
    pub schema_id: Uuid,
    pub hash: String,
    pub is_valid: bool,
    pub validation_errors: Vec<String>,
    pub breaking_changes: Vec<String>,
}

/// Deterministic content hash over the trimmed SDL text.
pub fn schema_hash(sdl: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sdl.trim().as_bytes());
    hex::encode(hasher.finalize())
}

/// Stores schema text per (service, version) and detects breaking changes
/// between consecutive submissions. Liveness is the service registry's
/// concern; records here outlive deregistration.
#[derive(Clone)]
pub struct SchemaRegistry {
    records: Arc<RwLock<HashMap<String, Vec<SchemaRecord>>>>,
    services: ServiceRegistry,
    events: Arc<dyn ChangeEventStore>,
}

impl SchemaRegistry {
    pub fn new(services: ServiceRegistry, events: Arc<dyn ChangeEventStore>) -> Self {
        SchemaRegistry {
            records: Arc::new(RwLock::new(HashMap::new())),
            services,
            events,
        }
    }

    /// Registers a schema version. Resubmitting identical SDL for the same
    /// (service, version) returns the stored record untouched and emits
    /// nothing. A submission that fails to parse is still persisted, marked
    /// invalid, and still upserts the service descriptor.
    pub async fn register_schema(
        &self,
        request: RegisterSchemaRequest,
    ) -> Result<RegisterSchemaResponse, GatewayError> {
        if request.service_name.trim().is_empty() {
            return Err(GatewayError::new(
                ErrorCode::SchemaValidation,
                "service name is required",
            )
            .with_operation("register_schema"));
        }

        let hash = schema_hash(&request.sdl);

        {
            let records = self.records.read().await;
            if let Some(existing) = records.get(&request.service_name).and_then(|versions| {
                versions
                    .iter()
                    .rev()
                    .find(|r| r.service_version == request.service_version && r.hash == hash)
            }) {
                debug!(
                    service = %request.service_name,
                    version = %request.service_version,
                    "identical schema resubmitted, no-op"
                );
                return Ok(RegisterSchemaResponse {
                    schema_id: existing.id,
                    hash: existing.hash.clone(),
                    is_valid: existing.is_valid,
                    validation_errors: existing.validation_errors.clone(),
                    breaking_changes: Vec::new(),
                });
            }
        }

        let mut validation_errors = Vec::new();
        let mut metadata = request.metadata.clone();
        let is_valid = match parse_schema::<String>(&request.sdl) {
            Ok(document) => {
                // Informational only: a subgraph without federation
                // directives is still a valid schema.
                if !has_federation_directives(&document) {
                    metadata.insert(
                        "federation_check".into(),
                        "no @key or @entity directives found".into(),
                    );
                    debug!(service = %request.service_name, "schema has no federation directives");
                }
                true
            }
            Err(e) => {
                validation_errors.push(format!("failed to parse SDL: {e}"));
                false
            }
        };

        let previous = self.latest_record(&request.service_name).await;
        let breaking_changes = match &previous {
            Some(old) => detect_breaking_changes(&old.sdl, &request.sdl),
            None => Vec::new(),
        };

        let record = SchemaRecord {
            id: Uuid::new_v4(),
            service_name: request.service_name.clone(),
            service_version: request.service_version.clone(),
            sdl: request.sdl,
            hash: hash.clone(),
            is_active: is_valid,
            is_valid,
            validation_errors: validation_errors.clone(),
            metadata,
            created_at: Utc::now(),
        };
        let schema_id = record.id;

        {
            let mut records = self.records.write().await;
            let versions = records.entry(request.service_name.clone()).or_default();
            if record.is_active {
                for existing in versions.iter_mut() {
                    existing.is_active = false;
                }
            }
            versions.push(record);
        }

        // The descriptor is updated even for an invalid schema; routing
        // metadata and schema history are independent concerns.
        self.services
            .attach_schema(&request.service_name, &request.url, schema_id)
            .await;

        let mut event = ChangeEvent::new(&request.service_name, ChangeType::SchemaUpdated);
        event.old_schema_id = previous.as_ref().map(|r| r.id);
        event.new_schema_id = Some(schema_id);
        event.breaking_changes = breaking_changes.clone();
        event
            .details
            .insert("version".into(), request.service_version.clone());
        event.details.insert("valid".into(), is_valid.to_string());
        self.events.append(event).await;

        if breaking_changes.is_empty() {
            info!(service = %request.service_name, version = %request.service_version, "schema registered");
        } else {
            info!(
                service = %request.service_name,
                version = %request.service_version,
                breaking = breaking_changes.len(),
                "schema registered with breaking changes"
            );
        }

        Ok(RegisterSchemaResponse {
            schema_id,
            hash,
            is_valid,
            validation_errors,
            breaking_changes,
        })
    }

    /// Returns the requested version, or the most recent record of any
    /// validity when `version` is `"latest"`.
    pub async fn get_schema(
        &self,
        service: &str,
        version: &str,
    ) -> Result<SchemaRecord, GatewayError> {
        let records = self.records.read().await;
        let versions = records.get(service);
        let found = match version {
            "latest" => versions.and_then(|v| v.last()),
            exact => versions.and_then(|v| v.iter().rev().find(|r| r.service_version == exact)),
        };
        found.cloned().ok_or_else(|| {
            GatewayError::new(
                ErrorCode::ServiceUnavailable,
                format!("no schema registered for service '{service}' (version '{version}')"),
            )
            .with_service(service)
            .with_operation("get_schema")
        })
    }

    pub async fn get_active_schemas(&self) -> Vec<SchemaRecord> {
        self.records
            .read()
            .await
            .values()
            .flat_map(|versions| versions.iter().filter(|r| r.is_active).cloned())
            .collect()
    }

    /// Most recent record for a service that is both active and valid.
    pub async fn latest_active_valid(&self, service: &str) -> Option<SchemaRecord> {
        self.records
            .read()
            .await
            .get(service)
            .and_then(|versions| versions.iter().rev().find(|r| r.is_active && r.is_valid))
            .cloned()
    }

    async fn latest_record(&self, service: &str) -> Option<SchemaRecord> {
        self.records
            .read()
            .await
            .get(service)
            .and_then(|versions| versions.last())
            .cloned()
    }

    /// Drops the service's descriptor association. Historical schema records
    /// are kept for audit.
    pub async fn deregister_service(&self, service: &str) -> Result<(), GatewayError> {
        self.services.deregister(service).await
    }
}

fn has_federation_directives(document: &graphql_parser::schema::Document<'_, String>) -> bool {
    document.definitions.iter().any(|definition| {
        if let Definition::TypeDefinition(TypeDefinition::Object(object)) = definition {
            object
                .directives
                .iter()
                .any(|d| d.name == "key" || d.name == "entity")
        } else {
            false
        }
    })
}

/// Printed signature of a field type, e.g. `[User!]!`.
fn print_type(field_type: &Type<'_, String>) -> String {
    match field_type {
        Type::NamedType(name) => name.clone(),
        Type::ListType(inner) => format!("[{}]", print_type(inner)),
        Type::NonNullType(inner) => format!("{}!", print_type(inner)),
    }
}

/// Field tables per type name. Unparseable (including empty) SDL yields an
/// empty table so the differ can always run against it.
fn type_table(sdl: &str) -> BTreeMap<String, BTreeMap<String, String>> {
    let mut table = BTreeMap::new();
    let Ok(document) = parse_schema::<String>(sdl) else {
        return table;
    };
    for definition in &document.definitions {
        let Definition::TypeDefinition(typedef) = definition else {
            continue;
        };
        match typedef {
            TypeDefinition::Object(object) => {
                let fields = object
                    .fields
                    .iter()
                    .map(|f| (f.name.clone(), print_type(&f.field_type)))
                    .collect();
                table.insert(object.name.clone(), fields);
            }
            TypeDefinition::Interface(interface) => {
                let fields = interface
                    .fields
                    .iter()
                    .map(|f| (f.name.clone(), print_type(&f.field_type)))
                    .collect();
                table.insert(interface.name.clone(), fields);
            }
            TypeDefinition::InputObject(input) => {
                let fields = input
                    .fields
                    .iter()
                    .map(|f| (f.name.clone(), print_type(&f.value_type)))
                    .collect();
                table.insert(input.name.clone(), fields);
            }
            TypeDefinition::Enum(e) => {
                table.insert(e.name.clone(), BTreeMap::new());
            }
            TypeDefinition::Scalar(s) => {
                table.insert(s.name.clone(), BTreeMap::new());
            }
            TypeDefinition::Union(u) => {
                table.insert(u.name.clone(), BTreeMap::new());
            }
        }
    }
    table
}

/// Breaking changes between two SDL texts: removed types, removed fields,
/// and fields whose printed type signature changed.
pub fn detect_breaking_changes(old_sdl: &str, new_sdl: &str) -> Vec<String> {
    let old_types = type_table(old_sdl);
    let new_types = type_table(new_sdl);
    let mut changes = Vec::new();

    for (type_name, old_fields) in &old_types {
        let Some(new_fields) = new_types.get(type_name) else {
            changes.push(format!("Type '{type_name}' was removed"));
            continue;
        };
        for (field_name, old_type) in old_fields {
            match new_fields.get(field_name) {
                None => {
                    changes.push(format!("Field '{type_name}.{field_name}' was removed"));
                }
                Some(new_type) if new_type != old_type => {
                    changes.push(format!(
                        "Field '{type_name}.{field_name}' changed type from '{old_type}' to '{new_type}'"
                    ));
                }
                Some(_) => {}
            }
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryChangeEventStore;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn registry() -> (SchemaRegistry, Arc<InMemoryChangeEventStore>) {
        let events = Arc::new(InMemoryChangeEventStore::new());
        let services = ServiceRegistry::new(events.clone(), Duration::from_secs(5));
        (SchemaRegistry::new(services, events.clone()), events)
    }

    fn request(service: &str, version: &str, sdl: &str) -> RegisterSchemaRequest {
        RegisterSchemaRequest {
            service_name: service.into(),
            service_version: version.into(),
            sdl: sdl.into(),
            url: format!("http://{service}:4000"),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn hash_is_deterministic_and_whitespace_invariant() {
        let a = schema_hash("type Query { me: String }");
        let b = schema_hash("  type Query { me: String }\n\n");
        let c = schema_hash("type Query { me: String }");
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_ne!(a, schema_hash("type Query { you: String }"));
    }

    #[test]
    fn empty_sdl_hashes_without_panicking() {
        assert_eq!(schema_hash(""), schema_hash("   \n\t "));
    }

    #[tokio::test]
    async fn identical_resubmission_is_idempotent() {
        let (registry, events) = registry();
        let sdl = "type Query { users: [String] }";

        let first = registry
            .register_schema(request("users", "1.0.0", sdl))
            .await
            .unwrap();
        let second = registry
            .register_schema(request("users", "1.0.0", sdl))
            .await
            .unwrap();

        assert_eq!(first.schema_id, second.schema_id);
        assert_eq!(first.hash, second.hash);
        assert_eq!(
            events
                .all()
                .await
                .iter()
                .filter(|e| e.change_type == ChangeType::SchemaUpdated)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn invalid_sdl_is_stored_and_descriptor_still_created() {
        let (registry, _) = registry();
        let response = registry
            .register_schema(request("broken", "1.0.0", "type Query {{{"))
            .await
            .unwrap();

        assert!(!response.is_valid);
        assert_eq!(response.validation_errors.len(), 1);
        assert!(response.validation_errors[0].contains("failed to parse SDL"));

        let record = registry.get_schema("broken", "latest").await.unwrap();
        assert!(!record.is_valid);
        assert!(registry.services.get("broken").await.is_some());
    }

    #[tokio::test]
    async fn removed_field_reports_exactly_one_breaking_change() {
        let (registry, _) = registry();
        registry
            .register_schema(request("a", "1.0.0", "type A { id: ID, name: String }"))
            .await
            .unwrap();
        let response = registry
            .register_schema(request("a", "2.0.0", "type A { id: ID }"))
            .await
            .unwrap();

        assert_eq!(response.breaking_changes, vec!["Field 'A.name' was removed"]);
    }

    #[tokio::test]
    async fn identical_schemas_across_versions_report_no_breaking_changes() {
        let (registry, _) = registry();
        let sdl = "type A { id: ID, name: String }";
        registry
            .register_schema(request("a", "1.0.0", sdl))
            .await
            .unwrap();
        let response = registry
            .register_schema(request("a", "2.0.0", sdl))
            .await
            .unwrap();
        assert!(response.breaking_changes.is_empty());
    }

    #[test]
    fn breaking_change_detection_covers_types_fields_and_signatures() {
        let old = "type A { id: ID, n: Int } type B { x: String }";
        let new = "type A { id: ID, n: String }";
        let changes = detect_breaking_changes(old, new);
        assert_eq!(
            changes,
            vec![
                "Field 'A.n' changed type from 'Int' to 'String'",
                "Type 'B' was removed",
            ]
        );
    }

    #[test]
    fn differ_tolerates_empty_and_unparseable_sides() {
        assert!(detect_breaking_changes("", "type A { id: ID }").is_empty());
        assert_eq!(
            detect_breaking_changes("type A { id: ID }", "   "),
            vec!["Type 'A' was removed"]
        );
        assert!(detect_breaking_changes("not sdl at all", "also not sdl").is_empty());
    }

    #[tokio::test]
    async fn latest_resolves_most_recent_and_exact_versions_resolve_themselves() {
        let (registry, _) = registry();
        registry
            .register_schema(request("users", "1.0.0", "type Query { a: ID }"))
            .await
            .unwrap();
        registry
            .register_schema(request("users", "2.0.0", "type Query { a: ID, b: ID }"))
            .await
            .unwrap();

        let latest = registry.get_schema("users", "latest").await.unwrap();
        assert_eq!(latest.service_version, "2.0.0");
        let pinned = registry.get_schema("users", "1.0.0").await.unwrap();
        assert_eq!(pinned.service_version, "1.0.0");
        assert!(registry.get_schema("users", "9.9.9").await.is_err());
    }

    #[tokio::test]
    async fn newest_valid_schema_is_the_only_active_one() {
        let (registry, _) = registry();
        registry
            .register_schema(request("users", "1.0.0", "type Query { a: ID }"))
            .await
            .unwrap();
        registry
            .register_schema(request("users", "2.0.0", "type Query { b: ID }"))
            .await
            .unwrap();

        let active = registry.get_active_schemas().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].service_version, "2.0.0");
    }
}
