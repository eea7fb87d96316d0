use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// What kind of change an audit event records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    ServiceRegistered,
    ServiceDeregistered,
    SchemaUpdated,
    Composition,
}

/// Append-only audit record. Never mutated or deleted by normal operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub id: Uuid,
    pub service_name: String,
    pub change_type: ChangeType,
    pub old_schema_id: Option<Uuid>,
    pub new_schema_id: Option<Uuid>,
    pub breaking_changes: Vec<String>,
    pub details: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(service_name: impl Into<String>, change_type: ChangeType) -> Self {
        ChangeEvent {
            id: Uuid::new_v4(),
            service_name: service_name.into(),
            change_type,
            old_schema_id: None,
            new_schema_id: None,
            breaking_changes: Vec::new(),
            details: HashMap::new(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompositionStatus {
    Active,
    Inactive,
    Invalid,
    Failed,
}

/// A point-in-time federated schema. Only one composition is active at a
/// time; superseded ones are kept for audit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Composition {
    pub id: Uuid,
    pub services: Vec<String>,
    pub composed_sdl: String,
    pub status: CompositionStatus,
    pub validation_errors: Vec<String>,
    pub warnings: Vec<String>,
    pub version: String,
    pub created_at: DateTime<Utc>,
}

/// One record per executed query, consumed by aggregate statistics.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryMetrics {
    pub query_hash: String,
    pub depth: u32,
    pub complexity: u64,
    pub field_count: u32,
    pub services: Vec<String>,
    pub duration_ms: u64,
    pub error_count: u32,
    pub cache_hit: bool,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait ChangeEventStore: Send + Sync {
    async fn append(&self, event: ChangeEvent);
    async fn for_service(&self, service: &str) -> Vec<ChangeEvent>;
    async fn all(&self) -> Vec<ChangeEvent>;
}

#[async_trait]
pub trait CompositionStore: Send + Sync {
    /// Stores a composition. An `Active` insert demotes any previously
    /// active composition to `Inactive`; nothing is deleted.
    async fn insert(&self, composition: Composition);
    async fn active(&self) -> Option<Composition>;
    async fn count(&self) -> usize;
}

#[async_trait]
pub trait MetricsStore: Send + Sync {
    async fn record(&self, metrics: QueryMetrics);
    async fn for_hash(&self, query_hash: &str, since: DateTime<Utc>) -> Vec<QueryMetrics>;
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn put(&self, name: &str, value: Value);
    async fn get(&self, name: &str) -> Option<Value>;
}

#[derive(Default)]
pub struct InMemoryChangeEventStore {
    events: Arc<RwLock<Vec<ChangeEvent>>>,
}

impl InMemoryChangeEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChangeEventStore for InMemoryChangeEventStore {
    async fn append(&self, event: ChangeEvent) {
        self.events.write().await.push(event);
    }

    async fn for_service(&self, service: &str) -> Vec<ChangeEvent> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.service_name == service)
            .cloned()
            .collect()
    }

    async fn all(&self) -> Vec<ChangeEvent> {
        self.events.read().await.clone()
    }
}

#[derive(Default)]
pub struct InMemoryCompositionStore {
    compositions: Arc<RwLock<Vec<Composition>>>,
}

impl InMemoryCompositionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CompositionStore for InMemoryCompositionStore {
    async fn insert(&self, composition: Composition) {
        let mut compositions = self.compositions.write().await;
        if composition.status == CompositionStatus::Active {
            for existing in compositions.iter_mut() {
                if existing.status == CompositionStatus::Active {
                    existing.status = CompositionStatus::Inactive;
                }
            }
        }
        compositions.push(composition);
    }

    async fn active(&self) -> Option<Composition> {
        self.compositions
            .read()
            .await
            .iter()
            .rev()
            .find(|c| c.status == CompositionStatus::Active)
            .cloned()
    }

    async fn count(&self) -> usize {
        self.compositions.read().await.len()
    }
}

#[derive(Default)]
pub struct InMemoryMetricsStore {
    metrics: Arc<RwLock<Vec<QueryMetrics>>>,
}

impl InMemoryMetricsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetricsStore for InMemoryMetricsStore {
    async fn record(&self, metrics: QueryMetrics) {
        self.metrics.write().await.push(metrics);
    }

    async fn for_hash(&self, query_hash: &str, since: DateTime<Utc>) -> Vec<QueryMetrics> {
        self.metrics
            .read()
            .await
            .iter()
            .filter(|m| m.query_hash == query_hash && m.created_at >= since)
            .cloned()
            .collect()
    }
}

#[derive(Default)]
pub struct InMemoryConfigStore {
    configs: Arc<RwLock<HashMap<String, Value>>>,
}

impl InMemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigStore for InMemoryConfigStore {
    async fn put(&self, name: &str, value: Value) {
        self.configs.write().await.insert(name.to_string(), value);
    }

    async fn get(&self, name: &str) -> Option<Value> {
        self.configs.read().await.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn composition(status: CompositionStatus, version: &str) -> Composition {
        Composition {
            id: Uuid::new_v4(),
            services: vec!["users".into()],
            composed_sdl: "type Query { me: String }".into(),
            status,
            validation_errors: Vec::new(),
            warnings: Vec::new(),
            version: version.into(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn active_insert_demotes_previous_active() {
        let store = InMemoryCompositionStore::new();
        store.insert(composition(CompositionStatus::Active, "v1")).await;
        store.insert(composition(CompositionStatus::Active, "v2")).await;

        let active = store.active().await.unwrap();
        assert_eq!(active.version, "v2");
        assert_eq!(store.count().await, 2);
    }

    #[tokio::test]
    async fn events_filter_by_service() {
        let store = InMemoryChangeEventStore::new();
        store
            .append(ChangeEvent::new("users", ChangeType::ServiceRegistered))
            .await;
        store
            .append(ChangeEvent::new("orders", ChangeType::ServiceRegistered))
            .await;

        assert_eq!(store.for_service("users").await.len(), 1);
        assert_eq!(store.all().await.len(), 2);
    }

    #[tokio::test]
    async fn metrics_filter_by_hash_and_window() {
        let store = InMemoryMetricsStore::new();
        let old = QueryMetrics {
            query_hash: "abc".into(),
            depth: 2,
            complexity: 10,
            field_count: 3,
            services: vec!["users".into()],
            duration_ms: 12,
            error_count: 0,
            cache_hit: false,
            created_at: Utc::now() - chrono::Duration::hours(48),
        };
        let recent = QueryMetrics {
            created_at: Utc::now(),
            ..old.clone()
        };
        store.record(old).await;
        store.record(recent).await;

        let since = Utc::now() - chrono::Duration::hours(24);
        assert_eq!(store.for_hash("abc", since).await.len(), 1);
    }
}
