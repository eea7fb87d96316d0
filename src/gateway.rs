use async_trait::async_trait;
use futures::future::join_all;
use graphql_parser::parse_query;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::complexity::ComplexityAnalyzer;
use crate::composer::SchemaComposer;
use crate::error::{ErrorCode, GatewayError};
use crate::service_registry::ServiceRegistry;
use crate::store::{Composition, ConfigStore, MetricsStore, QueryMetrics};
use crate::{GraphQLError, GraphQLRequest, GraphQLResponse};

/// Per-plan wall-clock budget for all sub-query calls.
const EXECUTION_TIMEOUT: Duration = Duration::from_secs(30);
/// Flat planning estimate per contacted service.
const COST_PER_SERVICE: u64 = 10;

/// One sub-query dispatch to a backend. Every call carries the client query
/// verbatim; partitioning by field ownership is a known non-goal.
#[derive(Clone, Debug)]
pub struct ServiceCall {
    pub service: String,
    pub url: String,
    pub query: String,
    pub variables: Option<Value>,
    pub depends_on: HashMap<String, Vec<String>>,
}

#[derive(Clone, Debug)]
pub struct ExecutionPlan {
    pub query_id: Uuid,
    pub calls: Vec<ServiceCall>,
    pub estimated_cost: u64,
    pub timeout: Duration,
    pub depth: u32,
    pub field_count: u32,
}

#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, plan: &ExecutionPlan) -> Result<Value, GatewayError>;
}

/// Default executor: reports the services the plan would contact instead of
/// dispatching. A production deployment swaps in [`HttpQueryExecutor`],
/// which preserves the same response contract.
pub struct PlanSummaryExecutor;

#[async_trait]
impl QueryExecutor for PlanSummaryExecutor {
    async fn execute(&self, plan: &ExecutionPlan) -> Result<Value, GatewayError> {
        Ok(json!({
            "federation": {
                "services": plan.calls.len(),
                "queryId": plan.query_id.to_string(),
            }
        }))
    }
}

/// Dispatches every service call in parallel over HTTP and merges the
/// partial responses. Per-service failures become error entries tagged with
/// the service name; they never abort the other calls.
pub struct HttpQueryExecutor {
    client: reqwest::Client,
}

impl HttpQueryExecutor {
    pub fn new() -> Self {
        HttpQueryExecutor {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpQueryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueryExecutor for HttpQueryExecutor {
    async fn execute(&self, plan: &ExecutionPlan) -> Result<Value, GatewayError> {
        let futures = plan.calls.iter().map(|call| {
            let client = self.client.clone();
            let timeout = plan.timeout;
            async move {
                let body = json!({
                    "query": call.query,
                    "variables": call.variables.clone().unwrap_or_else(|| json!({})),
                });
                let result = client
                    .post(&call.url)
                    .header("Content-Type", "application/json")
                    .json(&body)
                    .timeout(timeout)
                    .send()
                    .await;
                match result {
                    Ok(response) => match response.json::<Value>().await {
                        Ok(value) => Ok((call.service.clone(), value)),
                        Err(e) => Err(GatewayError::new(
                            ErrorCode::Network,
                            format!("failed to parse response from '{}': {e}", call.service),
                        )
                        .with_service(&call.service)),
                    },
                    Err(e) if e.is_timeout() => Err(GatewayError::new(
                        ErrorCode::ExecutionTimeout,
                        format!("service '{}' timed out", call.service),
                    )
                    .with_service(&call.service)),
                    Err(e) => Err(GatewayError::new(
                        ErrorCode::ServiceUnavailable,
                        format!("failed to reach service '{}': {e}", call.service),
                    )
                    .with_service(&call.service)),
                }
            }
        });

        let mut data = serde_json::Map::new();
        let mut errors: Vec<Value> = Vec::new();

        for result in join_all(futures).await {
            match result {
                Ok((service, response)) => {
                    if let Some(Value::Object(fields)) = response.get("data") {
                        for (key, value) in fields {
                            data.insert(key.clone(), value.clone());
                        }
                    }
                    if let Some(Value::Array(service_errors)) = response.get("errors") {
                        for err in service_errors {
                            let mut tagged = err.clone();
                            if let Value::Object(obj) = &mut tagged {
                                obj.insert("service".into(), Value::String(service.clone()));
                            }
                            errors.push(tagged);
                        }
                    }
                }
                Err(e) => {
                    e.log();
                    errors.push(json!({
                        "message": e.message,
                        "extensions": {
                            "code": e.code.as_str(),
                            "service": e.service,
                        }
                    }));
                }
            }
        }

        let mut merged = json!({ "data": Value::Object(data) });
        if !errors.is_empty() {
            merged["errors"] = Value::Array(errors);
        }
        Ok(merged)
    }
}

/// Orchestrates registry, composer and analyzer to answer client GraphQL
/// requests. Owns the gateway-config cache; all shared caches sit behind
/// `RwLock` so readers only ever see complete values.
pub struct FederationGateway {
    registry: ServiceRegistry,
    composer: SchemaComposer,
    analyzer: ComplexityAnalyzer,
    executor: Arc<dyn QueryExecutor>,
    metrics: Arc<dyn MetricsStore>,
    configs: Arc<dyn ConfigStore>,
    config_cache: Arc<RwLock<HashMap<String, Value>>>,
}

impl FederationGateway {
    pub fn new(
        registry: ServiceRegistry,
        composer: SchemaComposer,
        analyzer: ComplexityAnalyzer,
        executor: Arc<dyn QueryExecutor>,
        metrics: Arc<dyn MetricsStore>,
        configs: Arc<dyn ConfigStore>,
    ) -> Self {
        FederationGateway {
            registry,
            composer,
            analyzer,
            executor,
            metrics,
            configs,
            config_cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn analyzer(&self) -> &ComplexityAnalyzer {
        &self.analyzer
    }

    /// Answers a client request. Never returns an error to the transport
    /// layer; every failure is encoded as a GraphQL error with a
    /// machine-readable `extensions.code`.
    pub async fn execute_query(&self, request: GraphQLRequest) -> GraphQLResponse {
        let query_id = Uuid::new_v4();
        let started = Instant::now();
        let hash = query_hash(&request.query);

        let plan = match self.build_plan(&request, query_id).await {
            Ok(plan) => plan,
            Err(e) => {
                e.log();
                self.record_metrics(&hash, Vec::new(), 0, 0, 0, started, 1);
                return error_response(e.message, "EXECUTION_PLAN_ERROR", query_id);
            }
        };

        debug!(
            query_id = %query_id,
            services = plan.calls.len(),
            estimated_cost = plan.estimated_cost,
            "execution plan built"
        );

        let services: Vec<String> = plan.calls.iter().map(|c| c.service.clone()).collect();
        let estimated_cost = plan.estimated_cost;
        match self.executor.execute(&plan).await {
            Ok(value) => {
                let response = into_response(value, query_id);
                let error_count = response.errors.as_ref().map_or(0, |e| e.len() as u32);
                self.record_metrics(
                    &hash,
                    services,
                    estimated_cost,
                    plan.depth,
                    plan.field_count,
                    started,
                    error_count,
                );
                response
            }
            Err(e) => {
                error!(query_id = %query_id, error = %e, "query execution failed");
                self.record_metrics(
                    &hash,
                    services,
                    estimated_cost,
                    plan.depth,
                    plan.field_count,
                    started,
                    1,
                );
                error_response(e.message, "EXECUTION_ERROR", query_id)
            }
        }
    }

    /// Broadcast plan: one call per healthy service, each carrying the
    /// client query and variables verbatim.
    pub async fn build_plan(
        &self,
        request: &GraphQLRequest,
        query_id: Uuid,
    ) -> Result<ExecutionPlan, GatewayError> {
        let document = parse_query::<String>(&request.query).map_err(|e| {
            GatewayError::new(
                ErrorCode::QueryPlanningFailed,
                format!("failed to parse query: {e}"),
            )
            .with_operation("build_plan")
        })?;
        let (depth, field_count) = crate::complexity::document_shape(&document);

        let healthy = self.registry.healthy_services().await;
        let calls = healthy
            .iter()
            .map(|service| ServiceCall {
                service: service.name.clone(),
                url: service.url.clone(),
                query: request.query.clone(),
                variables: request.variables.clone(),
                depends_on: HashMap::new(),
            })
            .collect::<Vec<_>>();

        Ok(ExecutionPlan {
            query_id,
            estimated_cost: COST_PER_SERVICE * calls.len() as u64,
            timeout: EXECUTION_TIMEOUT,
            depth,
            field_count,
            calls,
        })
    }

    /// Metrics land off the response path; a stalled store can never fail or
    /// slow a request.
    #[allow(clippy::too_many_arguments)]
    fn record_metrics(
        &self,
        query_hash: &str,
        services: Vec<String>,
        complexity: u64,
        depth: u32,
        field_count: u32,
        started: Instant,
        error_count: u32,
    ) {
        let metrics = self.metrics.clone();
        let record = QueryMetrics {
            query_hash: query_hash.to_string(),
            depth,
            complexity,
            field_count,
            services,
            duration_ms: started.elapsed().as_millis() as u64,
            error_count,
            cache_hit: false,
            created_at: chrono::Utc::now(),
        };
        tokio::spawn(async move {
            metrics.record(record).await;
        });
    }

    pub async fn active_composition(&self) -> Result<Composition, GatewayError> {
        self.composer.active_composition().await
    }

    /// Upserts a named gateway configuration and refreshes its cache entry.
    pub async fn update_gateway_config(&self, name: &str, value: Value) {
        self.configs.put(name, value.clone()).await;
        self.config_cache
            .write()
            .await
            .insert(name.to_string(), value);
        info!(config = %name, "gateway configuration updated");
    }

    /// Cached lookup with store fallback, mirroring the composition cache.
    pub async fn gateway_config(&self, name: &str) -> Option<Value> {
        if let Some(cached) = self.config_cache.read().await.get(name).cloned() {
            return Some(cached);
        }
        let value = self.configs.get(name).await?;
        self.config_cache
            .write()
            .await
            .insert(name.to_string(), value.clone());
        Some(value)
    }
}

/// Deterministic content hash over the trimmed query text, used as the
/// metrics aggregation key.
pub fn query_hash(query: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.trim().as_bytes());
    hex::encode(hasher.finalize())
}

/// Normalizes an executor result into the response shape. Executors may
/// return either a bare data object or a full `{data, errors}` envelope.
fn into_response(value: Value, query_id: Uuid) -> GraphQLResponse {
    let extensions = Some(json!({ "queryId": query_id.to_string() }));
    if value.get("data").is_some() || value.get("errors").is_some() {
        let errors = value.get("errors").and_then(|e| e.as_array()).map(|list| {
            list.iter()
                .map(|err| GraphQLError {
                    message: err
                        .get("message")
                        .and_then(|m| m.as_str())
                        .unwrap_or("unknown error")
                        .to_string(),
                    extensions: err.get("extensions").cloned(),
                })
                .collect()
        });
        GraphQLResponse {
            data: value.get("data").cloned(),
            errors,
            extensions,
        }
    } else {
        GraphQLResponse {
            data: Some(value),
            errors: None,
            extensions,
        }
    }
}

fn error_response(message: String, code: &str, query_id: Uuid) -> GraphQLResponse {
    GraphQLResponse {
        data: None,
        errors: Some(vec![GraphQLError {
            message,
            extensions: Some(json!({ "code": code })),
        }]),
        extensions: Some(json!({ "queryId": query_id.to_string() })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::complexity::ComplexityConfig;
    use crate::schema_registry::SchemaRegistry;
    use crate::service_registry::ServiceRegistration;
    use crate::store::{
        InMemoryChangeEventStore, InMemoryCompositionStore, InMemoryConfigStore,
        InMemoryMetricsStore,
    };
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Fixture {
        gateway: FederationGateway,
        registry: ServiceRegistry,
        metrics: Arc<InMemoryMetricsStore>,
        server: MockServer,
    }

    async fn fixture_with(executor: Arc<dyn QueryExecutor>) -> Fixture {
        let events = Arc::new(InMemoryChangeEventStore::new());
        let registry = ServiceRegistry::new(events.clone(), Duration::from_secs(2));
        let schemas = SchemaRegistry::new(registry.clone(), events.clone());
        let composer = SchemaComposer::new(
            registry.clone(),
            schemas.clone(),
            Arc::new(InMemoryCompositionStore::new()),
            events.clone(),
        );
        let metrics = Arc::new(InMemoryMetricsStore::new());
        let analyzer =
            ComplexityAnalyzer::new(schemas, metrics.clone(), ComplexityConfig::default());
        let gateway = FederationGateway::new(
            registry.clone(),
            composer,
            analyzer,
            executor,
            metrics.clone(),
            Arc::new(InMemoryConfigStore::new()),
        );
        let server = MockServer::start().await;
        Fixture {
            gateway,
            registry,
            metrics,
            server,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(Arc::new(PlanSummaryExecutor)).await
    }

    impl Fixture {
        async fn add_healthy_service(&self, name: &str) {
            Mock::given(method("GET"))
                .and(path(format!("/{name}/health")))
                .respond_with(ResponseTemplate::new(200))
                .mount(&self.server)
                .await;
            self.registry
                .register(ServiceRegistration {
                    name: name.into(),
                    url: format!("{}/{name}", self.server.uri()),
                    health_check_url: None,
                    tags: Vec::new(),
                    weight: 1,
                    metadata: HashMap::new(),
                })
                .await
                .unwrap();
        }
    }

    fn graphql_request(query: &str) -> GraphQLRequest {
        GraphQLRequest {
            query: query.into(),
            variables: None,
            operation_name: None,
            auth_headers: None,
        }
    }

    #[tokio::test]
    async fn zero_services_reports_zero_without_transport_error() {
        let f = fixture().await;
        let response = f.gateway.execute_query(graphql_request("query { anything }")).await;
        assert!(response.errors.is_none());
        assert_eq!(response.data.unwrap()["federation"]["services"], 0);
    }

    #[tokio::test]
    async fn plan_broadcasts_verbatim_query_to_each_healthy_service() {
        let f = fixture().await;
        f.add_healthy_service("users").await;
        f.add_healthy_service("orders").await;
        f.registry.perform_health_checks().await;

        let request = graphql_request("query { users { id } }");
        let plan = f
            .gateway
            .build_plan(&request, Uuid::new_v4())
            .await
            .unwrap();

        assert_eq!(plan.calls.len(), 2);
        assert_eq!(plan.estimated_cost, 20);
        assert_eq!(plan.timeout, Duration::from_secs(30));
        for call in &plan.calls {
            assert_eq!(call.query, "query { users { id } }");
            assert!(call.depends_on.is_empty());
        }
    }

    #[tokio::test]
    async fn malformed_query_yields_plan_error_response() {
        let f = fixture().await;
        let response = f.gateway.execute_query(graphql_request("query {{{")).await;
        assert!(response.data.is_none());
        let errors = response.errors.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].extensions.as_ref().unwrap()["code"], "EXECUTION_PLAN_ERROR");
    }

    struct FailingExecutor;

    #[async_trait]
    impl QueryExecutor for FailingExecutor {
        async fn execute(&self, _plan: &ExecutionPlan) -> Result<Value, GatewayError> {
            Err(GatewayError::new(ErrorCode::Internal, "executor blew up"))
        }
    }

    #[tokio::test]
    async fn executor_failure_yields_execution_error_response() {
        let f = fixture_with(Arc::new(FailingExecutor)).await;
        let response = f.gateway.execute_query(graphql_request("query { a }")).await;
        let errors = response.errors.unwrap();
        assert_eq!(errors[0].extensions.as_ref().unwrap()["code"], "EXECUTION_ERROR");
    }

    #[tokio::test]
    async fn metrics_are_recorded_off_the_response_path() {
        let f = fixture().await;
        let query = "query { anything }";
        f.gateway.execute_query(graphql_request(query)).await;

        let hash = query_hash(query);
        let since = chrono::Utc::now() - chrono::Duration::hours(1);
        let mut recorded = Vec::new();
        for _ in 0..50 {
            recorded = f.metrics.for_hash(&hash, since).await;
            if !recorded.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(recorded.len(), 1);
        assert!(!recorded[0].cache_hit);
    }

    #[tokio::test]
    async fn http_executor_merges_data_and_tags_errors_by_service() {
        let f = fixture().await;
        Mock::given(method("POST"))
            .and(path("/users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "users": [{"id": "1"}] }
            })))
            .mount(&f.server)
            .await;
        Mock::given(method("POST"))
            .and(path("/orders"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "orders": [] },
                "errors": [{"message": "partial failure"}]
            })))
            .mount(&f.server)
            .await;

        let plan = ExecutionPlan {
            query_id: Uuid::new_v4(),
            calls: vec![
                ServiceCall {
                    service: "users".into(),
                    url: format!("{}/users", f.server.uri()),
                    query: "query { users { id } }".into(),
                    variables: None,
                    depends_on: HashMap::new(),
                },
                ServiceCall {
                    service: "orders".into(),
                    url: format!("{}/orders", f.server.uri()),
                    query: "query { orders { id } }".into(),
                    variables: None,
                    depends_on: HashMap::new(),
                },
            ],
            estimated_cost: 20,
            timeout: Duration::from_secs(30),
            depth: 2,
            field_count: 2,
        };

        let merged = HttpQueryExecutor::new().execute(&plan).await.unwrap();
        assert_eq!(merged["data"]["users"][0]["id"], "1");
        assert_eq!(merged["data"]["orders"], json!([]));
        assert_eq!(merged["errors"][0]["service"], "orders");
    }

    #[tokio::test]
    async fn unreachable_backend_becomes_tagged_error_entry() {
        let plan = ExecutionPlan {
            query_id: Uuid::new_v4(),
            calls: vec![ServiceCall {
                service: "gone".into(),
                url: "http://127.0.0.1:1/graphql".into(),
                query: "query { a }".into(),
                variables: None,
                depends_on: HashMap::new(),
            }],
            estimated_cost: 10,
            timeout: Duration::from_secs(1),
            depth: 1,
            field_count: 1,
        };
        let merged = HttpQueryExecutor::new().execute(&plan).await.unwrap();
        assert_eq!(merged["errors"][0]["extensions"]["code"], "SERVICE_UNAVAILABLE");
    }

    #[tokio::test]
    async fn config_updates_refresh_the_cache() {
        let f = fixture().await;
        f.gateway
            .update_gateway_config("limits", json!({ "max_depth": 10 }))
            .await;
        let value = f.gateway.gateway_config("limits").await.unwrap();
        assert_eq!(value["max_depth"], 10);
        assert!(f.gateway.gateway_config("missing").await.is_none());
    }
}
