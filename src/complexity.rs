use chrono::{Duration as ChronoDuration, Utc};
use graphql_parser::parse_query;
use graphql_parser::query::{Definition, Document, OperationDefinition, Selection, SelectionSet};
use graphql_parser::schema::{Definition as SchemaDefinition, TypeDefinition};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use crate::error::{ErrorCode, GatewayError};
use crate::schema_registry::SchemaRegistry;
use crate::store::MetricsStore;

/// Multiplier applied below a field whose name looks list-valued. A name
/// heuristic stands in for real `[T]` detection from the schema; thresholds
/// elsewhere were tuned against this approximation.
const LIST_FIELD_MULTIPLIER: u64 = 10;

/// Admission-control policy. Process-wide defaults; a request may carry
/// overrides that are merged once into an effective config, which is then
/// treated as immutable input.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ComplexityConfig {
    pub max_depth: u32,
    pub max_complexity: u64,
    pub max_field_count: u32,
    #[serde(default)]
    pub field_costs: HashMap<String, u64>,
    #[serde(default)]
    pub type_costs: HashMap<String, u64>,
    pub allow_introspection: bool,
    #[serde(default)]
    pub custom_rules: Vec<String>,
}

impl Default for ComplexityConfig {
    fn default() -> Self {
        ComplexityConfig {
            max_depth: 15,
            max_complexity: 1000,
            max_field_count: 50,
            field_costs: HashMap::new(),
            type_costs: HashMap::new(),
            allow_introspection: true,
            custom_rules: Vec::new(),
        }
    }
}

/// Per-request overrides, merged over the process defaults.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ComplexityOverrides {
    pub max_depth: Option<u32>,
    pub max_complexity: Option<u64>,
    pub max_field_count: Option<u32>,
    #[serde(default)]
    pub field_costs: Option<HashMap<String, u64>>,
    #[serde(default)]
    pub type_costs: Option<HashMap<String, u64>>,
    pub allow_introspection: Option<bool>,
    #[serde(default)]
    pub custom_rules: Option<Vec<String>>,
}

impl ComplexityConfig {
    pub fn merged(&self, overrides: Option<&ComplexityOverrides>) -> ComplexityConfig {
        let Some(o) = overrides else {
            return self.clone();
        };
        let mut effective = self.clone();
        if let Some(v) = o.max_depth {
            effective.max_depth = v;
        }
        if let Some(v) = o.max_complexity {
            effective.max_complexity = v;
        }
        if let Some(v) = o.max_field_count {
            effective.max_field_count = v;
        }
        if let Some(costs) = &o.field_costs {
            effective.field_costs.extend(costs.clone());
        }
        if let Some(costs) = &o.type_costs {
            effective.type_costs.extend(costs.clone());
        }
        if let Some(v) = o.allow_introspection {
            effective.allow_introspection = v;
        }
        if let Some(rules) = &o.custom_rules {
            effective.custom_rules = rules.clone();
        }
        effective
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnalyzeRequest {
    pub query: String,
    #[serde(default)]
    pub variables: Option<Value>,
    #[serde(default)]
    pub operation_name: Option<String>,
    /// Explicit SDL takes priority over `service_name`.
    #[serde(default)]
    pub schema_sdl: Option<String>,
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default)]
    pub config: Option<ComplexityOverrides>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Violation {
    pub violation_type: String,
    pub current: u64,
    pub limit: u64,
    pub description: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ComplexityReport {
    pub depth: u32,
    pub complexity: u64,
    pub field_count: u32,
    pub is_valid: bool,
    pub violations: Vec<Violation>,
    pub suggestions: Vec<String>,
    pub estimated_cost: u64,
    pub cache_recommended: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryStats {
    pub query_hash: String,
    pub executions: usize,
    pub avg_complexity: f64,
    pub avg_duration_ms: f64,
    pub error_rate: f64,
}

/// Scores incoming queries for admission control. Pure given its inputs;
/// the only state it touches is the schema lookup and, for `query_stats`,
/// previously recorded metrics.
#[derive(Clone)]
pub struct ComplexityAnalyzer {
    schemas: SchemaRegistry,
    metrics: Arc<dyn MetricsStore>,
    defaults: ComplexityConfig,
}

impl ComplexityAnalyzer {
    pub fn new(
        schemas: SchemaRegistry,
        metrics: Arc<dyn MetricsStore>,
        defaults: ComplexityConfig,
    ) -> Self {
        ComplexityAnalyzer {
            schemas,
            metrics,
            defaults,
        }
    }

    pub async fn analyze(&self, request: AnalyzeRequest) -> Result<ComplexityReport, GatewayError> {
        let document = parse_query::<String>(&request.query).map_err(|e| {
            GatewayError::new(ErrorCode::SchemaValidation, format!("failed to parse query: {e}"))
                .with_operation("analyze_complexity")
        })?;

        let config = self.defaults.merged(request.config.as_ref());
        let schema_sdl = self.resolve_schema(&request).await;

        let mut depth: u32 = 0;
        let mut field_count: u32 = 0;
        let mut complexity: u64 = 0;
        let mut root_fields: Vec<String> = Vec::new();

        for operation in operations(&document, request.operation_name.as_deref()) {
            let set = operation_selection_set(operation);
            depth = depth.max(selection_depth(set, 1));
            field_count += count_fields(set);
            complexity += score_selections(set, 1, &config);
            collect_root_fields(set, &mut root_fields);
        }

        let mut violations = Vec::new();
        let mut suggestions = Vec::new();

        if depth > config.max_depth {
            violations.push(Violation {
                violation_type: "max_depth_exceeded".into(),
                current: depth as u64,
                limit: config.max_depth as u64,
                description: format!(
                    "query depth {} exceeds the maximum of {}",
                    depth, config.max_depth
                ),
            });
            suggestions.push("Flatten deeply nested selections or split the query".into());
        }
        if complexity > config.max_complexity {
            violations.push(Violation {
                violation_type: "max_complexity_exceeded".into(),
                current: complexity,
                limit: config.max_complexity,
                description: format!(
                    "complexity score {} exceeds the maximum of {}",
                    complexity, config.max_complexity
                ),
            });
            suggestions.push("Request fewer list fields or add pagination arguments".into());
        }
        if field_count > config.max_field_count {
            violations.push(Violation {
                violation_type: "max_field_count_exceeded".into(),
                current: field_count as u64,
                limit: config.max_field_count as u64,
                description: format!(
                    "field count {} exceeds the maximum of {}",
                    field_count, config.max_field_count
                ),
            });
            suggestions.push("Select only the fields the client actually renders".into());
        }

        if !config.allow_introspection {
            if let Some(name) = root_fields.iter().find(|f| f.starts_with("__")) {
                violations.push(Violation {
                    violation_type: "introspection_disabled".into(),
                    current: 1,
                    limit: 0,
                    description: format!("introspection field '{name}' is not allowed"),
                });
                suggestions.push("Remove introspection fields from the query".into());
            }
        }

        // Schema-aware validation only runs when a schema could be resolved.
        if let Some(sdl) = &schema_sdl {
            if let Some(known) = root_field_names(sdl) {
                for name in root_fields.iter().filter(|f| !f.starts_with("__")) {
                    if !known.contains(name.as_str()) {
                        violations.push(Violation {
                            violation_type: "unknown_root_field".into(),
                            current: 0,
                            limit: 0,
                            description: format!(
                                "field '{name}' is not defined on the schema's root types"
                            ),
                        });
                        suggestions.push(format!("Remove or correct the field '{name}'"));
                    }
                }
            }
        } else {
            debug!("no schema resolved, skipping schema-aware validation");
        }

        let estimated_cost = complexity
            + 10 * (depth.saturating_sub(5) as u64)
            + 2 * (field_count.saturating_sub(20) as u64);
        let cache_recommended = complexity > 100 || field_count > 10 || depth > 5;

        Ok(ComplexityReport {
            depth,
            complexity,
            field_count,
            is_valid: violations.is_empty(),
            violations,
            suggestions,
            estimated_cost,
            cache_recommended,
        })
    }

    async fn resolve_schema(&self, request: &AnalyzeRequest) -> Option<String> {
        if let Some(sdl) = &request.schema_sdl {
            return Some(sdl.clone());
        }
        if let Some(service) = &request.service_name {
            match self.schemas.get_schema(service, "latest").await {
                Ok(record) => return Some(record.sdl),
                Err(e) => debug!(service = %service, error = %e, "no schema for named service"),
            }
        }
        None
    }

    /// Mean complexity, duration and error rate of recorded executions for
    /// one query hash over the trailing window.
    pub async fn query_stats(&self, query_hash: &str, hours: i64) -> Result<QueryStats, GatewayError> {
        let since = Utc::now() - ChronoDuration::hours(hours);
        let metrics = self.metrics.for_hash(query_hash, since).await;
        if metrics.is_empty() {
            return Err(GatewayError::new(
                ErrorCode::DataIntegrity,
                format!("no metrics recorded for query hash '{query_hash}' in the last {hours}h"),
            )
            .with_operation("get_query_stats"));
        }

        let executions = metrics.len();
        let avg_complexity =
            metrics.iter().map(|m| m.complexity as f64).sum::<f64>() / executions as f64;
        let avg_duration_ms =
            metrics.iter().map(|m| m.duration_ms as f64).sum::<f64>() / executions as f64;
        let errored = metrics.iter().filter(|m| m.error_count > 0).count();
        Ok(QueryStats {
            query_hash: query_hash.to_string(),
            executions,
            avg_complexity,
            avg_duration_ms,
            error_rate: errored as f64 / executions as f64,
        })
    }
}

/// Depth and field count over every operation in a parsed query, for callers
/// that already hold the document.
pub(crate) fn document_shape(document: &Document<'_, String>) -> (u32, u32) {
    let mut depth = 0;
    let mut field_count = 0;
    for operation in operations(document, None) {
        let set = operation_selection_set(operation);
        depth = depth.max(selection_depth(set, 1));
        field_count += count_fields(set);
    }
    (depth, field_count)
}

fn operations<'a, 'd>(
    document: &'a Document<'d, String>,
    operation_name: Option<&str>,
) -> Vec<&'a OperationDefinition<'d, String>> {
    document
        .definitions
        .iter()
        .filter_map(|definition| match definition {
            Definition::Operation(op) => Some(op),
            Definition::Fragment(_) => None,
        })
        .filter(|op| match operation_name {
            None => true,
            Some(wanted) => operation_def_name(op) == Some(wanted),
        })
        .collect()
}

fn operation_def_name<'a>(op: &'a OperationDefinition<'_, String>) -> Option<&'a str> {
    match op {
        OperationDefinition::SelectionSet(_) => None,
        OperationDefinition::Query(q) => q.name.as_deref(),
        OperationDefinition::Mutation(m) => m.name.as_deref(),
        OperationDefinition::Subscription(s) => s.name.as_deref(),
    }
}

fn operation_selection_set<'a, 'd>(
    op: &'a OperationDefinition<'d, String>,
) -> &'a SelectionSet<'d, String> {
    match op {
        OperationDefinition::SelectionSet(set) => set,
        OperationDefinition::Query(q) => &q.selection_set,
        OperationDefinition::Mutation(m) => &m.selection_set,
        OperationDefinition::Subscription(s) => &s.selection_set,
    }
}

/// Maximum nesting level reached by the selection set. Inline fragments do
/// not add a level; an unresolved fragment spread conservatively counts as
/// one extra level in lieu of its true body depth.
fn selection_depth(set: &SelectionSet<'_, String>, level: u32) -> u32 {
    set.items
        .iter()
        .map(|selection| match selection {
            Selection::Field(field) => {
                if field.selection_set.items.is_empty() {
                    level
                } else {
                    selection_depth(&field.selection_set, level + 1)
                }
            }
            Selection::InlineFragment(fragment) => selection_depth(&fragment.selection_set, level),
            Selection::FragmentSpread(_) => level + 1,
        })
        .max()
        .unwrap_or(level)
}

/// Total field selections; each fragment spread occurrence counts as one.
fn count_fields(set: &SelectionSet<'_, String>) -> u32 {
    set.items
        .iter()
        .map(|selection| match selection {
            Selection::Field(field) => 1 + count_fields(&field.selection_set),
            Selection::InlineFragment(fragment) => count_fields(&fragment.selection_set),
            Selection::FragmentSpread(_) => 1,
        })
        .sum()
}

fn score_selections(set: &SelectionSet<'_, String>, multiplier: u64, config: &ComplexityConfig) -> u64 {
    set.items
        .iter()
        .map(|selection| match selection {
            Selection::Field(field) => {
                let mut total = field_cost(&field.name, config) * multiplier;
                if !field.selection_set.items.is_empty() {
                    let child_multiplier = if is_list_like(&field.name) {
                        multiplier * LIST_FIELD_MULTIPLIER
                    } else {
                        multiplier
                    };
                    total += score_selections(&field.selection_set, child_multiplier, config);
                }
                total
            }
            Selection::InlineFragment(fragment) => {
                score_selections(&fragment.selection_set, multiplier, config)
            }
            Selection::FragmentSpread(spread) => {
                field_cost(&spread.fragment_name, config) * multiplier
            }
        })
        .sum()
}

fn field_cost(name: &str, config: &ComplexityConfig) -> u64 {
    if let Some(cost) = config.field_costs.get(name) {
        return *cost;
    }
    if name.ends_with("Connection") {
        10
    } else if name.starts_with("search") {
        15
    } else if matches!(name, "id" | "createdAt" | "updatedAt") {
        1
    } else {
        2
    }
}

fn is_list_like(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower.contains("list") || lower.ends_with('s') || lower.contains("connection")
}

fn collect_root_fields(set: &SelectionSet<'_, String>, out: &mut Vec<String>) {
    for selection in &set.items {
        if let Selection::Field(field) = selection {
            out.push(field.name.clone());
        }
    }
}

/// Field names defined on the schema's `Query` and `Mutation` types, or
/// `None` when the SDL does not parse or defines neither root type.
fn root_field_names(sdl: &str) -> Option<HashSet<String>> {
    let document = graphql_parser::parse_schema::<String>(sdl).ok()?;
    let mut names = HashSet::new();
    let mut saw_root = false;
    for definition in &document.definitions {
        if let SchemaDefinition::TypeDefinition(TypeDefinition::Object(object)) = definition {
            if object.name == "Query" || object.name == "Mutation" {
                saw_root = true;
                names.extend(object.fields.iter().map(|f| f.name.clone()));
            }
        }
    }
    saw_root.then_some(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service_registry::ServiceRegistry;
    use crate::store::{InMemoryChangeEventStore, InMemoryMetricsStore, QueryMetrics};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn analyzer() -> ComplexityAnalyzer {
        let events = Arc::new(InMemoryChangeEventStore::new());
        let services = ServiceRegistry::new(events.clone(), Duration::from_secs(5));
        let schemas = SchemaRegistry::new(services, events);
        ComplexityAnalyzer::new(
            schemas,
            Arc::new(InMemoryMetricsStore::new()),
            ComplexityConfig::default(),
        )
    }

    fn request(query: &str) -> AnalyzeRequest {
        AnalyzeRequest {
            query: query.into(),
            variables: None,
            operation_name: None,
            schema_sdl: None,
            service_name: None,
            config: None,
        }
    }

    #[tokio::test]
    async fn unparseable_query_is_a_hard_error() {
        let err = analyzer().analyze(request("query {{{")).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::SchemaValidation);
        assert!(err.message.contains("failed to parse query"));
    }

    #[tokio::test]
    async fn schemaless_analysis_still_computes_metrics() {
        let report = analyzer()
            .analyze(request("query { user { id name } }"))
            .await
            .unwrap();
        assert_eq!(report.depth, 2);
        assert_eq!(report.field_count, 3);
        assert!(report.is_valid);
    }

    #[tokio::test]
    async fn adding_a_scalar_field_is_monotonic() {
        let a = analyzer()
            .analyze(request("query { user { id name } }"))
            .await
            .unwrap();
        let b = analyzer()
            .analyze(request("query { user { id name } version }"))
            .await
            .unwrap();
        assert!(b.complexity >= a.complexity);
        assert_eq!(b.field_count, a.field_count + 1);
    }

    #[tokio::test]
    async fn sixteen_levels_violates_default_depth_limit() {
        // n0 { n1 { ... n15 } } is 16 nested selection levels.
        let mut query = String::from("n15");
        for i in (0..15).rev() {
            query = format!("n{i} {{ {query} }}");
        }
        let query = format!("query {{ {query} }}");

        let report = analyzer().analyze(request(&query)).await.unwrap();
        assert_eq!(report.depth, 16);
        assert!(!report.is_valid);
        assert_eq!(report.violations.len(), 1);
        let violation = &report.violations[0];
        assert_eq!(violation.violation_type, "max_depth_exceeded");
        assert_eq!(violation.current, 16);
        assert_eq!(violation.limit, 15);
    }

    #[tokio::test]
    async fn inline_fragments_do_not_add_depth_but_spreads_do() {
        let inline = analyzer()
            .analyze(request("query { node { ... on User { id } } }"))
            .await
            .unwrap();
        assert_eq!(inline.depth, 2);

        let spread = analyzer()
            .analyze(request(
                "query { node { ...userFields } } fragment userFields on User { id }",
            ))
            .await
            .unwrap();
        // The spread is not expanded; it counts one conservative extra level
        // and one field.
        assert_eq!(spread.depth, 3);
        assert_eq!(spread.field_count, 2);
    }

    #[tokio::test]
    async fn list_like_parents_multiply_nested_cost() {
        let scalar_child = analyzer()
            .analyze(request("query { user { name } }"))
            .await
            .unwrap();
        // "users" ends in 's', so the nested selection is scored at x10.
        let list_child = analyzer()
            .analyze(request("query { users { name } }"))
            .await
            .unwrap();
        assert_eq!(scalar_child.complexity, 2 + 2);
        assert_eq!(list_child.complexity, 2 + 2 * 10);
    }

    #[tokio::test]
    async fn default_field_costs_follow_naming() {
        let report = analyzer()
            .analyze(request("query { usersConnection searchUsers id createdAt other }"))
            .await
            .unwrap();
        // 10 + 15 + 1 + 1 + 2
        assert_eq!(report.complexity, 29);
    }

    #[tokio::test]
    async fn per_field_cost_overrides_apply() {
        let mut req = request("query { expensive }");
        req.config = Some(ComplexityOverrides {
            field_costs: Some(HashMap::from([("expensive".to_string(), 500)])),
            ..Default::default()
        });
        let report = analyzer().analyze(req).await.unwrap();
        assert_eq!(report.complexity, 500);
    }

    #[tokio::test]
    async fn estimated_cost_adds_depth_and_field_penalties() {
        // depth 2, 22 fields: penalty = 0 depth + 2*2 fields.
        let fields: Vec<String> = (0..21).map(|i| format!("f{i}")).collect();
        let query = format!("query {{ user {{ {} }} }}", fields.join(" "));
        let report = analyzer().analyze(request(&query)).await.unwrap();
        assert_eq!(report.field_count, 22);
        assert_eq!(report.estimated_cost, report.complexity + 4);
    }

    #[tokio::test]
    async fn cache_recommended_thresholds() {
        let small = analyzer().analyze(request("query { id }")).await.unwrap();
        assert!(!small.cache_recommended);

        let wide_fields: Vec<String> = (0..12).map(|i| format!("f{i}")).collect();
        let wide = analyzer()
            .analyze(request(&format!("query {{ {} }}", wide_fields.join(" "))))
            .await
            .unwrap();
        assert!(wide.cache_recommended);
    }

    #[tokio::test]
    async fn introspection_can_be_disallowed() {
        let mut req = request("query { __schema { types { name } } }");
        req.config = Some(ComplexityOverrides {
            allow_introspection: Some(false),
            ..Default::default()
        });
        let report = analyzer().analyze(req).await.unwrap();
        assert!(!report.is_valid);
        assert!(
            report
                .violations
                .iter()
                .any(|v| v.violation_type == "introspection_disabled")
        );
    }

    #[tokio::test]
    async fn explicit_schema_flags_unknown_root_fields() {
        let mut req = request("query { nope }");
        req.schema_sdl = Some("type Query { users: [String] }".into());
        let report = analyzer().analyze(req).await.unwrap();
        assert!(!report.is_valid);
        assert!(
            report
                .violations
                .iter()
                .any(|v| v.violation_type == "unknown_root_field")
        );
    }

    #[tokio::test]
    async fn query_stats_aggregates_and_fails_on_missing_hash() {
        let events = Arc::new(InMemoryChangeEventStore::new());
        let services = ServiceRegistry::new(events.clone(), Duration::from_secs(5));
        let schemas = SchemaRegistry::new(services, events);
        let metrics = Arc::new(InMemoryMetricsStore::new());
        let analyzer =
            ComplexityAnalyzer::new(schemas, metrics.clone(), ComplexityConfig::default());

        for (complexity, errors) in [(10u64, 0u32), (30, 2)] {
            metrics
                .record(QueryMetrics {
                    query_hash: "abc".into(),
                    depth: 2,
                    complexity,
                    field_count: 4,
                    services: vec!["users".into()],
                    duration_ms: 20,
                    error_count: errors,
                    cache_hit: false,
                    created_at: Utc::now(),
                })
                .await;
        }

        let stats = analyzer.query_stats("abc", 24).await.unwrap();
        assert_eq!(stats.executions, 2);
        assert_eq!(stats.avg_complexity, 20.0);
        assert_eq!(stats.error_rate, 0.5);

        assert!(analyzer.query_stats("missing", 24).await.is_err());
    }
}
