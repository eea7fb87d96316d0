pub mod complexity;
pub mod composer;
pub mod error;
pub mod gateway;
pub mod schema_registry;
pub mod service_registry;
pub mod store;

pub use complexity::{AnalyzeRequest, ComplexityAnalyzer, ComplexityConfig, ComplexityReport};
pub use composer::{ComposeOptions, SchemaComposer};
pub use error::{ErrorCode, GatewayError, retry_delay};
pub use gateway::{FederationGateway, HttpQueryExecutor, PlanSummaryExecutor, QueryExecutor};
pub use schema_registry::{RegisterSchemaRequest, SchemaRegistry};
pub use service_registry::{ServiceRegistration, ServiceRegistry};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Serialize, Deserialize, Debug)]
pub struct GraphQLRequest {
    pub query: String,
    pub variables: Option<Value>,
    pub operation_name: Option<String>,
    #[serde(skip)]
    pub auth_headers: Option<HashMap<String, String>>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GraphQLResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<GraphQLError>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GraphQLError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}
