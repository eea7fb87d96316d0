use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use std::{fs, io};

use bytes::Bytes;
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use fedgate::complexity::ComplexityConfig;
use fedgate::error::{ErrorCode, GatewayError};
use fedgate::gateway::{HttpQueryExecutor, PlanSummaryExecutor, QueryExecutor};
use fedgate::schema_registry::RegisterSchemaRequest;
use fedgate::service_registry::ServiceRegistration;
use fedgate::store::{
    InMemoryChangeEventStore, InMemoryCompositionStore, InMemoryConfigStore, InMemoryMetricsStore,
};
use fedgate::{
    AnalyzeRequest, ComplexityAnalyzer, ComposeOptions, FederationGateway, GraphQLRequest,
    SchemaComposer, SchemaRegistry, ServiceRegistry,
};

#[derive(Parser, Debug)]
#[command(name = "fedgate", about = "Federated GraphQL gateway")]
struct Args {
    /// Gateway configuration file
    #[arg(long, default_value = "gateway.yaml")]
    config: PathBuf,

    /// Listen address, overrides the config file
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Health probe interval in seconds, overrides the config file
    #[arg(long)]
    health_interval: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct GatewayFileConfig {
    listen: Option<SocketAddr>,
    #[serde(default)]
    health: HealthConfig,
    #[serde(default)]
    execution: ExecutionConfig,
    #[serde(default)]
    complexity: Option<ComplexityConfig>,
    #[serde(default)]
    subgraphs: HashMap<String, SubgraphConfig>,
}

#[derive(Debug, Deserialize)]
struct HealthConfig {
    interval_secs: u64,
    probe_timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            interval_secs: 30,
            probe_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ExecutionConfig {
    /// When true, sub-queries are dispatched over HTTP; otherwise the
    /// gateway answers with a plan summary.
    #[serde(default)]
    dispatch: bool,
}

#[derive(Debug, Deserialize)]
struct SubgraphConfig {
    routing_url: String,
    health_url: Option<String>,
    schema: Option<SchemaFileConfig>,
}

#[derive(Debug, Deserialize)]
struct SchemaFileConfig {
    file: String,
}

struct AppState {
    gateway: FederationGateway,
    registry: ServiceRegistry,
    schemas: SchemaRegistry,
    composer: SchemaComposer,
}

// Create a response body from a string
fn full<T: Into<Bytes>>(value: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(value.into())
        .map_err(|never| match never {})
        .boxed()
}

const GRAPHIQL_HTML: &str = r#"
<!DOCTYPE html>
<html>
<head>
  <title>GraphiQL - Federated Gateway</title>
  <link href="https://unpkg.com/graphiql@1.5.0/graphiql.min.css" rel="stylesheet" />
  <style>
    body { margin: 0; padding: 0; height: 100vh; }
    #graphiql { height: 100vh; }
  </style>
</head>
<body>
  <div id="graphiql"></div>

  <script src="https://unpkg.com/react@17.0.2/umd/react.production.min.js"></script>
  <script src="https://unpkg.com/react-dom@17.0.2/umd/react-dom.production.min.js"></script>
  <script src="https://unpkg.com/graphiql@1.5.0/graphiql.min.js"></script>
  <script>
    const token = localStorage.getItem('auth_token') || '';

    function graphQLFetcher(graphQLParams) {
      return fetch('/graphql', {
        method: 'post',
        headers: {
          'Content-Type': 'application/json',
          'Authorization': token ? `Bearer ${token}` : '',
        },
        body: JSON.stringify(graphQLParams),
      }).then(response => response.json());
    }

    ReactDOM.render(
      React.createElement(GraphiQL, { fetcher: graphQLFetcher }),
      document.getElementById('graphiql')
    );
  </script>
</body>
</html>
"#;

fn error_status(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::SchemaValidation | ErrorCode::Configuration => StatusCode::BAD_REQUEST,
        ErrorCode::ServiceUnavailable | ErrorCode::DataIntegrity => StatusCode::NOT_FOUND,
        ErrorCode::CompositionFailed | ErrorCode::QueryPlanningFailed => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        ErrorCode::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::AuthenticationFailed => StatusCode::UNAUTHORIZED,
        ErrorCode::AuthorizationFailed => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn json_response(status: StatusCode, body: String) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(full(body))
        .unwrap_or_else(|_| internal_server_error())
}

fn ok_json<T: serde::Serialize>(value: &T) -> Response<BoxBody<Bytes, hyper::Error>> {
    json_response(
        StatusCode::OK,
        serde_json::to_string(value).unwrap_or_default(),
    )
}

fn gateway_error_response(e: &GatewayError) -> Response<BoxBody<Bytes, hyper::Error>> {
    e.log();
    let body = json!({ "error": e.message, "code": e.code.as_str() });
    json_response(error_status(e.code), body.to_string())
}

fn internal_server_error() -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .body(full("Internal Server Error"))
        .unwrap()
}

fn bad_request(message: String) -> Response<BoxBody<Bytes, hyper::Error>> {
    json_response(
        StatusCode::BAD_REQUEST,
        json!({ "error": message }).to_string(),
    )
}

// Extract authentication headers from the request
fn extract_auth_headers(req: &Request<Incoming>) -> Option<HashMap<String, String>> {
    let mut auth_headers = HashMap::new();

    if let Some(auth_header) = req.headers().get("Authorization") {
        if let Ok(auth_str) = auth_header.to_str() {
            auth_headers.insert("Authorization".to_string(), auth_str.to_string());
        }
    }

    for header_name in ["x-api-key", "x-token"].iter() {
        if let Some(header_value) = req.headers().get(*header_name) {
            if let Ok(value_str) = header_value.to_str() {
                auth_headers.insert(header_name.to_string(), value_str.to_string());
            }
        }
    }

    if auth_headers.is_empty() {
        None
    } else {
        Some(auth_headers)
    }
}

async fn read_body(req: Request<Incoming>) -> Result<Bytes, ()> {
    req.collect().await.map(|c| c.to_bytes()).map_err(|_| ())
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, std::convert::Infallible> {
    let auth_headers = extract_auth_headers(&req);
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query_string = req.uri().query().map(str::to_string);

    let result = match (&method, path.as_str()) {
        (&Method::POST, "/graphql") => {
            let Ok(body) = read_body(req).await else {
                return Ok(bad_request("failed to read request body".into()));
            };
            match serde_json::from_slice::<GraphQLRequest>(&body) {
                Ok(mut graphql_req) => {
                    graphql_req.auth_headers = auth_headers;
                    let response = state.gateway.execute_query(graphql_req).await;
                    ok_json(&response)
                }
                Err(e) => bad_request(format!("invalid JSON request: {e}")),
            }
        }

        (&Method::POST, "/services") => {
            let Ok(body) = read_body(req).await else {
                return Ok(bad_request("failed to read request body".into()));
            };
            match serde_json::from_slice::<ServiceRegistration>(&body) {
                Ok(registration) => match state.registry.register(registration).await {
                    Ok(response) => ok_json(&response),
                    Err(e) => gateway_error_response(&e),
                },
                Err(e) => bad_request(format!("invalid JSON request: {e}")),
            }
        }

        (&Method::GET, "/services") => ok_json(&state.registry.all_services().await),

        (&Method::GET, "/services/healthy") => ok_json(&state.registry.healthy_services().await),

        (&Method::DELETE, _) if path.starts_with("/services/") => {
            let name = path.trim_start_matches("/services/");
            match state.registry.deregister(name).await {
                Ok(()) => json_response(StatusCode::OK, json!({ "deregistered": name }).to_string()),
                Err(e) => gateway_error_response(&e),
            }
        }

        (&Method::POST, "/schemas") => {
            let Ok(body) = read_body(req).await else {
                return Ok(bad_request("failed to read request body".into()));
            };
            match serde_json::from_slice::<RegisterSchemaRequest>(&body) {
                Ok(request) => match state.schemas.register_schema(request).await {
                    Ok(response) => ok_json(&response),
                    Err(e) => gateway_error_response(&e),
                },
                Err(e) => bad_request(format!("invalid JSON request: {e}")),
            }
        }

        (&Method::GET, "/schemas/active") => ok_json(&state.schemas.get_active_schemas().await),

        (&Method::GET, _) if path.starts_with("/schemas/") => {
            // /schemas/{service}?version=latest
            let service = path.trim_start_matches("/schemas/");
            let version = query_string
                .as_deref()
                .and_then(|q| {
                    q.split('&')
                        .find_map(|pair| pair.strip_prefix("version=").map(str::to_string))
                })
                .unwrap_or_else(|| "latest".to_string());
            match state.schemas.get_schema(service, &version).await {
                Ok(record) => ok_json(&record),
                Err(e) => gateway_error_response(&e),
            }
        }

        (&Method::POST, "/compositions") => {
            let Ok(body) = read_body(req).await else {
                return Ok(bad_request("failed to read request body".into()));
            };
            let options = if body.is_empty() {
                ComposeOptions::default()
            } else {
                match serde_json::from_slice::<ComposeOptions>(&body) {
                    Ok(options) => options,
                    Err(e) => return Ok(bad_request(format!("invalid JSON request: {e}"))),
                }
            };
            match state.composer.compose(options).await {
                Ok(composition) => ok_json(&composition),
                Err(e) => gateway_error_response(&e),
            }
        }

        (&Method::GET, "/compositions/active") => {
            match state.gateway.active_composition().await {
                Ok(composition) => ok_json(&composition),
                Err(e) => gateway_error_response(&e),
            }
        }

        (&Method::POST, "/complexity") => {
            let Ok(body) = read_body(req).await else {
                return Ok(bad_request("failed to read request body".into()));
            };
            match serde_json::from_slice::<AnalyzeRequest>(&body) {
                Ok(request) => match state.gateway.analyzer().analyze(request).await {
                    Ok(report) => ok_json(&report),
                    Err(e) => gateway_error_response(&e),
                },
                Err(e) => bad_request(format!("invalid JSON request: {e}")),
            }
        }

        (&Method::GET, _) if path.starts_with("/stats/") => {
            let hash = path.trim_start_matches("/stats/");
            let hours = query_string
                .as_deref()
                .and_then(|q| {
                    q.split('&')
                        .find_map(|pair| pair.strip_prefix("hours="))
                        .and_then(|h| h.parse::<i64>().ok())
                })
                .unwrap_or(24);
            match state.gateway.analyzer().query_stats(hash, hours).await {
                Ok(stats) => ok_json(&stats),
                Err(e) => gateway_error_response(&e),
            }
        }

        (&Method::GET, "/health") => {
            let results = state.registry.perform_health_checks().await;
            ok_json(&json!({ "gateway": "ok", "services": results }))
        }

        (&Method::GET, "/graphiql") => Response::builder()
            .header("Content-Type", "text/html")
            .header("Access-Control-Allow-Origin", "*")
            .body(full(GRAPHIQL_HTML))
            .unwrap_or_else(|_| internal_server_error()),

        (&Method::GET, "/") => Response::builder()
            .status(StatusCode::FOUND)
            .header("Location", "/graphiql")
            .header("Access-Control-Allow-Origin", "*")
            .body(full(""))
            .unwrap_or_else(|_| internal_server_error()),

        (&Method::OPTIONS, _) => Response::builder()
            .header("Access-Control-Allow-Origin", "*")
            .header("Access-Control-Allow-Methods", "GET, POST, DELETE, OPTIONS")
            .header(
                "Access-Control-Allow-Headers",
                "Content-Type, Authorization",
            )
            .body(full(""))
            .unwrap_or_else(|_| internal_server_error()),

        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .header("Access-Control-Allow-Origin", "*")
            .body(full("Not Found"))
            .unwrap_or_else(|_| internal_server_error()),
    };

    Ok(result)
}

fn load_config(path: &Path) -> GatewayFileConfig {
    match fs::read_to_string(path) {
        Ok(contents) => match serde_yaml::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to parse config file, using defaults");
                GatewayFileConfig::default()
            }
        },
        Err(_) => {
            info!(path = %path.display(), "no config file found, using defaults");
            GatewayFileConfig::default()
        }
    }
}

/// Registers the subgraphs listed in the config file, loading schema files
/// relative to the config's directory.
async fn seed_subgraphs(state: &AppState, config: &GatewayFileConfig, config_dir: &Path) {
    for (name, subgraph) in &config.subgraphs {
        let registration = ServiceRegistration {
            name: name.clone(),
            url: subgraph.routing_url.clone(),
            health_check_url: subgraph.health_url.clone(),
            tags: Vec::new(),
            weight: 1,
            metadata: HashMap::new(),
        };
        if let Err(e) = state.registry.register(registration).await {
            error!(service = %name, error = %e, "failed to register configured subgraph");
            continue;
        }

        let Some(schema) = &subgraph.schema else {
            continue;
        };
        match read_schema_file(config_dir, &schema.file) {
            Ok(sdl) => {
                let request = RegisterSchemaRequest {
                    service_name: name.clone(),
                    service_version: "1.0.0".into(),
                    sdl,
                    url: subgraph.routing_url.clone(),
                    metadata: HashMap::new(),
                };
                if let Err(e) = state.schemas.register_schema(request).await {
                    error!(service = %name, error = %e, "failed to register configured schema");
                }
            }
            Err(e) => error!(service = %name, error = %e, "failed to read schema file"),
        }
    }
}

fn read_schema_file(base_dir: &Path, file_path: &str) -> io::Result<String> {
    fs::read_to_string(base_dir.join(file_path))
}

#[derive(Clone)]
// An Executor that uses the tokio runtime.
pub struct TokioExecutor;

impl<F> hyper::rt::Executor<F> for TokioExecutor
where
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn execute(&self, fut: F) {
        tokio::task::spawn(fut);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = load_config(&args.config);
    let config_dir = args
        .config
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    let listen = args
        .listen
        .or(config.listen)
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000)));
    let probe_timeout = Duration::from_secs(config.health.probe_timeout_secs);
    let health_interval =
        Duration::from_secs(args.health_interval.unwrap_or(config.health.interval_secs));

    let events = Arc::new(InMemoryChangeEventStore::new());
    let metrics = Arc::new(InMemoryMetricsStore::new());
    let registry = ServiceRegistry::new(events.clone(), probe_timeout);
    let schemas = SchemaRegistry::new(registry.clone(), events.clone());
    let composer = SchemaComposer::new(
        registry.clone(),
        schemas.clone(),
        Arc::new(InMemoryCompositionStore::new()),
        events.clone(),
    );
    let analyzer = ComplexityAnalyzer::new(
        schemas.clone(),
        metrics.clone(),
        config.complexity.clone().unwrap_or_default(),
    );
    let executor: Arc<dyn QueryExecutor> = if config.execution.dispatch {
        Arc::new(HttpQueryExecutor::new())
    } else {
        Arc::new(PlanSummaryExecutor)
    };
    let gateway = FederationGateway::new(
        registry.clone(),
        composer.clone(),
        analyzer,
        executor,
        metrics,
        Arc::new(InMemoryConfigStore::new()),
    );

    let state = Arc::new(AppState {
        gateway,
        registry: registry.clone(),
        schemas,
        composer,
    });

    seed_subgraphs(&state, &config, &config_dir).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let monitor = {
        let registry = registry.clone();
        tokio::spawn(async move {
            registry
                .run_health_monitoring(health_interval, shutdown_rx)
                .await;
        })
    };

    let listener = TcpListener::bind(listen).await?;
    info!(addr = %listen, "federated gateway listening");
    info!("GraphiQL UI available at http://{listen}/graphiql");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _addr) = accepted?;
                let io = TokioIo::new(stream);
                let state = Arc::clone(&state);
                let executor = TokioExecutor;

                tokio::task::spawn(async move {
                    let service = service_fn(move |req| {
                        let state = state.clone();
                        handle_request(req, state)
                    });

                    if let Err(e) = hyper_util::server::conn::auto::Builder::new(executor)
                        .serve_connection(io, service)
                        .await
                    {
                        error!(error = %e, "error processing connection");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                let _ = shutdown_tx.send(true);
                let _ = monitor.await;
                return Ok(());
            }
        }
    }
}
