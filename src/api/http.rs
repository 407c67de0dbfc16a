//! HTTP API Server
//!
//! REST API for cluster status, rule and property changes, process
//! management and migration job progress.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, put},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::cluster::{ClusterSummary, ComputeNodeInstance, ContextManager, ProcessCoordinator, ProcessInfo};
use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::pipeline::JobItemProgress;

/// Shared application state
pub struct AppState {
    /// This node's view of the cluster
    pub context: Arc<ContextManager>,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: ApiConfig, context: Arc<ContextManager>) -> Self {
        Self {
            config,
            state: Arc::new(AppState { context }),
        }
    }

    /// Get the state for sharing with other components
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Create the router
    pub fn create_router(state: Arc<AppState>, cors_enabled: bool) -> Router {
        let router = Router::new()
            // Status and info
            .route("/health", get(handle_health))
            .route("/cluster", get(handle_cluster_info))
            .route("/cluster/instances", get(handle_instances))
            .route("/cluster/instances/:instance_id", get(handle_instance_info))
            // Rules and properties
            .route("/rules", get(handle_rules))
            .route("/rules/:name", put(handle_alter_rule))
            .route("/props", get(handle_props).put(handle_alter_props))
            // Processes
            .route("/processes", get(handle_processes))
            .route("/processes/:process_id", delete(handle_kill_process))
            // Migration jobs
            .route("/jobs/:job_id/:item", get(handle_job_progress))
            .with_state(state)
            .layer(TraceLayer::new_for_http());

        if cors_enabled {
            router.layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            )
        } else {
            router
        }
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = Self::create_router(Arc::clone(&self.state), self.config.cors_enabled);

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app).await?;
        Ok(())
    }
}

// ============ Request/Response Types ============

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub instance_id: String,
    pub instance_type: String,
    pub processes: usize,
}

/// Cluster info response
#[derive(Debug, Serialize)]
pub struct ClusterInfoResponse {
    pub local_instance_id: String,
    pub summary: ClusterSummary,
    pub databases: Vec<String>,
}

/// Version written by an alter request
#[derive(Debug, Serialize, Deserialize)]
pub struct AlterResponse {
    pub version: u64,
}

/// Process list query
#[derive(Debug, Default, Deserialize)]
pub struct ProcessQuery {
    /// Collect from every online instance instead of this one
    #[serde(default)]
    pub cluster: bool,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Crate error rendered as an HTTP response
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            Error::InstanceNotFound(_) => (StatusCode::NOT_FOUND, "INSTANCE_NOT_FOUND"),
            Error::JobNotFound(_) => (StatusCode::NOT_FOUND, "JOB_NOT_FOUND"),
            Error::Config(_) | Error::Json(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            Error::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ============ Handlers ============

/// Handle health check
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let local = state.context.instances().local().await;
    Json(HealthResponse {
        healthy: true,
        instance_id: local.id().to_string(),
        instance_type: local.instance_type().to_string(),
        processes: state.context.processes().list().len(),
    })
}

/// Handle cluster info
async fn handle_cluster_info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let context = &state.context;
    Json(ClusterInfoResponse {
        local_instance_id: context.instances().local_id().await,
        summary: context.instances().summary().await,
        databases: context.metadata().database_names().await,
    })
}

/// List known compute nodes
async fn handle_instances(State(state): State<Arc<AppState>>) -> Json<Vec<ComputeNodeInstance>> {
    Json(state.context.instances().all().await)
}

/// Get a specific compute node
async fn handle_instance_info(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> ApiResult<Json<ComputeNodeInstance>> {
    state
        .context
        .instances()
        .get(&instance_id)
        .await
        .map(Json)
        .ok_or_else(|| Error::InstanceNotFound(instance_id).into())
}

async fn handle_rules(State(state): State<Arc<AppState>>) -> Json<BTreeMap<String, serde_json::Value>> {
    Json(state.context.global_rules().await)
}

/// Write a new global rule version; nodes pick it up from the repository watch
async fn handle_alter_rule(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(config): Json<serde_json::Value>,
) -> ApiResult<Json<AlterResponse>> {
    let version = state.context.persist().alter_global_rule(&name, &config).await?;
    tracing::info!("Global rule {} altered to version {}", name, version);
    Ok(Json(AlterResponse { version }))
}

async fn handle_props(State(state): State<Arc<AppState>>) -> Json<BTreeMap<String, String>> {
    Json(state.context.properties().await)
}

async fn handle_alter_props(
    State(state): State<Arc<AppState>>,
    Json(props): Json<BTreeMap<String, String>>,
) -> ApiResult<Json<AlterResponse>> {
    let version = state.context.persist().alter_properties(&props).await?;
    tracing::info!("Properties altered to version {}", version);
    Ok(Json(AlterResponse { version }))
}

/// List running processes, locally or across the cluster
async fn handle_processes(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProcessQuery>,
) -> ApiResult<Json<Vec<ProcessInfo>>> {
    if !query.cluster {
        return Ok(Json(state.context.processes().list()));
    }
    let processes = ProcessCoordinator::new(Arc::clone(&state.context))
        .get_process_list()
        .await?;
    Ok(Json(processes))
}

/// Kill a process wherever it runs
async fn handle_kill_process(
    State(state): State<Arc<AppState>>,
    Path(process_id): Path<String>,
) -> ApiResult<StatusCode> {
    ProcessCoordinator::new(Arc::clone(&state.context))
        .kill_process(&process_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Persisted progress of one migration job item
async fn handle_job_progress(
    State(state): State<Arc<AppState>>,
    Path((job_id, item)): Path<(String, usize)>,
) -> ApiResult<Json<JobItemProgress>> {
    JobItemProgress::load(state.context.repository().as_ref(), &job_id, item)
        .await?
        .map(Json)
        .ok_or_else(|| Error::JobNotFound(format!("{}/{}", job_id, item)).into())
}
