//! # Discovery & Health HTTP Surface
//!
//! JSON endpoints over the discovery registry and the health registry.
//! Handlers translate between wire JSON and registry calls, nothing more.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use ember_common::{EmberError, HealthStatus, NodeId, NodeRecord, NodeType};

use crate::discovery::DiscoveryRegistry;
use crate::health::HealthRegistry;

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<DiscoveryRegistry>,
    pub health: Arc<HealthRegistry>,
}

/// Registration body for `POST /discovery/nodes`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub node_id: NodeId,
    pub host: String,
    pub port: u16,
    pub node_type: NodeType,
}

/// Body for `POST /discovery/nodes/{id}/health`.
#[derive(Debug, Deserialize)]
pub struct HealthRequest {
    pub healthy: bool,
}

/// Row of `GET /health/nodes`.
#[derive(Debug, Serialize)]
pub struct NodeHealthView {
    #[serde(rename = "nodeId")]
    pub node_id: NodeId,
    #[serde(rename = "nodeType")]
    pub node_type: NodeType,
    pub host: String,
    pub port: u16,
    pub status: HealthStatus,
    #[serde(rename = "lastCheck")]
    pub last_check_ms: u64,
    #[serde(rename = "responseTimeMs")]
    pub response_time_ms: u64,
    #[serde(rename = "errorMessage")]
    pub error_message: Option<String>,
}

struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(serde_json::json!({ "error": self.1 }))).into_response()
    }
}

impl From<EmberError> for ApiError {
    fn from(err: EmberError) -> Self {
        ApiError(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

fn not_found(id: &NodeId) -> ApiError {
    ApiError(StatusCode::NOT_FOUND, format!("unknown node {id}"))
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/discovery/ping", get(ping))
        .route("/discovery/nodes", post(register_node).get(list_nodes))
        .route("/discovery/nodes/:id", delete(deregister_node))
        .route("/discovery/nodes/type/:node_type/cache", get(list_healthy))
        .route("/discovery/nodes/:id/heartbeat", post(heartbeat))
        .route("/discovery/nodes/:id/health", post(set_health))
        .route("/health/nodes", get(health_nodes))
        .with_state(state)
}

/// Binds the router on an already-bound listener.
pub async fn serve(listener: tokio::net::TcpListener, state: ApiState) -> std::io::Result<()> {
    axum::serve(listener, router(state)).await
}

async fn ping() -> &'static str {
    "pong"
}

async fn register_node(
    State(state): State<ApiState>,
    Json(body): Json<RegisterRequest>,
) -> Result<Json<NodeRecord>, ApiError> {
    let record = state
        .registry
        .register(body.node_id, body.host, body.port, body.node_type)?;
    Ok(Json(record))
}

async fn deregister_node(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = NodeId::new(id);
    if state.registry.deregister(&id)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(&id))
    }
}

async fn list_nodes(State(state): State<ApiState>) -> Json<Vec<NodeRecord>> {
    Json(state.registry.list_all())
}

async fn list_healthy(
    State(state): State<ApiState>,
    Path(node_type): Path<String>,
) -> Result<Json<Vec<NodeRecord>>, ApiError> {
    let node_type = NodeType::parse(&node_type)
        .ok_or_else(|| ApiError(StatusCode::BAD_REQUEST, format!("bad node type {node_type}")))?;
    Ok(Json(state.registry.list_healthy(node_type)))
}

async fn heartbeat(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = NodeId::new(id);
    if state.registry.heartbeat(&id)? {
        Ok(StatusCode::OK)
    } else {
        Err(not_found(&id))
    }
}

async fn set_health(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<HealthRequest>,
) -> Result<StatusCode, ApiError> {
    let id = NodeId::new(id);
    if state.registry.set_health(&id, body.healthy)? {
        Ok(StatusCode::OK)
    } else {
        Err(not_found(&id))
    }
}

async fn health_nodes(State(state): State<ApiState>) -> Json<Vec<NodeHealthView>> {
    let mut rows: Vec<NodeHealthView> = state
        .registry
        .list_all()
        .into_iter()
        .map(|node| {
            let probe = state.health.result(&node.node_id).unwrap_or_default();
            NodeHealthView {
                node_id: node.node_id,
                node_type: node.node_type,
                host: node.host,
                port: node.port,
                status: probe.status,
                last_check_ms: probe.last_check_ms,
                response_time_ms: probe.response_time_ms,
                error_message: probe.error,
            }
        })
        .collect();
    rows.sort_by(|a, b| a.node_id.cmp(&b.node_id));
    Json(rows)
}
