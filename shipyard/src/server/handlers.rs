//! HTTP request handlers

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::warn;

use crate::deploy::bundle::Bundle;
use crate::errors::ShipyardError;
use crate::models::deployment::{
    DeployRequest, DeploymentList, ErrorBody, LogsQuery, LogsResponse, ZipDeployQuery,
};
use crate::server::state::ServerState;
use crate::utils::version_info;

impl IntoResponse for ShipyardError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            warn!("Request failed: {}", self);
        }
        let body = ErrorBody {
            error: self.code().to_string(),
            message: self.to_string(),
            logs: self.logs().map(str::to_string),
        };
        (status, Json(body)).into_response()
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub deployments: usize,
    pub uptime_secs: u64,
    pub tunnel_provider: String,
}

/// Health check handler
pub async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let status = if state.manager.is_shutting_down() {
        "shutting_down"
    } else {
        "healthy"
    };
    Json(HealthResponse {
        status: status.to_string(),
        service: "shipyard".to_string(),
        version: version_info().version,
        deployments: state.manager.registry().len(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        tunnel_provider: state.manager.tunnel_provider().to_string(),
    })
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    Json(version_info())
}

pub async fn deploy_handler(
    State(state): State<Arc<ServerState>>,
    request: Result<Json<DeployRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ShipyardError> {
    let Json(request) = request.map_err(|e| ShipyardError::BundleInvalid(e.body_text()))?;
    let mode = request.mode;
    let bundle = request.into_bundle()?;
    let deployed = state.manager.deploy(bundle, mode).await?;
    Ok((StatusCode::CREATED, Json(deployed)))
}

/// Deploy a raw ZIP upload
pub async fn deploy_zip_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<ZipDeployQuery>,
    body: Bytes,
) -> Result<impl IntoResponse, ShipyardError> {
    if body.is_empty() {
        return Err(ShipyardError::BundleInvalid("empty upload".to_string()));
    }
    let bundle = Bundle::from_zip(&body)?;
    let deployed = state.manager.deploy(bundle, query.mode).await?;
    Ok((StatusCode::CREATED, Json(deployed)))
}

pub async fn list_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(DeploymentList::from(state.manager.list()))
}

pub async fn status_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ShipyardError> {
    Ok(Json(state.manager.status(&id)?))
}

pub async fn undeploy_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ShipyardError> {
    Ok(Json(state.manager.undeploy(&id).await?))
}

pub async fn logs_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<impl IntoResponse, ShipyardError> {
    let logs = state.manager.logs(&id, query.tail).await?;
    Ok(Json(LogsResponse { id, logs }))
}
