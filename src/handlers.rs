use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::coordinator::{FleetCoordinator, QrInfo};
use crate::error::FleetError;
use crate::registry::InstanceRecord;
use crate::session_store::SessionRowMeta;

pub fn router(coordinator: FleetCoordinator) -> Router {
    Router::new()
        .route("/instances/create", post(create_instance))
        .route("/instances", get(list_instances))
        .route("/instances/:id", get(get_instance).delete(delete_instance))
        .route("/instances/:id/qr", get(get_qr))
        .route("/instances/:id/restart", post(restart_instance))
        .route("/auth/sessions", get(list_sessions))
        .route(
            "/auth/sessions/:name",
            get(session_exists).delete(delete_session),
        )
        .route("/health", get(health))
        .with_state(coordinator)
}

#[derive(Debug, Deserialize)]
pub struct CreateInstanceRequest {
    pub user_id: Uuid,
    pub instance_name: String,
    pub webhook_url: String,
}

/// POST /instances/create - Provision an instance and start pairing
async fn create_instance(
    State(coordinator): State<FleetCoordinator>,
    Json(payload): Json<CreateInstanceRequest>,
) -> Result<(StatusCode, Json<InstanceRecord>), FleetError> {
    validate_instance_name(&payload.instance_name)?;
    validate_webhook_url(&payload.webhook_url)?;
    let record = coordinator
        .create_instance(payload.user_id, payload.instance_name, payload.webhook_url)
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// GET /instances - All instances, newest first
async fn list_instances(
    State(coordinator): State<FleetCoordinator>,
) -> Result<Json<Vec<InstanceRecord>>, FleetError> {
    Ok(Json(coordinator.list_instances().await?))
}

/// GET /instances/{id} - One instance row
async fn get_instance(
    State(coordinator): State<FleetCoordinator>,
    Path(id): Path<Uuid>,
) -> Result<Json<InstanceRecord>, FleetError> {
    Ok(Json(coordinator.get_instance(id).await?))
}

/// GET /instances/{id}/qr - Pending QR code, if any
async fn get_qr(
    State(coordinator): State<FleetCoordinator>,
    Path(id): Path<Uuid>,
) -> Result<Json<QrInfo>, FleetError> {
    Ok(Json(coordinator.get_qr(id).await?))
}

/// POST /instances/{id}/restart - Tear down and reconnect
async fn restart_instance(
    State(coordinator): State<FleetCoordinator>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, FleetError> {
    coordinator.restart_instance(id).await?;
    Ok(Json(json!({ "success": true })))
}

/// DELETE /instances/{id} - Remove the instance and wipe its session
async fn delete_instance(
    State(coordinator): State<FleetCoordinator>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, FleetError> {
    coordinator.delete_instance(id).await?;
    Ok(Json(json!({ "success": true })))
}

/// GET /auth/sessions - Stored session rows
async fn list_sessions(
    State(coordinator): State<FleetCoordinator>,
) -> Result<Json<Vec<SessionRowMeta>>, FleetError> {
    Ok(Json(coordinator.session_repo().list().await?))
}

/// GET /auth/sessions/{name} - Whether a session blob exists
async fn session_exists(
    State(coordinator): State<FleetCoordinator>,
    Path(name): Path<String>,
) -> Result<Json<Value>, FleetError> {
    let exists = coordinator.session_repo().exists(&name).await?;
    Ok(Json(json!({ "exists": exists })))
}

/// DELETE /auth/sessions/{name} - Drop a session blob
async fn delete_session(
    State(coordinator): State<FleetCoordinator>,
    Path(name): Path<String>,
) -> Result<Json<Value>, FleetError> {
    coordinator.session_repo().delete(&name).await?;
    Ok(Json(json!({ "success": true })))
}

/// GET /health - Liveness plus fleet stats
async fn health(State(coordinator): State<FleetCoordinator>) -> Json<Value> {
    let stats = coordinator.stats();
    Json(json!({
        "status": "ok",
        "instances": stats.sockets,
        "active_reconnections": stats.active_reconnections,
    }))
}

fn validate_instance_name(name: &str) -> Result<(), FleetError> {
    if name.is_empty() || name.len() > 64 {
        return Err(FleetError::Validation(
            "instance_name must be 1-64 characters".into(),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(FleetError::Validation(
            "instance_name may only contain letters, digits, '.', '_' and '-'".into(),
        ));
    }
    Ok(())
}

fn validate_webhook_url(url: &str) -> Result<(), FleetError> {
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(FleetError::Validation(
            "webhook_url must be an http(s) URL".into(),
        ));
    }
    Ok(())
}
