use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

use crate::protocol::ProtocolError;
use crate::registry::RegistryError;
use crate::session_store::SessionStoreError;

/// Error surface shared by the coordinator and the HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("instance name already in use: {0}")]
    NameTaken(String),
    #[error("user already owns an instance")]
    OwnerTaken,
    #[error("fleet is at capacity ({limit} instances)")]
    CapacityExceeded { limit: usize },
    #[error("instance not found")]
    NotFound,
    #[error("store error: {0}")]
    Store(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl FleetError {
    fn status(&self) -> StatusCode {
        match self {
            FleetError::Validation(_) => StatusCode::BAD_REQUEST,
            FleetError::NameTaken(_) | FleetError::OwnerTaken => StatusCode::CONFLICT,
            FleetError::CapacityExceeded { .. } => StatusCode::CONFLICT,
            FleetError::NotFound => StatusCode::NOT_FOUND,
            FleetError::Store(_) | FleetError::Protocol(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for FleetError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<RegistryError> for FleetError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NameTaken(name) => FleetError::NameTaken(name),
            RegistryError::OwnerTaken => FleetError::OwnerTaken,
            RegistryError::NotFound => FleetError::NotFound,
            RegistryError::Store(msg) => FleetError::Store(msg),
        }
    }
}

impl From<SessionStoreError> for FleetError {
    fn from(err: SessionStoreError) -> Self {
        FleetError::Store(err.to_string())
    }
}

impl From<ProtocolError> for FleetError {
    fn from(err: ProtocolError) -> Self {
        FleetError::Protocol(err.to_string())
    }
}
