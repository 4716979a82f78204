// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! HTTP surface of a node.
//!
//! Clients and replays hit the same routes; the [`loop_guard`] layer is
//! what tells them apart. Every `/api/v1` route requires an
//! `operation-name` header, which becomes the operation tag of any event the
//! request produces.

use crate::error::ReplicationError;
use crate::event::HEADER_OPERATION_NAME;
use crate::guard::{loop_guard, ReplicationContext};
use crate::node::HealthProbe;
use crate::resources::{
    Pagination, Shipment, ShipmentCreate, ShipmentUpdate, Warehouse, WarehouseCreate,
    WarehouseUpdate,
};
use crate::service::LogisticsService;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::middleware::from_fn;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tracing::error;

/// Shared state of the router.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<LogisticsService>,
    pub health: HealthProbe,
}

/// Build the node's router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/ping", get(ping))
        .route("/api/v1/warehouses", get(list_warehouses).post(create_warehouse))
        .route("/api/v1/warehouses/", get(list_warehouses).post(create_warehouse))
        .route(
            "/api/v1/warehouses/{id}",
            get(get_warehouse).put(update_warehouse).delete(delete_warehouse),
        )
        .route("/api/v1/shipments", get(list_shipments).post(create_shipment))
        .route("/api/v1/shipments/", get(list_shipments).post(create_shipment))
        .route(
            "/api/v1/shipments/{id}",
            get(get_shipment).put(update_shipment).delete(delete_shipment),
        )
        .route("/api/v1/shipments/tracking/{tracking_number}", get(track_shipment))
        .layer(from_fn(loop_guard))
        .with_state(state)
}

// =============================================================================
// Errors & extractors
// =============================================================================

/// Error response with a `{"detail": ...}` body.
#[derive(Debug)]
pub enum ApiError {
    MissingOperationName,
    NotFound(&'static str),
    Conflict(String),
    Internal(ReplicationError),
}

impl From<ReplicationError> for ApiError {
    fn from(e: ReplicationError) -> Self {
        match e {
            ReplicationError::Conflict(msg) => ApiError::Conflict(msg),
            other => ApiError::Internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::MissingOperationName => (
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("Missing {} header", HEADER_OPERATION_NAME),
            ),
            ApiError::NotFound(what) => (StatusCode::NOT_FOUND, format!("{} not found", what)),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(e) => {
                error!(error = %e, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

/// The request's `operation-name` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationName(pub String);

impl<S> FromRequestParts<S> for OperationName
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(HEADER_OPERATION_NAME)
            .and_then(|v| v.to_str().ok())
            .map(|v| OperationName(v.to_string()))
            .ok_or(ApiError::MissingOperationName)
    }
}

type ApiResult<T> = Result<T, ApiError>;

// =============================================================================
// Handlers
// =============================================================================

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.health.check().await)
}

async fn ping(OperationName(operation): OperationName) -> impl IntoResponse {
    Json(json!({ "msg": "pong", "operation": operation }))
}

async fn create_warehouse(
    State(state): State<AppState>,
    OperationName(tag): OperationName,
    ctx: ReplicationContext,
    Json(input): Json<WarehouseCreate>,
) -> ApiResult<Json<Warehouse>> {
    Ok(Json(state.service.create_warehouse(&ctx, &tag, &input).await?))
}

async fn list_warehouses(
    State(state): State<AppState>,
    _operation: OperationName,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<Vec<Warehouse>>> {
    Ok(Json(state.service.list_warehouses(page).await?))
}

async fn get_warehouse(
    State(state): State<AppState>,
    _operation: OperationName,
    Path(id): Path<i64>,
) -> ApiResult<Json<Warehouse>> {
    state
        .service
        .get_warehouse(id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound("Warehouse"))
}

async fn update_warehouse(
    State(state): State<AppState>,
    OperationName(tag): OperationName,
    ctx: ReplicationContext,
    Path(id): Path<i64>,
    Json(update): Json<WarehouseUpdate>,
) -> ApiResult<Json<Warehouse>> {
    state
        .service
        .update_warehouse(&ctx, &tag, id, &update)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound("Warehouse"))
}

async fn delete_warehouse(
    State(state): State<AppState>,
    OperationName(tag): OperationName,
    ctx: ReplicationContext,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    if !state.service.delete_warehouse(&ctx, &tag, id).await? {
        return Err(ApiError::NotFound("Warehouse"));
    }
    Ok(Json(json!({ "message": "Warehouse deleted successfully" })))
}

async fn create_shipment(
    State(state): State<AppState>,
    OperationName(tag): OperationName,
    ctx: ReplicationContext,
    Json(input): Json<ShipmentCreate>,
) -> ApiResult<Json<Shipment>> {
    Ok(Json(state.service.create_shipment(&ctx, &tag, &input).await?))
}

async fn list_shipments(
    State(state): State<AppState>,
    _operation: OperationName,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<Vec<Shipment>>> {
    Ok(Json(state.service.list_shipments(page).await?))
}

async fn get_shipment(
    State(state): State<AppState>,
    _operation: OperationName,
    Path(id): Path<i64>,
) -> ApiResult<Json<Shipment>> {
    state
        .service
        .get_shipment(id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound("Shipment"))
}

async fn track_shipment(
    State(state): State<AppState>,
    _operation: OperationName,
    Path(tracking_number): Path<String>,
) -> ApiResult<Json<Shipment>> {
    state
        .service
        .track_shipment(&tracking_number)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound("Shipment"))
}

async fn update_shipment(
    State(state): State<AppState>,
    OperationName(tag): OperationName,
    ctx: ReplicationContext,
    Path(id): Path<i64>,
    Json(update): Json<ShipmentUpdate>,
) -> ApiResult<Json<Shipment>> {
    state
        .service
        .update_shipment(&ctx, &tag, id, &update)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound("Shipment"))
}

async fn delete_shipment(
    State(state): State<AppState>,
    OperationName(tag): OperationName,
    ctx: ReplicationContext,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    if !state.service.delete_shipment(&ctx, &tag, id).await? {
        return Err(ApiError::NotFound("Shipment"));
    }
    Ok(Json(json!({ "message": "Shipment deleted successfully" })))
}
