//! Order API handlers.

use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
};
use orderflow_core::Order;
use serde::Serialize;

use crate::error::Result;
use crate::state::AppState;

/// Envelope for list responses.
#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub data: Vec<Order>,
}

/// Acknowledgement for operations without a body.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
}

/// Cache observability counters.
#[derive(Debug, Serialize)]
pub struct CacheStats {
    pub entries: usize,
}

/// Create an order.
///
/// POST /api/orders
///
/// # Errors
///
/// 400 for a malformed body or identifier, 409 if the identifier exists.
pub async fn create(
    State(state): State<AppState>,
    payload: std::result::Result<Json<Order>, JsonRejection>,
) -> Result<(StatusCode, Json<Order>)> {
    let Json(order) = payload?;
    let stored = state.service().create(order).await?;
    Ok((StatusCode::CREATED, Json(stored)))
}

/// List all orders from the store.
///
/// GET /api/orders
///
/// # Errors
///
/// 500 if the store cannot be read.
pub async fn index(State(state): State<AppState>) -> Result<Json<ListResponse>> {
    let data = state.service().get_all().await?;
    Ok(Json(ListResponse { data }))
}

/// Get one order, reading through the cache.
///
/// GET /api/orders/{id}
///
/// # Errors
///
/// 404 if no such order exists.
pub async fn show(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Order>> {
    let order = state.service().get_by_id(&id).await?;
    Ok(Json(order))
}

/// Delete an order. Succeeds when the order does not exist.
///
/// DELETE /api/orders/{id}
///
/// # Errors
///
/// 500 if the store delete fails.
pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>> {
    state.service().delete(&id).await?;
    Ok(Json(StatusResponse { status: "ok" }))
}

/// GET /api/cache/stats
pub async fn cache_stats(State(state): State<AppState>) -> Json<CacheStats> {
    Json(CacheStats {
        entries: state.service().cache().len(),
    })
}
