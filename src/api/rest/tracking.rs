use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::Json;
use axum::Router;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::api::rest::ws;
use crate::engine::tracking::Trail;
use crate::error::AppError;
use crate::geo::GeoPoint;
use crate::models::ids::OrderId;
use crate::models::principal::Principal;
use crate::models::tracking::TrackingEntry;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orders/:id/tracking", get(get_trail).post(append_position))
        .route("/orders/:id/tracking/latest", get(get_latest))
        .route("/orders/:id/live", get(ws::live_handler))
}

#[derive(Deserialize)]
pub struct AppendPositionRequest {
    pub location: GeoPoint,
    pub recorded_at: Option<DateTime<Utc>>,
}

async fn append_position(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(id): Path<OrderId>,
    Json(payload): Json<AppendPositionRequest>,
) -> Result<Json<TrackingEntry>, AppError> {
    let recorded_at = payload.recorded_at.unwrap_or_else(Utc::now);
    let entry = state
        .tracking
        .append(&principal, &id, payload.location, recorded_at)
        .await?;
    Ok(Json(entry))
}

async fn get_trail(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(id): Path<OrderId>,
) -> Result<Json<Trail>, AppError> {
    Ok(Json(state.tracking.trail(&principal, &id).await?))
}

async fn get_latest(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(id): Path<OrderId>,
) -> Result<Json<Option<TrackingEntry>>, AppError> {
    Ok(Json(state.tracking.latest(&principal, &id).await?))
}
