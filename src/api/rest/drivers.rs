use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, patch, post};
use axum::Json;
use axum::Router;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::geo::GeoPoint;
use crate::models::driver::{Driver, DriverStatus};
use crate::models::ids::DriverId;
use crate::models::principal::{Principal, Role};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/drivers", post(register_driver).get(list_drivers))
        .route("/drivers/nearby", get(nearby_drivers))
        .route("/drivers/:id", get(get_driver))
        .route("/drivers/:id/status", patch(update_driver_status))
        .route("/drivers/:id/location", patch(update_driver_location))
}

#[derive(Deserialize)]
pub struct RegisterDriverRequest {
    /// Defaults to the caller's id.
    pub id: Option<DriverId>,
    pub location: Option<GeoPoint>,
}

#[derive(Deserialize)]
pub struct UpdateStatusRequest {
    pub status: DriverStatus,
}

#[derive(Deserialize)]
pub struct UpdateLocationRequest {
    pub location: GeoPoint,
    pub recorded_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
pub struct NearbyQuery {
    pub lat: f64,
    pub lng: f64,
    pub radius_m: Option<f64>,
}

#[derive(Serialize)]
pub struct NearbyDriver {
    pub driver: Driver,
    pub distance_m: f64,
}

async fn register_driver(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Json(payload): Json<RegisterDriverRequest>,
) -> Result<Json<Driver>, AppError> {
    let driver_id = payload
        .id
        .unwrap_or_else(|| DriverId::new(principal.id.clone()));

    let driver = state
        .registry
        .upsert_driver(&principal, &driver_id, payload.location)
        .await?;
    Ok(Json(driver))
}

async fn list_drivers(
    State(state): State<Arc<AppState>>,
    principal: Principal,
) -> Result<Json<Vec<Driver>>, AppError> {
    Ok(Json(state.registry.list(&principal).await?))
}

/// A driver reading its own record is registered on first contact.
async fn get_driver(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(id): Path<DriverId>,
) -> Result<Json<Driver>, AppError> {
    let driver = if principal.role == Role::Delivery {
        state.registry.upsert_driver(&principal, &id, None).await?
    } else {
        principal.require_privileged()?;
        state.registry.get_by_id(&id).await?
    };
    Ok(Json(driver))
}

async fn update_driver_status(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(id): Path<DriverId>,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<Json<Driver>, AppError> {
    let driver = state
        .registry
        .update_status(&principal, &id, payload.status)
        .await?;
    Ok(Json(driver))
}

async fn update_driver_location(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(id): Path<DriverId>,
    Json(payload): Json<UpdateLocationRequest>,
) -> Result<Json<Driver>, AppError> {
    let recorded_at = payload.recorded_at.unwrap_or_else(Utc::now);
    let driver = state
        .registry
        .update_position(&principal, &id, payload.location, recorded_at)
        .await?;
    Ok(Json(driver))
}

async fn nearby_drivers(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Query(query): Query<NearbyQuery>,
) -> Result<Json<Vec<NearbyDriver>>, AppError> {
    if !(principal.is_privileged() || principal.role == Role::Restaurant) {
        return Err(AppError::Forbidden(format!(
            "{} {} cannot search drivers",
            principal.role, principal.id
        )));
    }

    let radius_m = query
        .radius_m
        .unwrap_or(state.config.default_delivery_radius_m);
    let nearby = state
        .registry
        .query_available_near(GeoPoint::new(query.lat, query.lng), radius_m)
        .await?
        .into_iter()
        .map(|(driver, distance_m)| NearbyDriver { driver, distance_m })
        .collect();

    Ok(Json(nearby))
}
