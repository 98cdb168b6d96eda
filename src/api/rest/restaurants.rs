use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::put;
use axum::Json;
use axum::Router;
use serde::Deserialize;

use crate::error::AppError;
use crate::geo::GeoPoint;
use crate::models::ids::RestaurantId;
use crate::models::principal::{Principal, Role};
use crate::models::restaurant::Restaurant;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/restaurants/:id", put(upsert_restaurant).get(get_restaurant))
}

#[derive(Deserialize)]
pub struct UpsertRestaurantRequest {
    pub name: String,
    pub location: GeoPoint,
    pub delivery_radius_m: Option<f64>,
}

async fn upsert_restaurant(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(id): Path<RestaurantId>,
    Json(payload): Json<UpsertRestaurantRequest>,
) -> Result<Json<Restaurant>, AppError> {
    let owns = principal.role == Role::Restaurant && principal.id == id.as_str();
    if !owns {
        principal.require_privileged()?;
    }
    if payload.name.trim().is_empty() {
        return Err(AppError::BadRequest("name cannot be empty".to_string()));
    }
    if !payload.location.is_valid() {
        return Err(AppError::BadRequest("invalid location".to_string()));
    }
    if let Some(radius) = payload.delivery_radius_m {
        if !(radius.is_finite() && radius > 0.0) {
            return Err(AppError::BadRequest("delivery_radius_m must be > 0".to_string()));
        }
    }

    let restaurant = state
        .stores
        .restaurants
        .upsert(Restaurant {
            id,
            name: payload.name,
            location: payload.location,
            delivery_radius_m: payload.delivery_radius_m,
        })
        .await?;
    Ok(Json(restaurant))
}

async fn get_restaurant(
    State(state): State<Arc<AppState>>,
    _principal: Principal,
    Path(id): Path<RestaurantId>,
) -> Result<Json<Restaurant>, AppError> {
    let restaurant = state
        .stores
        .restaurants
        .get(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("restaurant {id} not found")))?;
    Ok(Json(restaurant))
}
