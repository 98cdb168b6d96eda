use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, patch, post};
use axum::Json;
use axum::Router;
use serde::Deserialize;
use tracing::warn;

use crate::engine::assignment::AssignmentOutcome;
use crate::engine::lifecycle::NewOrder;
use crate::engine::queue::{enqueue_dispatch, DispatchRequest};
use crate::error::AppError;
use crate::models::assignment::Assignment;
use crate::models::ids::OrderId;
use crate::models::order::{Order, PaymentStatus};
use crate::models::principal::Principal;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orders", post(create_order))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/confirm", post(confirm_order))
        .route("/orders/:id/preparing", post(start_preparing))
        .route("/orders/:id/prepared", post(mark_prepared))
        .route("/orders/:id/dispatch", post(dispatch_order))
        .route("/orders/:id/delivered", post(mark_delivered))
        .route("/orders/:id/cancel", post(cancel_order))
        .route("/orders/:id/payment", patch(update_payment))
        .route("/assignments", get(list_assignments))
}

#[derive(Deserialize)]
pub struct CancelRequest {
    pub reason: String,
}

#[derive(Deserialize)]
pub struct PaymentRequest {
    pub status: PaymentStatus,
}

async fn create_order(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Json(payload): Json<NewOrder>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(state.lifecycle.create_order(&principal, payload).await?))
}

async fn get_order(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(id): Path<OrderId>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(state.lifecycle.get(&principal, &id).await?))
}

async fn confirm_order(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(id): Path<OrderId>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(state.lifecycle.confirm(&principal, &id).await?))
}

async fn start_preparing(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(id): Path<OrderId>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(state.lifecycle.start_preparing(&principal, &id).await?))
}

async fn mark_prepared(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(id): Path<OrderId>,
) -> Result<Json<Order>, AppError> {
    let order = state.lifecycle.mark_prepared(&principal, &id).await?;

    if state.config.auto_dispatch_on_prepared {
        // The order is already Prepared; a failed enqueue only delays dispatch.
        if let Err(err) = enqueue_dispatch(&state, DispatchRequest::new(order.id.clone())).await {
            warn!(order_id = %order.id, error = %err, "failed to queue dispatch");
        }
    }

    Ok(Json(order))
}

/// "Notify delivery agents": assigns a driver synchronously.
async fn dispatch_order(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(id): Path<OrderId>,
) -> Result<Json<AssignmentOutcome>, AppError> {
    Ok(Json(state.coordinator.assign(&principal, &id).await?))
}

async fn mark_delivered(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(id): Path<OrderId>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(state.lifecycle.mark_delivered(&principal, &id).await?))
}

async fn cancel_order(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(id): Path<OrderId>,
    Json(payload): Json<CancelRequest>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(
        state
            .lifecycle
            .cancel(&principal, &id, &payload.reason)
            .await?,
    ))
}

async fn update_payment(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(id): Path<OrderId>,
    Json(payload): Json<PaymentRequest>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(
        state
            .lifecycle
            .update_payment_status(&principal, &id, payload.status)
            .await?,
    ))
}

async fn list_assignments(
    State(state): State<Arc<AppState>>,
    principal: Principal,
) -> Result<Json<Vec<Assignment>>, AppError> {
    principal.require_privileged()?;
    Ok(Json(state.coordinator.assignments()))
}
