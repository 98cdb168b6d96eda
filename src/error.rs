use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::engine::state_machine::TransitionError;
use crate::models::ids::OrderId;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("no driver available for order {0}")]
    NoDriverAvailable(OrderId),

    #[error("order {0} is no longer assignable")]
    OrderNoLongerAssignable(OrderId),

    #[error("order {0} is not trackable")]
    OrderNotTrackable(OrderId),

    #[error("store failure: {0}")]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub const fn code(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "not_found",
            AppError::BadRequest(_) => "bad_request",
            AppError::Unauthorized(_) => "unauthorized",
            AppError::Forbidden(_) => "forbidden",
            AppError::Conflict(_) => "conflict",
            AppError::InvalidTransition(_) => "invalid_transition",
            AppError::NoDriverAvailable(_) => "no_driver_available",
            AppError::OrderNoLongerAssignable(_) => "order_no_longer_assignable",
            AppError::OrderNotTrackable(_) => "order_not_trackable",
            AppError::Store(_) => "store_unavailable",
            AppError::Internal(_) => "internal",
        }
    }

    pub const fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Conflict(_)
            | AppError::InvalidTransition(_)
            | AppError::NoDriverAvailable(_)
            | AppError::OrderNoLongerAssignable(_) => StatusCode::CONFLICT,
            AppError::OrderNotTrackable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<TransitionError> for AppError {
    fn from(err: TransitionError) -> Self {
        match err {
            TransitionError::MissingReason => AppError::BadRequest(err.to_string()),
            other => AppError::InvalidTransition(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.to_string(),
            "code": self.code(),
        }));

        (self.status(), body).into_response()
    }
}
