use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::error::AppError;
use crate::models::principal::{Principal, Role};

/// Set by the upstream auth service along with `PRINCIPAL_ROLE_HEADER`.
pub const PRINCIPAL_ID_HEADER: &str = "x-principal-id";
pub const PRINCIPAL_ROLE_HEADER: &str = "x-principal-role";

#[async_trait]
impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = header(parts, PRINCIPAL_ID_HEADER)?;
        let role = header(parts, PRINCIPAL_ROLE_HEADER)?.parse::<Role>()?;
        Ok(Principal::new(id, role))
    }
}

fn header<'a>(parts: &'a Parts, name: &str) -> Result<&'a str, AppError> {
    parts
        .headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AppError::Unauthorized(format!("missing {name} header")))
}
