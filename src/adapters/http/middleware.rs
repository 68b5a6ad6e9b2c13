use axum::http::HeaderMap;
use secrecy::ExposeSecret;
use uuid::Uuid;

use crate::{adapters::http::app_state::AppState, app_error::AppError};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Caller identity as forwarded by the upstream auth layer.
pub fn current_user(headers: &HeaderMap) -> Result<Uuid, AppError> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v.trim()).ok())
        .ok_or(AppError::Unauthorized)
}

pub fn require_admin(headers: &HeaderMap, app_state: &AppState) -> Result<(), AppError> {
    let provided = headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(AppError::Unauthorized)?;

    let expected = app_state.config.admin_api_token.expose_secret();
    if constant_time_eq(provided.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        tracing::warn!("Rejected admin request with wrong token");
        Err(AppError::Unauthorized)
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
