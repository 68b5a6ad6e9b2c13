use crate::app_error::{AppError, ErrorCode};
use axum::Json;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Expected rejections are logged quietly; failures keep their detail
        // in logs only.
        if self.is_validation()
            || matches!(
                self,
                AppError::NotFound | AppError::Unauthorized | AppError::InsufficientBalance { .. }
            )
        {
            tracing::info!(error = %self, "Request rejected");
        } else {
            tracing::error!(error = ?self, "Request failed");
        }

        match self {
            AppError::Database(_) => {
                error_resp(StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::DatabaseError, None)
            }
            AppError::InvalidInput(msg) => {
                error_resp(StatusCode::BAD_REQUEST, ErrorCode::InvalidInput, Some(msg))
            }
            err @ AppError::InvalidDuration(_) => error_resp(
                StatusCode::BAD_REQUEST,
                ErrorCode::InvalidDuration,
                Some(err.to_string()),
            ),
            err @ AppError::PlanNotFound(_) => error_resp(
                StatusCode::BAD_REQUEST,
                ErrorCode::PlanNotFound,
                Some(err.to_string()),
            ),
            err @ AppError::PromoRestricted { .. } => error_resp(
                StatusCode::BAD_REQUEST,
                ErrorCode::PromoRestricted,
                Some(err.to_string()),
            ),
            AppError::InsufficientBalance {
                required_cents,
                available_cents,
            } => {
                let body = serde_json::json!({
                    "code": ErrorCode::InsufficientBalance.as_str(),
                    "required_cents": required_cents,
                    "available_cents": available_cents,
                });
                (StatusCode::PAYMENT_REQUIRED, Json(body)).into_response()
            }
            AppError::Unauthorized => {
                error_resp(StatusCode::UNAUTHORIZED, ErrorCode::Unauthorized, None)
            }
            AppError::NotFound => error_resp(StatusCode::NOT_FOUND, ErrorCode::NotFound, None),
            AppError::Internal(_) => {
                error_resp(StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::InternalError, None)
            }
        }
    }
}

fn error_resp(status: StatusCode, code: ErrorCode, message: Option<String>) -> Response {
    let body = match message {
        Some(msg) => serde_json::json!({ "code": code.as_str(), "message": msg }),
        None => serde_json::json!({ "code": code.as_str() }),
    };
    (status, Json(body)).into_response()
}
