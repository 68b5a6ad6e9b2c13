use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid duration: {0} months (allowed: 1, 3, 12)")]
    InvalidDuration(i32),

    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    #[error("Promo code {code} cannot be applied to plan {plan}")]
    PromoRestricted { code: String, plan: String },

    #[error("Insufficient balance: required {required_cents}, available {available_cents}")]
    InsufficientBalance {
        required_cents: i64,
        available_cents: i64,
    },

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Not found")]
    NotFound,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Validation-class errors are rejected before any mutation.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            AppError::InvalidInput(_)
                | AppError::InvalidDuration(_)
                | AppError::PlanNotFound(_)
                | AppError::PromoRestricted { .. }
        )
    }
}

#[derive(Clone, Copy, Debug)]
pub enum ErrorCode {
    DatabaseError,
    InvalidInput,
    InvalidDuration,
    PlanNotFound,
    PromoRestricted,
    InsufficientBalance,
    Unauthorized,
    NotFound,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::DatabaseError => "DATABASE_ERROR",
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::InvalidDuration => "INVALID_DURATION",
            ErrorCode::PlanNotFound => "PLAN_NOT_FOUND",
            ErrorCode::PromoRestricted => "PROMO_RESTRICTED",
            ErrorCode::InsufficientBalance => "INSUFFICIENT_BALANCE",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
