use std::collections::BTreeMap;

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, patch, post},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    adapters::http::{app_state::AppState, middleware::current_user},
    app_error::AppResult,
    application::use_cases::{
        plan_registry::PlanPricing, subscription_lifecycle::CreateSubscriptionRequest,
    },
    domain::entities::subscription_type::SubscriptionType,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_subscription))
        .route("/cancel", post(cancel_subscription))
        .route("/change-plan", post(change_plan))
        .route("/auto-renewal", patch(set_auto_renewal))
        .route("/status", get(get_status))
        .route("/promo/validate", post(validate_promo))
        .route("/plans", get(get_plans))
        .route("/history", get(get_history))
}

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Deserialize)]
struct CancelPayload {
    subscription_id: Option<Uuid>,
    reason: Option<String>,
}

#[derive(Deserialize)]
struct ChangePlanPayload {
    subscription_type: SubscriptionType,
    duration_months: i32,
}

#[derive(Deserialize)]
struct AutoRenewalPayload {
    enabled: bool,
}

#[derive(Deserialize)]
struct ValidatePromoPayload {
    code: String,
    subscription_type: SubscriptionType,
    duration_months: i32,
}

#[derive(Serialize)]
struct PlansResponse {
    pricing: BTreeMap<SubscriptionType, PlanPricing>,
    features: BTreeMap<SubscriptionType, Vec<String>>,
}

// ============================================================================
// Handlers
// ============================================================================

async fn create_subscription(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateSubscriptionRequest>,
) -> AppResult<impl IntoResponse> {
    let user_id = current_user(&headers)?;

    let subscription = app_state
        .subscription_use_cases
        .create_subscription(user_id, payload)
        .await?;

    Ok((StatusCode::CREATED, Json(subscription)))
}

async fn cancel_subscription(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CancelPayload>,
) -> AppResult<impl IntoResponse> {
    let user_id = current_user(&headers)?;

    let subscription = app_state
        .subscription_use_cases
        .cancel_subscription(user_id, payload.subscription_id, payload.reason.as_deref())
        .await?;

    Ok(Json(subscription))
}

async fn change_plan(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ChangePlanPayload>,
) -> AppResult<impl IntoResponse> {
    let user_id = current_user(&headers)?;

    let subscription = app_state
        .subscription_use_cases
        .change_plan(user_id, payload.subscription_type, payload.duration_months)
        .await?;

    Ok(Json(subscription))
}

async fn set_auto_renewal(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<AutoRenewalPayload>,
) -> AppResult<impl IntoResponse> {
    let user_id = current_user(&headers)?;

    let subscription = app_state
        .subscription_use_cases
        .set_auto_renewal(user_id, payload.enabled)
        .await?;

    Ok(Json(subscription))
}

async fn get_status(
    State(app_state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<impl IntoResponse> {
    let user_id = current_user(&headers)?;
    let status = app_state
        .subscription_use_cases
        .get_current_status(user_id)
        .await?;
    Ok(Json(status))
}

async fn validate_promo(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ValidatePromoPayload>,
) -> AppResult<impl IntoResponse> {
    current_user(&headers)?;

    let validation = app_state
        .pricing_use_cases
        .validate_promo(
            &payload.code,
            payload.subscription_type,
            payload.duration_months,
        )
        .await?;

    Ok(Json(validation))
}

async fn get_plans(State(app_state): State<AppState>) -> AppResult<impl IntoResponse> {
    let pricing = app_state.plan_use_cases.get_pricing().await?;
    let features = app_state.plan_use_cases.get_features().await?;
    Ok(Json(PlansResponse { pricing, features }))
}

async fn get_history(
    State(app_state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<impl IntoResponse> {
    let user_id = current_user(&headers)?;
    let history = app_state.subscription_use_cases.get_history(user_id).await?;
    Ok(Json(history))
}
