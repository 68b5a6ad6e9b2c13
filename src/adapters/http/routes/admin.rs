use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post, put},
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    adapters::http::{app_state::AppState, middleware::require_admin},
    app_error::AppResult,
    application::use_cases::{plan_registry::UpsertPlanInput, pricing::CreatePromoInput},
    domain::entities::subscription_type::SubscriptionType,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/plans", get(list_plans))
        .route("/plans/{subscription_type}", put(upsert_plan))
        .route("/plans/{subscription_type}/active", post(set_plan_active))
        .route("/promo-codes", post(create_promo_code))
        .route("/promo-codes/{code}", delete(deactivate_promo_code))
        .route("/subscriptions/{subscription_id}/confirm", post(confirm_payment))
        .route("/subscriptions/{subscription_id}/events", get(list_events))
        .route("/users/{user_id}/account", get(get_account))
        .route("/users/{user_id}/audit", get(list_audit_entries))
        .route("/users/{user_id}/resync-tier", post(resync_tier))
        .route("/reconciliation/run", post(run_reconciliation))
}

#[derive(Deserialize)]
struct SetActivePayload {
    is_active: bool,
}

#[derive(Deserialize)]
struct ConfirmPaymentPayload {
    external_reference: String,
}

#[derive(Deserialize, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum ReconciliationMode {
    #[default]
    Daily,
    Critical,
}

#[derive(Deserialize, Default)]
struct RunReconciliationQuery {
    #[serde(default)]
    mode: ReconciliationMode,
}

async fn list_plans(
    State(app_state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<impl IntoResponse> {
    require_admin(&headers, &app_state)?;
    let plans = app_state.plan_use_cases.list_plans(true).await?;
    Ok(Json(plans))
}

async fn upsert_plan(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    Path(subscription_type): Path<SubscriptionType>,
    Json(payload): Json<UpsertPlanInput>,
) -> AppResult<impl IntoResponse> {
    require_admin(&headers, &app_state)?;
    let plan = app_state
        .plan_use_cases
        .upsert_plan(subscription_type, payload)
        .await?;
    Ok(Json(plan))
}

async fn set_plan_active(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    Path(subscription_type): Path<SubscriptionType>,
    Json(payload): Json<SetActivePayload>,
) -> AppResult<impl IntoResponse> {
    require_admin(&headers, &app_state)?;
    let plan = app_state
        .plan_use_cases
        .set_plan_active(subscription_type, payload.is_active)
        .await?;
    Ok(Json(plan))
}

async fn create_promo_code(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreatePromoInput>,
) -> AppResult<impl IntoResponse> {
    require_admin(&headers, &app_state)?;
    let promo = app_state.pricing_use_cases.create_promo(payload).await?;
    Ok((StatusCode::CREATED, Json(promo)))
}

async fn deactivate_promo_code(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    Path(code): Path<String>,
) -> AppResult<impl IntoResponse> {
    require_admin(&headers, &app_state)?;
    app_state.pricing_use_cases.deactivate_promo(&code).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn confirm_payment(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    Path(subscription_id): Path<Uuid>,
    Json(payload): Json<ConfirmPaymentPayload>,
) -> AppResult<impl IntoResponse> {
    require_admin(&headers, &app_state)?;
    let subscription = app_state
        .subscription_use_cases
        .confirm_external_payment(subscription_id, &payload.external_reference)
        .await?;
    Ok(Json(subscription))
}

async fn list_events(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    Path(subscription_id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    require_admin(&headers, &app_state)?;
    let events = app_state
        .subscription_use_cases
        .list_events(subscription_id)
        .await?;
    Ok(Json(events))
}

async fn get_account(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    require_admin(&headers, &app_state)?;
    let account = app_state.ledger_gateway.get_account(user_id).await?;
    Ok(Json(account))
}

async fn list_audit_entries(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    require_admin(&headers, &app_state)?;
    let entries = app_state.ledger_gateway.list_audit_entries(user_id).await?;
    Ok(Json(entries))
}

async fn resync_tier(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    require_admin(&headers, &app_state)?;
    let tier = app_state.subscription_use_cases.resync_tier(user_id).await?;
    Ok(Json(serde_json::json!({ "user_id": user_id, "subscription_tier": tier })))
}

async fn run_reconciliation(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<RunReconciliationQuery>,
) -> AppResult<impl IntoResponse> {
    require_admin(&headers, &app_state)?;

    let report = match query.mode {
        ReconciliationMode::Daily => app_state.reconciliation_use_cases.run_daily().await?,
        ReconciliationMode::Critical => {
            app_state
                .reconciliation_use_cases
                .run_critical_checks()
                .await?
        }
    };
    Ok(Json(report))
}
