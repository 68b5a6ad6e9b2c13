use async_trait::async_trait;
use sqlx::Row;

use crate::{
    adapters::persistence::{PostgresPersistence, parse_json_with_fallback},
    app_error::{AppError, AppResult},
    application::use_cases::plan_registry::{
        SubscriptionPlanProfile, SubscriptionPlanRepo, UpsertPlanInput,
    },
    domain::entities::subscription_type::SubscriptionType,
};

fn row_to_profile(row: sqlx::postgres::PgRow) -> SubscriptionPlanProfile {
    let subscription_type: SubscriptionType = row.get("subscription_type");
    let features_json: serde_json::Value = row.get("features");
    let features: Vec<String> = parse_json_with_fallback(
        &features_json,
        "features",
        "subscription_plan",
        subscription_type.as_ref(),
    );

    SubscriptionPlanProfile {
        subscription_type,
        name: row.get("name"),
        monthly_price_cents: row.get("monthly_price_cents"),
        quarterly_price_cents: row.get("quarterly_price_cents"),
        yearly_price_cents: row.get("yearly_price_cents"),
        currency: row.get("currency"),
        features,
        is_active: row.get("is_active"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

const SELECT_COLS: &str = r#"
    subscription_type, name, monthly_price_cents, quarterly_price_cents,
    yearly_price_cents, currency, features, is_active, created_at, updated_at
"#;

#[async_trait]
impl SubscriptionPlanRepo for PostgresPersistence {
    async fn get_by_type(
        &self,
        subscription_type: SubscriptionType,
    ) -> AppResult<Option<SubscriptionPlanProfile>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM subscription_plans WHERE subscription_type = $1",
            SELECT_COLS
        ))
        .bind(subscription_type)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(row.map(row_to_profile))
    }

    async fn list(&self, include_inactive: bool) -> AppResult<Vec<SubscriptionPlanProfile>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM subscription_plans WHERE ($1 OR is_active) ORDER BY subscription_type",
            SELECT_COLS
        ))
        .bind(include_inactive)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(rows.into_iter().map(row_to_profile).collect())
    }

    async fn upsert(
        &self,
        subscription_type: SubscriptionType,
        input: &UpsertPlanInput,
    ) -> AppResult<SubscriptionPlanProfile> {
        let features_json = serde_json::json!(input.features);

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO subscription_plans (
                subscription_type, name, monthly_price_cents, quarterly_price_cents,
                yearly_price_cents, currency, features, is_active, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, TRUE, NOW(), NOW())
            ON CONFLICT (subscription_type) DO UPDATE SET
                name = EXCLUDED.name,
                monthly_price_cents = EXCLUDED.monthly_price_cents,
                quarterly_price_cents = EXCLUDED.quarterly_price_cents,
                yearly_price_cents = EXCLUDED.yearly_price_cents,
                currency = EXCLUDED.currency,
                features = EXCLUDED.features,
                updated_at = NOW()
            RETURNING {}
            "#,
            SELECT_COLS
        ))
        .bind(subscription_type)
        .bind(&input.name)
        .bind(input.monthly_price_cents)
        .bind(input.quarterly_price_cents)
        .bind(input.yearly_price_cents)
        .bind(&input.currency)
        .bind(features_json)
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(row_to_profile(row))
    }

    async fn set_active(
        &self,
        subscription_type: SubscriptionType,
        is_active: bool,
    ) -> AppResult<SubscriptionPlanProfile> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE subscription_plans
            SET is_active = $2, updated_at = NOW()
            WHERE subscription_type = $1
            RETURNING {}
            "#,
            SELECT_COLS
        ))
        .bind(subscription_type)
        .bind(is_active)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::from)?;
        row.map(row_to_profile).ok_or(AppError::NotFound)
    }
}
