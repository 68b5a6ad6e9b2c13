use async_trait::async_trait;
use sqlx::Row;

use crate::{
    adapters::persistence::PostgresPersistence,
    app_error::{AppError, AppResult},
    application::use_cases::pricing::{CreatePromoInput, PromoCodeProfile, PromoCodeRepo},
    domain::entities::subscription_type::SubscriptionType,
};

/// Stored type labels that no longer parse are dropped with a warning.
fn parse_allowed_types(code: &str, labels: Vec<String>) -> Vec<SubscriptionType> {
    labels
        .into_iter()
        .filter_map(|label| match label.parse::<SubscriptionType>() {
            Ok(t) => Some(t),
            Err(_) => {
                tracing::warn!(promo_code = %code, label = %label, "Unknown plan type on promo code");
                None
            }
        })
        .collect()
}

fn row_to_profile(row: sqlx::postgres::PgRow) -> PromoCodeProfile {
    let code: String = row.get("code");
    let labels: Vec<String> = row.get("allowed_types");
    let allowed_types = parse_allowed_types(&code, labels);

    PromoCodeProfile {
        code,
        discount_percent: row.get("discount_percent"),
        allowed_types,
        is_active: row.get("is_active"),
        valid_until: row.get("valid_until"),
        created_at: row.get("created_at"),
    }
}

const SELECT_COLS: &str = "code, discount_percent, allowed_types, is_active, valid_until, created_at";

#[async_trait]
impl PromoCodeRepo for PostgresPersistence {
    async fn get_by_code(&self, code: &str) -> AppResult<Option<PromoCodeProfile>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM promo_codes WHERE code = $1",
            SELECT_COLS
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(row.map(row_to_profile))
    }

    async fn create(&self, input: &CreatePromoInput) -> AppResult<PromoCodeProfile> {
        let allowed: Vec<String> = input
            .allowed_types
            .iter()
            .map(|t| t.as_ref().to_string())
            .collect();

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO promo_codes (code, discount_percent, allowed_types, is_active, valid_until, created_at)
            VALUES ($1, $2, $3, TRUE, $4, NOW())
            ON CONFLICT (code) DO NOTHING
            RETURNING {}
            "#,
            SELECT_COLS
        ))
        .bind(&input.code)
        .bind(input.discount_percent)
        .bind(&allowed)
        .bind(input.valid_until)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::from)?;

        row.map(row_to_profile).ok_or_else(|| {
            AppError::InvalidInput(format!("Promo code {} already exists", input.code))
        })
    }

    async fn deactivate(&self, code: &str) -> AppResult<()> {
        let result = sqlx::query("UPDATE promo_codes SET is_active = FALSE WHERE code = $1")
            .bind(code)
            .execute(&self.pool)
            .await
            .map_err(AppError::from)?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }
        Ok(())
    }
}
