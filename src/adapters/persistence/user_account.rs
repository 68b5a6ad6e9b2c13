use async_trait::async_trait;
use sqlx::Row;
use uuid::Uuid;

use crate::{
    adapters::persistence::PostgresPersistence,
    app_error::{AppError, AppResult},
    application::use_cases::ledger::{UserAccount, UserAccountRepo},
    domain::entities::subscription_type::UserTier,
};

#[async_trait]
impl UserAccountRepo for PostgresPersistence {
    async fn get_account(&self, user_id: Uuid) -> AppResult<Option<UserAccount>> {
        let row = sqlx::query("SELECT id, balance_cents, subscription_tier FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(AppError::from)?;

        Ok(row.map(|row| {
            let tier: String = row.get("subscription_tier");
            UserAccount {
                id: row.get("id"),
                balance_cents: row.get("balance_cents"),
                subscription_tier: UserTier::from_label(&tier),
            }
        }))
    }
}
