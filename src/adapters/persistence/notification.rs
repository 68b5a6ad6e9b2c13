use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    adapters::persistence::PostgresPersistence,
    app_error::{AppError, AppResult},
    application::ports::notification_sink::{IdempotencyKey, NotificationRequest, NotificationSink},
};

#[async_trait]
impl NotificationSink for PostgresPersistence {
    async fn record(&self, request: &NotificationRequest) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO notifications (
                id, user_id, notification_type, title, message, data, idempotency_key, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(request.user_id)
        .bind(request.notification_type)
        .bind(&request.title)
        .bind(&request.message)
        .bind(&request.data)
        .bind(request.idempotency_key.as_ref().map(IdempotencyKey::as_str))
        .execute(&self.pool)
        .await
        .map_err(AppError::from)?;

        Ok(result.rows_affected() > 0)
    }
}
