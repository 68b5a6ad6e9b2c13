use async_trait::async_trait;
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use crate::{
    adapters::persistence::PostgresPersistence,
    app_error::{AppError, AppResult},
    application::use_cases::ledger::{
        BillingAuditEntry, ChargeInput, LedgerRepo, PaymentRecordProfile, Receipt,
    },
};

pub(crate) fn row_to_payment(row: &sqlx::postgres::PgRow) -> PaymentRecordProfile {
    PaymentRecordProfile {
        id: row.get("id"),
        subscription_id: row.get("subscription_id"),
        user_id: row.get("user_id"),
        amount_cents: row.get("amount_cents"),
        currency: row.get("currency"),
        payment_method: row.get("payment_method"),
        payment_type: row.get("payment_type"),
        status: row.get("status"),
        external_reference: row.get("external_reference"),
        created_at: row.get("created_at"),
    }
}

const PAYMENT_COLS: &str = r#"
    id, subscription_id, user_id, amount_cents, currency, payment_method,
    payment_type, status, external_reference, created_at
"#;

/// Apply a charge inside the caller's transaction.
///
/// Balance charges debit with a conditional update so the balance can never go
/// negative. The payment record and the audit row are written in the same
/// transaction, so a rollback leaves no trace of the charge.
pub(crate) async fn tx_charge(
    tx: &mut Transaction<'_, Postgres>,
    input: &ChargeInput,
) -> AppResult<Receipt> {
    let balance_after_cents: i64 = if input.payment_method.is_balance() {
        let debited: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE users
            SET balance_cents = balance_cents - $2, updated_at = NOW()
            WHERE id = $1 AND balance_cents >= $2
            RETURNING balance_cents
            "#,
        )
        .bind(input.user_id)
        .bind(input.amount_cents)
        .fetch_optional(&mut **tx)
        .await
        .map_err(AppError::from)?;

        match debited {
            Some(balance) => balance,
            None => {
                let available: Option<i64> =
                    sqlx::query_scalar("SELECT balance_cents FROM users WHERE id = $1")
                        .bind(input.user_id)
                        .fetch_optional(&mut **tx)
                        .await
                        .map_err(AppError::from)?;
                return match available {
                    Some(available_cents) => Err(AppError::InsufficientBalance {
                        required_cents: input.amount_cents,
                        available_cents,
                    }),
                    None => Err(AppError::NotFound),
                };
            }
        }
    } else {
        sqlx::query_scalar::<_, i64>("SELECT balance_cents FROM users WHERE id = $1")
            .bind(input.user_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(AppError::from)?
            .ok_or(AppError::NotFound)?
    };

    let row = sqlx::query(&format!(
        r#"
        INSERT INTO payment_records (
            id, subscription_id, user_id, amount_cents, currency, payment_method,
            payment_type, status, external_reference, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, 'completed', $8, NOW())
        RETURNING {}
        "#,
        PAYMENT_COLS
    ))
    .bind(Uuid::new_v4())
    .bind(input.subscription_id)
    .bind(input.user_id)
    .bind(input.amount_cents)
    .bind(&input.currency)
    .bind(input.payment_method)
    .bind(input.payment_type)
    .bind(&input.external_reference)
    .fetch_one(&mut **tx)
    .await
    .map_err(AppError::from)?;
    let payment = row_to_payment(&row);

    sqlx::query(
        r#"
        INSERT INTO billing_audit_log (id, user_id, operation, amount_cents, details, created_at)
        VALUES ($1, $2, $3, $4, $5, NOW())
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(input.user_id)
    .bind(input.audit_operation())
    .bind(input.amount_cents)
    .bind(input.audit_details(payment.id, balance_after_cents))
    .execute(&mut **tx)
    .await
    .map_err(AppError::from)?;

    tracing::info!(
        target: "billing_audit",
        user_id = %input.user_id,
        subscription_id = %input.subscription_id,
        payment_id = %payment.id,
        operation = %input.audit_operation(),
        amount_cents = input.amount_cents,
        balance_after_cents,
        "Subscription charge recorded"
    );

    Ok(Receipt {
        payment,
        balance_after_cents,
    })
}

#[async_trait]
impl LedgerRepo for PostgresPersistence {
    async fn charge(&self, input: &ChargeInput) -> AppResult<Receipt> {
        let mut tx = self.pool.begin().await.map_err(AppError::from)?;
        let receipt = tx_charge(&mut tx, input).await?;
        tx.commit().await.map_err(AppError::from)?;
        Ok(receipt)
    }

    async fn list_by_user(&self, user_id: Uuid) -> AppResult<Vec<PaymentRecordProfile>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM payment_records WHERE user_id = $1 ORDER BY created_at DESC, id",
            PAYMENT_COLS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(rows.iter().map(row_to_payment).collect())
    }

    async fn list_by_subscription(
        &self,
        subscription_id: Uuid,
    ) -> AppResult<Vec<PaymentRecordProfile>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM payment_records WHERE subscription_id = $1 ORDER BY created_at DESC, id",
            PAYMENT_COLS
        ))
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(rows.iter().map(row_to_payment).collect())
    }

    async fn list_audit(&self, user_id: Uuid) -> AppResult<Vec<BillingAuditEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, operation, amount_cents, details, created_at
            FROM billing_audit_log
            WHERE user_id = $1
            ORDER BY created_at DESC, id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::from)?;

        Ok(rows
            .iter()
            .map(|row| BillingAuditEntry {
                user_id: row.get("user_id"),
                operation: row.get("operation"),
                amount_cents: row.get("amount_cents"),
                details: row.get("details"),
                created_at: row.get("created_at"),
            })
            .collect())
    }
}
