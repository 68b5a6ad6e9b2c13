use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use crate::{
    adapters::persistence::{PostgresPersistence, ledger::tx_charge},
    app_error::{AppError, AppResult},
    application::use_cases::subscription_lifecycle::{
        CreateSubscriptionInput, SubscriptionEventProfile, SubscriptionProfile, SubscriptionRepo,
        TransitionInput, TransitionOutcome, append_note,
    },
    domain::entities::{subscription_status::SubscriptionStatus, subscription_type::UserTier},
};

fn row_to_profile(row: &sqlx::postgres::PgRow) -> SubscriptionProfile {
    SubscriptionProfile {
        id: row.get("id"),
        user_id: row.get("user_id"),
        subscription_type: row.get("subscription_type"),
        status: row.get("status"),
        start_date: row.get("start_date"),
        end_date: row.get("end_date"),
        duration_months: row.get("duration_months"),
        payment_amount_cents: row.get("payment_amount_cents"),
        currency: row.get("currency"),
        payment_method: row.get("payment_method"),
        promo_code: row.get("promo_code"),
        discount_amount_cents: row.get("discount_amount_cents"),
        auto_renewal: row.get("auto_renewal"),
        notes: row.get("notes"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_event(row: &sqlx::postgres::PgRow) -> SubscriptionEventProfile {
    SubscriptionEventProfile {
        id: row.get("id"),
        subscription_id: row.get("subscription_id"),
        event_type: row.get("event_type"),
        previous_status: row.get("previous_status"),
        new_status: row.get("new_status"),
        metadata: row.get("metadata"),
        created_at: row.get("created_at"),
    }
}

const SELECT_COLS: &str = r#"
    id, user_id, subscription_type, status, start_date, end_date, duration_months,
    payment_amount_cents, currency, payment_method, promo_code, discount_amount_cents,
    auto_renewal, notes, created_at, updated_at
"#;

const EVENT_COLS: &str =
    "id, subscription_id, event_type, previous_status, new_status, metadata, created_at";

/// Events written in one transaction share `NOW()`, so `clock_timestamp()`
/// keeps their insertion order visible.
async fn tx_insert_event(
    tx: &mut Transaction<'_, Postgres>,
    subscription_id: Uuid,
    event_type: &str,
    previous_status: Option<SubscriptionStatus>,
    new_status: Option<SubscriptionStatus>,
    metadata: &serde_json::Value,
) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO subscription_events (
            id, subscription_id, event_type, previous_status, new_status, metadata, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, clock_timestamp())
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(subscription_id)
    .bind(event_type)
    .bind(previous_status)
    .bind(new_status)
    .bind(metadata)
    .execute(&mut **tx)
    .await
    .map_err(AppError::from)?;
    Ok(())
}

/// Highest active subscription type wins; `free` when there is none.
const SYNC_TIER_SQL: &str = r#"
    UPDATE users
    SET subscription_tier = COALESCE(
            (SELECT subscription_type::text FROM subscriptions
             WHERE user_id = $1 AND status = 'active'
             ORDER BY subscription_type DESC
             LIMIT 1),
            'free'),
        updated_at = NOW()
    WHERE id = $1
    RETURNING subscription_tier
"#;

async fn tx_sync_tier(tx: &mut Transaction<'_, Postgres>, user_id: Uuid) -> AppResult<UserTier> {
    let label: Option<String> = sqlx::query_scalar(SYNC_TIER_SQL)
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(AppError::from)?;
    label
        .map(|l| UserTier::from_label(&l))
        .ok_or(AppError::NotFound)
}

async fn tx_retire_other_active(
    tx: &mut Transaction<'_, Postgres>,
    current: &SubscriptionProfile,
) -> AppResult<Vec<SubscriptionProfile>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM subscriptions WHERE user_id = $1 AND id <> $2 AND status = 'active' FOR UPDATE",
        SELECT_COLS
    ))
    .bind(current.user_id)
    .bind(current.id)
    .fetch_all(&mut **tx)
    .await
    .map_err(AppError::from)?;

    let note = format!("Replaced by subscription {}", current.id);
    let metadata = serde_json::json!({ "replaced_by": current.id });
    let mut retired = Vec::with_capacity(rows.len());

    for old in rows.iter().map(row_to_profile) {
        let row = sqlx::query(&format!(
            r#"
            UPDATE subscriptions
            SET status = 'cancelled', auto_renewal = FALSE, notes = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            SELECT_COLS
        ))
        .bind(old.id)
        .bind(append_note(old.notes.as_deref(), &note))
        .fetch_one(&mut **tx)
        .await
        .map_err(AppError::from)?;

        tx_insert_event(
            tx,
            old.id,
            "replaced",
            Some(SubscriptionStatus::Active),
            Some(SubscriptionStatus::Cancelled),
            &metadata,
        )
        .await?;
        retired.push(row_to_profile(&row));
    }

    Ok(retired)
}

async fn tx_lock_user(tx: &mut Transaction<'_, Postgres>, user_id: Uuid) -> AppResult<()> {
    sqlx::query("SELECT id FROM users WHERE id = $1 FOR UPDATE")
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(AppError::from)?
        .ok_or(AppError::NotFound)?;
    Ok(())
}

async fn tx_insert_pending(
    tx: &mut Transaction<'_, Postgres>,
    input: &CreateSubscriptionInput,
) -> AppResult<SubscriptionProfile> {
    let row = sqlx::query(&format!(
        r#"
        INSERT INTO subscriptions (
            id, user_id, subscription_type, status, start_date, end_date, duration_months,
            payment_amount_cents, currency, payment_method, promo_code, discount_amount_cents,
            auto_renewal, notes, created_at, updated_at
        )
        VALUES ($1, $2, $3, 'pending', $4, NULL, $5, $6, $7, $8, $9, $10, $11, NULL, NOW(), NOW())
        RETURNING {}
        "#,
        SELECT_COLS
    ))
    .bind(input.id)
    .bind(input.user_id)
    .bind(input.subscription_type)
    .bind(input.start_date)
    .bind(input.duration_months)
    .bind(input.payment_amount_cents)
    .bind(&input.currency)
    .bind(input.payment_method)
    .bind(&input.promo_code)
    .bind(input.discount_amount_cents)
    .bind(input.auto_renewal)
    .fetch_one(&mut **tx)
    .await
    .map_err(AppError::from)?;
    let sub = row_to_profile(&row);

    tx_insert_event(
        tx,
        sub.id,
        "created",
        None,
        Some(SubscriptionStatus::Pending),
        &serde_json::json!({ "payment_method": sub.payment_method }),
    )
    .await?;

    Ok(sub)
}

/// Guarded status change inside the caller's transaction. On `Stale` nothing
/// has been written and the caller should roll back.
async fn tx_apply_transition(
    tx: &mut Transaction<'_, Postgres>,
    input: &TransitionInput,
) -> AppResult<TransitionOutcome> {
    let user_id: Uuid = sqlx::query_scalar("SELECT user_id FROM subscriptions WHERE id = $1")
        .bind(input.subscription_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(AppError::from)?
        .ok_or(AppError::NotFound)?;

    // Account row first, then the subscription row. Every writer takes
    // the locks in this order.
    tx_lock_user(tx, user_id).await?;

    let row = sqlx::query(&format!(
        "SELECT {} FROM subscriptions WHERE id = $1 FOR UPDATE",
        SELECT_COLS
    ))
    .bind(input.subscription_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(AppError::from)?
    .ok_or(AppError::NotFound)?;
    let current = row_to_profile(&row);

    let end_matches = input
        .expected_end_date
        .is_none_or(|expected| current.end_date == Some(expected));
    if current.status != input.expected_status || !end_matches {
        return Ok(TransitionOutcome::Stale { current });
    }
    if !current.status.can_transition_to(input.new_status) {
        return Err(AppError::InvalidInput(format!(
            "Invalid transition {} -> {}",
            current.status, input.new_status
        )));
    }

    let receipt = match &input.charge {
        Some(charge) => Some(tx_charge(tx, charge).await?),
        None => None,
    };

    let retired = if input.retire_other_active {
        tx_retire_other_active(tx, &current).await?
    } else {
        Vec::new()
    };

    let notes = match &input.append_note {
        Some(note) => Some(append_note(current.notes.as_deref(), note)),
        None => current.notes.clone(),
    };

    let row = sqlx::query(&format!(
        r#"
        UPDATE subscriptions
        SET status = $2, start_date = $3, end_date = $4, auto_renewal = $5,
            notes = $6, updated_at = NOW()
        WHERE id = $1
        RETURNING {}
        "#,
        SELECT_COLS
    ))
    .bind(current.id)
    .bind(input.new_status)
    .bind(input.start_date.unwrap_or(current.start_date))
    .bind(input.end_date.or(current.end_date))
    .bind(input.auto_renewal.unwrap_or(current.auto_renewal))
    .bind(notes)
    .fetch_one(&mut **tx)
    .await
    .map_err(AppError::from)?;
    let subscription = row_to_profile(&row);

    tx_insert_event(
        tx,
        subscription.id,
        &input.event_type,
        Some(current.status),
        Some(subscription.status),
        &input.metadata,
    )
    .await?;
    tx_sync_tier(tx, user_id).await?;

    Ok(TransitionOutcome::Applied {
        subscription,
        receipt,
        retired,
    })
}

#[async_trait]
impl SubscriptionRepo for PostgresPersistence {
    async fn get_by_id(&self, id: Uuid) -> AppResult<Option<SubscriptionProfile>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM subscriptions WHERE id = $1",
            SELECT_COLS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(row.as_ref().map(row_to_profile))
    }

    async fn get_active_by_user(&self, user_id: Uuid) -> AppResult<Option<SubscriptionProfile>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM subscriptions WHERE user_id = $1 AND status = 'active' ORDER BY end_date DESC LIMIT 1",
            SELECT_COLS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(row.as_ref().map(row_to_profile))
    }

    async fn list_by_user(&self, user_id: Uuid) -> AppResult<Vec<SubscriptionProfile>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM subscriptions WHERE user_id = $1 ORDER BY created_at DESC",
            SELECT_COLS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(rows.iter().map(row_to_profile).collect())
    }

    async fn create_pending(
        &self,
        input: &CreateSubscriptionInput,
    ) -> AppResult<SubscriptionProfile> {
        let mut tx = self.pool.begin().await.map_err(AppError::from)?;
        let sub = tx_insert_pending(&mut tx, input).await?;
        tx.commit().await.map_err(AppError::from)?;
        Ok(sub)
    }

    async fn apply_transition(&self, input: &TransitionInput) -> AppResult<TransitionOutcome> {
        let mut tx = self.pool.begin().await.map_err(AppError::from)?;
        let outcome = tx_apply_transition(&mut tx, input).await?;
        match outcome {
            TransitionOutcome::Applied { .. } => tx.commit().await.map_err(AppError::from)?,
            TransitionOutcome::Stale { .. } => tx.rollback().await.map_err(AppError::from)?,
        }
        Ok(outcome)
    }

    async fn create_and_transition(
        &self,
        input: &CreateSubscriptionInput,
        activation: &TransitionInput,
    ) -> AppResult<TransitionOutcome> {
        let mut tx = self.pool.begin().await.map_err(AppError::from)?;
        // Account lock precedes the insert's foreign-key share lock.
        tx_lock_user(&mut tx, input.user_id).await?;
        tx_insert_pending(&mut tx, input).await?;
        let outcome = tx_apply_transition(&mut tx, activation).await?;
        match outcome {
            TransitionOutcome::Applied { .. } => tx.commit().await.map_err(AppError::from)?,
            TransitionOutcome::Stale { .. } => tx.rollback().await.map_err(AppError::from)?,
        }
        Ok(outcome)
    }

    async fn list_due(
        &self,
        now: NaiveDateTime,
        auto_renewal: bool,
    ) -> AppResult<Vec<SubscriptionProfile>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM subscriptions
            WHERE status = 'active' AND end_date <= $1 AND auto_renewal = $2
            ORDER BY end_date
            "#,
            SELECT_COLS
        ))
        .bind(now)
        .bind(auto_renewal)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(rows.iter().map(row_to_profile).collect())
    }

    async fn list_expiring(
        &self,
        now: NaiveDateTime,
        until: NaiveDateTime,
    ) -> AppResult<Vec<SubscriptionProfile>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM subscriptions
            WHERE status = 'active' AND end_date > $1 AND end_date <= $2
            ORDER BY end_date
            "#,
            SELECT_COLS
        ))
        .bind(now)
        .bind(until)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(rows.iter().map(row_to_profile).collect())
    }

    async fn list_active_auto_renewing(&self) -> AppResult<Vec<SubscriptionProfile>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM subscriptions WHERE status = 'active' AND auto_renewal ORDER BY end_date",
            SELECT_COLS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(rows.iter().map(row_to_profile).collect())
    }

    async fn list_events(&self, subscription_id: Uuid) -> AppResult<Vec<SubscriptionEventProfile>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM subscription_events WHERE subscription_id = $1 ORDER BY created_at, id",
            EVENT_COLS
        ))
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(rows.iter().map(row_to_event).collect())
    }

    async fn sync_tier(&self, user_id: Uuid) -> AppResult<UserTier> {
        let mut tx = self.pool.begin().await.map_err(AppError::from)?;
        let tier = tx_sync_tier(&mut tx, user_id).await?;
        tx.commit().await.map_err(AppError::from)?;
        Ok(tier)
    }
}
