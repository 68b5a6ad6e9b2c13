use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    app_error::{AppError, AppResult},
    domain::entities::{
        payment::{PaymentStatus, PaymentType},
        payment_method::PaymentMethod,
        subscription_type::UserTier,
    },
};

// ============================================================================
// Profile Types
// ============================================================================

/// Append-only ledger entry for a subscription charge
#[derive(Debug, Clone, Serialize)]
pub struct PaymentRecordProfile {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub user_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub payment_method: PaymentMethod,
    pub payment_type: PaymentType,
    pub status: PaymentStatus,
    pub external_reference: Option<String>,
    pub created_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Receipt {
    pub payment: PaymentRecordProfile,
    /// Balance after the charge. Unchanged for non-balance methods.
    pub balance_after_cents: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserAccount {
    pub id: Uuid,
    pub balance_cents: i64,
    pub subscription_tier: UserTier,
}

/// One line of the billing audit log, written with every charge
#[derive(Debug, Clone, Serialize)]
pub struct BillingAuditEntry {
    pub user_id: Uuid,
    pub operation: String,
    pub amount_cents: i64,
    pub details: serde_json::Value,
    pub created_at: Option<NaiveDateTime>,
}

// ============================================================================
// Input Types
// ============================================================================

/// A validated charge, ready to be applied inside a persistence transaction.
#[derive(Debug, Clone)]
pub struct ChargeInput {
    pub user_id: Uuid,
    pub subscription_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub payment_method: PaymentMethod,
    pub payment_type: PaymentType,
    pub external_reference: Option<String>,
}

impl ChargeInput {
    /// Audit operation name recorded alongside the ledger entry
    pub fn audit_operation(&self) -> String {
        format!("subscription_charge.{}", self.payment_type.as_ref())
    }

    pub fn audit_details(&self, payment_id: Uuid, balance_after_cents: i64) -> serde_json::Value {
        serde_json::json!({
            "payment_id": payment_id,
            "subscription_id": self.subscription_id,
            "payment_method": self.payment_method.as_ref(),
            "payment_type": self.payment_type.as_ref(),
            "currency": self.currency,
            "external_reference": self.external_reference,
            "balance_after_cents": balance_after_cents,
        })
    }
}

// ============================================================================
// Repository Traits
// ============================================================================

#[async_trait]
pub trait LedgerRepo: Send + Sync {
    /// Apply one charge in its own transaction.
    ///
    /// Balance charges fail with `InsufficientBalance` and no mutation when the
    /// balance does not cover the amount.
    async fn charge(&self, input: &ChargeInput) -> AppResult<Receipt>;
    async fn list_by_user(&self, user_id: Uuid) -> AppResult<Vec<PaymentRecordProfile>>;
    async fn list_by_subscription(
        &self,
        subscription_id: Uuid,
    ) -> AppResult<Vec<PaymentRecordProfile>>;
    /// Newest first
    async fn list_audit(&self, user_id: Uuid) -> AppResult<Vec<BillingAuditEntry>>;
}

#[async_trait]
pub trait UserAccountRepo: Send + Sync {
    async fn get_account(&self, user_id: Uuid) -> AppResult<Option<UserAccount>>;
}

// ============================================================================
// Use Cases
// ============================================================================

#[derive(Clone)]
pub struct LedgerGateway {
    ledger_repo: Arc<dyn LedgerRepo>,
    account_repo: Arc<dyn UserAccountRepo>,
}

impl LedgerGateway {
    pub fn new(ledger_repo: Arc<dyn LedgerRepo>, account_repo: Arc<dyn UserAccountRepo>) -> Self {
        Self {
            ledger_repo,
            account_repo,
        }
    }

    /// Validate a charge and build the input a persistence transaction applies.
    pub fn build_charge(
        &self,
        user_id: Uuid,
        amount_cents: i64,
        currency: &str,
        payment_method: PaymentMethod,
        subscription_id: Uuid,
        payment_type: PaymentType,
    ) -> AppResult<ChargeInput> {
        if amount_cents < 0 {
            return Err(AppError::InvalidInput(
                "Charge amount cannot be negative".into(),
            ));
        }
        Ok(ChargeInput {
            user_id,
            subscription_id,
            amount_cents,
            currency: currency.to_string(),
            payment_method,
            payment_type,
            external_reference: None,
        })
    }

    /// Charge a user for a subscription outside of a lifecycle transition.
    pub async fn charge_for_subscription(
        &self,
        user_id: Uuid,
        amount_cents: i64,
        currency: &str,
        payment_method: PaymentMethod,
        subscription_id: Uuid,
        payment_type: PaymentType,
    ) -> AppResult<Receipt> {
        let input = self.build_charge(
            user_id,
            amount_cents,
            currency,
            payment_method,
            subscription_id,
            payment_type,
        )?;
        let receipt = self.ledger_repo.charge(&input).await?;
        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            amount_cents,
            payment_method = %payment_method,
            payment_type = %payment_type,
            "Subscription charge recorded"
        );
        Ok(receipt)
    }

    pub async fn get_balance(&self, user_id: Uuid) -> AppResult<i64> {
        self.account_repo
            .get_account(user_id)
            .await?
            .map(|a| a.balance_cents)
            .ok_or(AppError::NotFound)
    }

    pub async fn get_account(&self, user_id: Uuid) -> AppResult<UserAccount> {
        self.account_repo
            .get_account(user_id)
            .await?
            .ok_or(AppError::NotFound)
    }

    pub async fn list_payments(&self, user_id: Uuid) -> AppResult<Vec<PaymentRecordProfile>> {
        self.ledger_repo.list_by_user(user_id).await
    }

    pub async fn list_payments_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> AppResult<Vec<PaymentRecordProfile>> {
        self.ledger_repo.list_by_subscription(subscription_id).await
    }

    pub async fn list_audit_entries(&self, user_id: Uuid) -> AppResult<Vec<BillingAuditEntry>> {
        self.get_account(user_id).await?;
        self.ledger_repo.list_audit(user_id).await
    }
}
