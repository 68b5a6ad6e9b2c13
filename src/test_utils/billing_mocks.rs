//! In-memory implementation of every billing repository trait and the
//! notification sink.
//!
//! All state lives behind one mutex, so a transition applied here is atomic in
//! the same way the Postgres transaction is.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

use crate::{
    app_error::{AppError, AppResult},
    application::{
        ports::notification_sink::{IdempotencyKey, NotificationRequest, NotificationSink},
        use_cases::{
            ledger::{
                BillingAuditEntry, ChargeInput, LedgerRepo, PaymentRecordProfile, Receipt,
                UserAccount, UserAccountRepo,
            },
            plan_registry::{SubscriptionPlanProfile, SubscriptionPlanRepo, UpsertPlanInput},
            pricing::{CreatePromoInput, PromoCodeProfile, PromoCodeRepo},
            subscription_lifecycle::{
                CreateSubscriptionInput, SubscriptionEventProfile, SubscriptionProfile,
                SubscriptionRepo, TransitionInput, TransitionOutcome, append_note,
            },
        },
    },
    domain::entities::{
        notification_type::NotificationType,
        payment::PaymentStatus,
        subscription_status::SubscriptionStatus,
        subscription_type::{SubscriptionType, UserTier},
    },
};

fn now() -> NaiveDateTime {
    chrono::Utc::now().naive_utc()
}

// ============================================================================
// Shared State
// ============================================================================

#[derive(Default, Clone)]
struct BillingState {
    plans: HashMap<SubscriptionType, SubscriptionPlanProfile>,
    promos: HashMap<String, PromoCodeProfile>,
    accounts: HashMap<Uuid, UserAccount>,
    subscriptions: Vec<SubscriptionProfile>,
    payments: Vec<PaymentRecordProfile>,
    events: Vec<SubscriptionEventProfile>,
    audit: Vec<BillingAuditEntry>,
    notifications: Vec<NotificationRequest>,
    charges_failing: bool,
}

impl BillingState {
    fn charge(&mut self, input: &ChargeInput) -> AppResult<Receipt> {
        if self.charges_failing {
            return Err(AppError::Database("payment_records unavailable".into()));
        }
        let account = self
            .accounts
            .get_mut(&input.user_id)
            .ok_or(AppError::NotFound)?;
        if input.payment_method.is_balance() {
            if account.balance_cents < input.amount_cents {
                return Err(AppError::InsufficientBalance {
                    required_cents: input.amount_cents,
                    available_cents: account.balance_cents,
                });
            }
            account.balance_cents -= input.amount_cents;
        }
        let balance_after_cents = account.balance_cents;

        let payment = PaymentRecordProfile {
            id: Uuid::new_v4(),
            subscription_id: input.subscription_id,
            user_id: input.user_id,
            amount_cents: input.amount_cents,
            currency: input.currency.clone(),
            payment_method: input.payment_method,
            payment_type: input.payment_type,
            status: PaymentStatus::Completed,
            external_reference: input.external_reference.clone(),
            created_at: Some(now()),
        };
        self.payments.push(payment.clone());
        self.audit.push(BillingAuditEntry {
            user_id: input.user_id,
            operation: input.audit_operation(),
            amount_cents: input.amount_cents,
            details: input.audit_details(payment.id, balance_after_cents),
            created_at: Some(now()),
        });

        Ok(Receipt {
            payment,
            balance_after_cents,
        })
    }

    fn recompute_tier(&mut self, user_id: Uuid) -> Option<UserTier> {
        let active = self
            .subscriptions
            .iter()
            .filter(|s| s.user_id == user_id && s.status.is_active())
            .map(|s| s.subscription_type)
            .max();
        let tier = UserTier::from_active(active);
        let account = self.accounts.get_mut(&user_id)?;
        account.subscription_tier = tier;
        Some(tier)
    }

    fn insert_pending(&mut self, input: &CreateSubscriptionInput) -> AppResult<SubscriptionProfile> {
        if !self.accounts.contains_key(&input.user_id) {
            return Err(AppError::InvalidInput("Unknown user".into()));
        }
        let sub = SubscriptionProfile {
            id: input.id,
            user_id: input.user_id,
            subscription_type: input.subscription_type,
            status: SubscriptionStatus::Pending,
            start_date: input.start_date,
            end_date: None,
            duration_months: input.duration_months,
            payment_amount_cents: input.payment_amount_cents,
            currency: input.currency.clone(),
            payment_method: input.payment_method,
            promo_code: input.promo_code.clone(),
            discount_amount_cents: input.discount_amount_cents,
            auto_renewal: input.auto_renewal,
            notes: None,
            created_at: Some(now()),
            updated_at: Some(now()),
        };
        self.subscriptions.push(sub.clone());
        self.push_event(
            sub.id,
            "created",
            None,
            Some(SubscriptionStatus::Pending),
            serde_json::json!({ "payment_method": sub.payment_method }),
        );
        Ok(sub)
    }

    fn transition(&mut self, input: &TransitionInput) -> AppResult<TransitionOutcome> {
        let idx = self
            .subscriptions
            .iter()
            .position(|s| s.id == input.subscription_id)
            .ok_or(AppError::NotFound)?;
        let current = self.subscriptions[idx].clone();

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
            Some(charge) => Some(self.charge(charge)?),
            None => None,
        };

        let mut retired = Vec::new();
        if input.retire_other_active {
            let note = format!("Replaced by subscription {}", current.id);
            for other in self.subscriptions.iter_mut().filter(|s| {
                s.user_id == current.user_id && s.id != current.id && s.status.is_active()
            }) {
                other.status = SubscriptionStatus::Cancelled;
                other.auto_renewal = false;
                other.notes = Some(append_note(other.notes.as_deref(), &note));
                other.updated_at = Some(now());
                retired.push(other.clone());
            }
            for old in &retired {
                self.push_event(
                    old.id,
                    "replaced",
                    Some(SubscriptionStatus::Active),
                    Some(SubscriptionStatus::Cancelled),
                    serde_json::json!({ "replaced_by": current.id }),
                );
            }
        }

        let sub = &mut self.subscriptions[idx];
        sub.status = input.new_status;
        if let Some(start_date) = input.start_date {
            sub.start_date = start_date;
        }
        if let Some(end_date) = input.end_date {
            sub.end_date = Some(end_date);
        }
        if let Some(auto_renewal) = input.auto_renewal {
            sub.auto_renewal = auto_renewal;
        }
        if let Some(note) = &input.append_note {
            sub.notes = Some(append_note(sub.notes.as_deref(), note));
        }
        sub.updated_at = Some(now());
        let subscription = sub.clone();

        self.push_event(
            subscription.id,
            &input.event_type,
            Some(current.status),
            Some(subscription.status),
            input.metadata.clone(),
        );
        self.recompute_tier(subscription.user_id);

        Ok(TransitionOutcome::Applied {
            subscription,
            receipt,
            retired,
        })
    }

    fn push_event(
        &mut self,
        subscription_id: Uuid,
        event_type: &str,
        previous_status: Option<SubscriptionStatus>,
        new_status: Option<SubscriptionStatus>,
        metadata: serde_json::Value,
    ) {
        self.events.push(SubscriptionEventProfile {
            id: Uuid::new_v4(),
            subscription_id,
            event_type: event_type.to_string(),
            previous_status,
            new_status,
            metadata,
            created_at: Some(now()),
        });
    }
}

// ============================================================================
// InMemoryBillingStore
// ============================================================================

#[derive(Default)]
pub struct InMemoryBillingStore {
    state: Mutex<BillingState>,
    notifications_failing: AtomicBool,
    listing_failing: AtomicBool,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plans(self, plans: Vec<SubscriptionPlanProfile>) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            for plan in plans {
                state.plans.insert(plan.subscription_type, plan);
            }
        }
        self
    }

    pub fn with_promo(self, promo: PromoCodeProfile) -> Self {
        self.state
            .lock()
            .unwrap()
            .promos
            .insert(promo.code.clone(), promo);
        self
    }

    pub fn with_user(self, user_id: Uuid, balance_cents: i64) -> Self {
        self.state.lock().unwrap().accounts.insert(
            user_id,
            UserAccount {
                id: user_id,
                balance_cents,
                subscription_tier: UserTier::Free,
            },
        );
        self
    }

    pub fn with_subscription(self, sub: SubscriptionProfile) -> Self {
        self.insert_subscription(sub);
        self
    }

    /// Insert a subscription row as-is and refresh its owner's tier.
    pub fn insert_subscription(&self, sub: SubscriptionProfile) {
        let mut state = self.state.lock().unwrap();
        let user_id = sub.user_id;
        state.subscriptions.push(sub);
        state.recompute_tier(user_id);
    }

    pub fn set_notifications_failing(&self, failing: bool) {
        self.notifications_failing.store(failing, Ordering::SeqCst);
    }

    /// Make every charge fail with a database error
    pub fn set_charges_failing(&self, failing: bool) {
        self.state.lock().unwrap().charges_failing = failing;
    }

    pub fn set_listing_failing(&self, failing: bool) {
        self.listing_failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_tier(&self, user_id: Uuid, tier: UserTier) {
        if let Some(account) = self.state.lock().unwrap().accounts.get_mut(&user_id) {
            account.subscription_tier = tier;
        }
    }

    pub fn balance_of(&self, user_id: Uuid) -> i64 {
        self.state
            .lock()
            .unwrap()
            .accounts
            .get(&user_id)
            .map(|a| a.balance_cents)
            .unwrap_or_default()
    }

    pub fn tier_of(&self, user_id: Uuid) -> UserTier {
        self.state
            .lock()
            .unwrap()
            .accounts
            .get(&user_id)
            .map(|a| a.subscription_tier)
            .unwrap_or_default()
    }

    pub fn subscription(&self, id: Uuid) -> Option<SubscriptionProfile> {
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }

    pub fn subscriptions_of(&self, user_id: Uuid) -> Vec<SubscriptionProfile> {
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .iter()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn payments_for(&self, subscription_id: Uuid) -> Vec<PaymentRecordProfile> {
        self.state
            .lock()
            .unwrap()
            .payments
            .iter()
            .filter(|p| p.subscription_id == subscription_id)
            .cloned()
            .collect()
    }

    pub fn payments_for_user(&self, user_id: Uuid) -> Vec<PaymentRecordProfile> {
        self.state
            .lock()
            .unwrap()
            .payments
            .iter()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn audit_entries(&self, user_id: Uuid) -> Vec<BillingAuditEntry> {
        self.state
            .lock()
            .unwrap()
            .audit
            .iter()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn notifications(&self) -> Vec<NotificationRequest> {
        self.state.lock().unwrap().notifications.clone()
    }

    pub fn notification_count(&self, notification_type: NotificationType) -> usize {
        self.state
            .lock()
            .unwrap()
            .notifications
            .iter()
            .filter(|n| n.notification_type == notification_type)
            .count()
    }

    /// Number of events of `event_type` recorded for a subscription
    pub fn events_of(&self, subscription_id: Uuid, event_type: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|e| e.subscription_id == subscription_id && e.event_type == event_type)
            .count()
    }

    fn check_listing(&self) -> AppResult<()> {
        if self.listing_failing.load(Ordering::SeqCst) {
            return Err(AppError::Database("connection reset".into()));
        }
        Ok(())
    }
}

// ============================================================================
// Plans
// ============================================================================

#[async_trait]
impl SubscriptionPlanRepo for InMemoryBillingStore {
    async fn get_by_type(
        &self,
        subscription_type: SubscriptionType,
    ) -> AppResult<Option<SubscriptionPlanProfile>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .plans
            .get(&subscription_type)
            .cloned())
    }

    async fn list(&self, include_inactive: bool) -> AppResult<Vec<SubscriptionPlanProfile>> {
        let mut plans: Vec<_> = self
            .state
            .lock()
            .unwrap()
            .plans
            .values()
            .filter(|p| include_inactive || p.is_active)
            .cloned()
            .collect();
        plans.sort_by_key(|p| p.subscription_type);
        Ok(plans)
    }

    async fn upsert(
        &self,
        subscription_type: SubscriptionType,
        input: &UpsertPlanInput,
    ) -> AppResult<SubscriptionPlanProfile> {
        let mut state = self.state.lock().unwrap();
        let existing = state.plans.get(&subscription_type);
        let plan = SubscriptionPlanProfile {
            subscription_type,
            name: input.name.clone(),
            monthly_price_cents: input.monthly_price_cents,
            quarterly_price_cents: input.quarterly_price_cents,
            yearly_price_cents: input.yearly_price_cents,
            currency: input.currency.clone(),
            features: input.features.clone(),
            is_active: existing.is_none_or(|p| p.is_active),
            created_at: existing.and_then(|p| p.created_at).or(Some(now())),
            updated_at: Some(now()),
        };
        state.plans.insert(subscription_type, plan.clone());
        Ok(plan)
    }

    async fn set_active(
        &self,
        subscription_type: SubscriptionType,
        is_active: bool,
    ) -> AppResult<SubscriptionPlanProfile> {
        let mut state = self.state.lock().unwrap();
        let plan = state
            .plans
            .get_mut(&subscription_type)
            .ok_or(AppError::NotFound)?;
        plan.is_active = is_active;
        plan.updated_at = Some(now());
        Ok(plan.clone())
    }
}

// ============================================================================
// Promo Codes
// ============================================================================

#[async_trait]
impl PromoCodeRepo for InMemoryBillingStore {
    async fn get_by_code(&self, code: &str) -> AppResult<Option<PromoCodeProfile>> {
        Ok(self.state.lock().unwrap().promos.get(code).cloned())
    }

    async fn create(&self, input: &CreatePromoInput) -> AppResult<PromoCodeProfile> {
        let mut state = self.state.lock().unwrap();
        if state.promos.contains_key(&input.code) {
            return Err(AppError::InvalidInput(format!(
                "Promo code {} already exists",
                input.code
            )));
        }
        let promo = PromoCodeProfile {
            code: input.code.clone(),
            discount_percent: input.discount_percent,
            allowed_types: input.allowed_types.clone(),
            is_active: true,
            valid_until: input.valid_until,
            created_at: Some(now()),
        };
        state.promos.insert(promo.code.clone(), promo.clone());
        Ok(promo)
    }

    async fn deactivate(&self, code: &str) -> AppResult<()> {
        let mut state = self.state.lock().unwrap();
        let promo = state.promos.get_mut(code).ok_or(AppError::NotFound)?;
        promo.is_active = false;
        Ok(())
    }
}

// ============================================================================
// Ledger & Accounts
// ============================================================================

#[async_trait]
impl LedgerRepo for InMemoryBillingStore {
    async fn charge(&self, input: &ChargeInput) -> AppResult<Receipt> {
        self.state.lock().unwrap().charge(input)
    }

    async fn list_by_user(&self, user_id: Uuid) -> AppResult<Vec<PaymentRecordProfile>> {
        Ok(self.payments_for_user(user_id))
    }

    async fn list_by_subscription(
        &self,
        subscription_id: Uuid,
    ) -> AppResult<Vec<PaymentRecordProfile>> {
        Ok(self.payments_for(subscription_id))
    }

    async fn list_audit(&self, user_id: Uuid) -> AppResult<Vec<BillingAuditEntry>> {
        let mut entries = self.audit_entries(user_id);
        entries.reverse();
        Ok(entries)
    }
}

#[async_trait]
impl UserAccountRepo for InMemoryBillingStore {
    async fn get_account(&self, user_id: Uuid) -> AppResult<Option<UserAccount>> {
        Ok(self.state.lock().unwrap().accounts.get(&user_id).cloned())
    }
}

// ============================================================================
// Subscriptions
// ============================================================================

#[async_trait]
impl SubscriptionRepo for InMemoryBillingStore {
    async fn get_by_id(&self, id: Uuid) -> AppResult<Option<SubscriptionProfile>> {
        Ok(self.subscription(id))
    }

    async fn get_active_by_user(&self, user_id: Uuid) -> AppResult<Option<SubscriptionProfile>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .subscriptions
            .iter()
            .find(|s| s.user_id == user_id && s.status.is_active())
            .cloned())
    }

    async fn list_by_user(&self, user_id: Uuid) -> AppResult<Vec<SubscriptionProfile>> {
        Ok(self.subscriptions_of(user_id))
    }

    async fn create_pending(
        &self,
        input: &CreateSubscriptionInput,
    ) -> AppResult<SubscriptionProfile> {
        self.state.lock().unwrap().insert_pending(input)
    }

    async fn apply_transition(&self, input: &TransitionInput) -> AppResult<TransitionOutcome> {
        self.state.lock().unwrap().transition(input)
    }

    async fn create_and_transition(
        &self,
        input: &CreateSubscriptionInput,
        activation: &TransitionInput,
    ) -> AppResult<TransitionOutcome> {
        let mut state = self.state.lock().unwrap();
        // Work on a copy so a failure part-way leaves the store untouched.
        let mut draft = state.clone();
        draft.insert_pending(input)?;
        let outcome = draft.transition(activation)?;
        if matches!(outcome, TransitionOutcome::Applied { .. }) {
            *state = draft;
        }
        Ok(outcome)
    }

    async fn list_due(
        &self,
        now: NaiveDateTime,
        auto_renewal: bool,
    ) -> AppResult<Vec<SubscriptionProfile>> {
        self.check_listing()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .subscriptions
            .iter()
            .filter(|s| {
                s.status.is_active()
                    && s.auto_renewal == auto_renewal
                    && s.end_date.is_some_and(|end| end <= now)
            })
            .cloned()
            .collect())
    }

    async fn list_expiring(
        &self,
        now: NaiveDateTime,
        until: NaiveDateTime,
    ) -> AppResult<Vec<SubscriptionProfile>> {
        self.check_listing()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .subscriptions
            .iter()
            .filter(|s| {
                s.status.is_active() && s.end_date.is_some_and(|end| end > now && end <= until)
            })
            .cloned()
            .collect())
    }

    async fn list_active_auto_renewing(&self) -> AppResult<Vec<SubscriptionProfile>> {
        self.check_listing()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .subscriptions
            .iter()
            .filter(|s| s.status.is_active() && s.auto_renewal)
            .cloned()
            .collect())
    }

    async fn list_events(&self, subscription_id: Uuid) -> AppResult<Vec<SubscriptionEventProfile>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|e| e.subscription_id == subscription_id)
            .cloned()
            .collect())
    }

    async fn sync_tier(&self, user_id: Uuid) -> AppResult<UserTier> {
        self.state
            .lock()
            .unwrap()
            .recompute_tier(user_id)
            .ok_or(AppError::NotFound)
    }
}

// ============================================================================
// Notifications
// ============================================================================

#[async_trait]
impl NotificationSink for InMemoryBillingStore {
    async fn record(&self, request: &NotificationRequest) -> AppResult<bool> {
        if self.notifications_failing.load(Ordering::SeqCst) {
            return Err(AppError::Database("notifications table unavailable".into()));
        }
        let mut state = self.state.lock().unwrap();
        if let Some(key) = &request.idempotency_key {
            let seen = state
                .notifications
                .iter()
                .any(|n| n.idempotency_key.as_ref() == Some(key));
            if seen {
                return Ok(false);
            }
        }
        state.notifications.push(request.clone());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_plan, create_test_subscription, test_datetime};

    #[tokio::test]
    async fn notification_keys_deduplicate() {
        let store = InMemoryBillingStore::new();
        let sub_id = Uuid::new_v4();
        let key = IdempotencyKey::once(sub_id, NotificationType::SubscriptionExpired);
        let request = NotificationRequest::new(
            Uuid::new_v4(),
            NotificationType::SubscriptionExpired,
            "expired",
            serde_json::json!({}),
        )
        .with_key(key.clone());

        assert!(store.record(&request).await.unwrap());
        assert!(!store.record(&request).await.unwrap());
        assert_eq!(store.notifications().len(), 1);
    }

    #[tokio::test]
    async fn stale_transition_changes_nothing() {
        let user_id = Uuid::new_v4();
        let sub = create_test_subscription(user_id, SubscriptionType::Vip, test_datetime(), |_| {});
        let store = InMemoryBillingStore::new()
            .with_plans(vec![create_test_plan(SubscriptionType::Vip, |_| {})])
            .with_user(user_id, 0)
            .with_subscription(sub.clone());

        let outcome = store
            .apply_transition(&TransitionInput::new(
                sub.id,
                SubscriptionStatus::Pending,
                SubscriptionStatus::Active,
                "activated",
            ))
            .await
            .unwrap();
        assert!(matches!(outcome, TransitionOutcome::Stale { .. }));
        assert_eq!(store.events_of(sub.id, "activated"), 0);
        assert_eq!(store.tier_of(user_id), UserTier::Vip);
    }
}
