use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    app_error::{AppError, AppResult},
    application::{
        ports::notification_sink::{IdempotencyKey, NotificationRequest, NotificationSink},
        use_cases::{
            ledger::{ChargeInput, LedgerGateway, PaymentRecordProfile, Receipt},
            plan_registry::PlanRegistryUseCases,
            pricing::{PricingUseCases, parse_duration},
        },
    },
    domain::entities::{
        billing_duration::BillingDuration,
        notification_type::NotificationType,
        payment::PaymentType,
        payment_method::PaymentMethod,
        subscription_status::SubscriptionStatus,
        subscription_type::{SubscriptionType, UserTier},
    },
};

// ============================================================================
// Profile Types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionProfile {
    pub id: Uuid,
    pub user_id: Uuid,
    pub subscription_type: SubscriptionType,
    pub status: SubscriptionStatus,
    pub start_date: NaiveDateTime,
    /// Unset while pending
    pub end_date: Option<NaiveDateTime>,
    pub duration_months: i32,
    pub payment_amount_cents: i64,
    pub currency: String,
    pub payment_method: PaymentMethod,
    pub promo_code: Option<String>,
    pub discount_amount_cents: Option<i64>,
    pub auto_renewal: bool,
    pub notes: Option<String>,
    pub created_at: Option<NaiveDateTime>,
    pub updated_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionEventProfile {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub event_type: String,
    pub previous_status: Option<SubscriptionStatus>,
    pub new_status: Option<SubscriptionStatus>,
    pub metadata: serde_json::Value,
    pub created_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CurrentSubscriptionStatus {
    pub has_subscription: bool,
    pub plan: Option<SubscriptionType>,
    pub tier: UserTier,
    pub expires_at: Option<NaiveDateTime>,
    pub days_remaining: i64,
    pub auto_renewal: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionHistory {
    pub subscriptions: Vec<SubscriptionProfile>,
    pub payments: Vec<PaymentRecordProfile>,
}

/// What happened to a subscription handed to the renewal step
#[derive(Debug, Clone)]
pub enum RenewalOutcome {
    Renewed(SubscriptionProfile),
    /// Balance did not cover the renewal; the subscription was expired
    Failed(SubscriptionProfile),
    /// Status or end date changed since it was observed; nothing was done
    Skipped,
}

// ============================================================================
// Input Types
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub subscription_type: SubscriptionType,
    pub duration_months: i32,
    pub payment_method: PaymentMethod,
    pub promo_code: Option<String>,
    #[serde(default)]
    pub auto_renewal: bool,
}

/// Row written for a freshly created (pending) subscription.
///
/// The id is chosen up front so a charge can reference the row in the same
/// transaction that inserts it.
#[derive(Debug, Clone)]
pub struct CreateSubscriptionInput {
    pub id: Uuid,
    pub user_id: Uuid,
    pub subscription_type: SubscriptionType,
    pub start_date: NaiveDateTime,
    pub duration_months: i32,
    pub payment_amount_cents: i64,
    pub currency: String,
    pub payment_method: PaymentMethod,
    pub promo_code: Option<String>,
    pub discount_amount_cents: Option<i64>,
    pub auto_renewal: bool,
}

/// A guarded status change applied atomically by the repository.
///
/// The repository locks the owner's account row and then the subscription row,
/// re-checks `expected_status` (and `expected_end_date` when set), applies the
/// optional charge, retires the owner's other active subscriptions if asked,
/// writes the event and recomputes the owner's tier before committing.
/// `None` fields keep their stored value.
#[derive(Debug, Clone)]
pub struct TransitionInput {
    pub subscription_id: Uuid,
    pub expected_status: SubscriptionStatus,
    pub expected_end_date: Option<NaiveDateTime>,
    pub new_status: SubscriptionStatus,
    pub start_date: Option<NaiveDateTime>,
    pub end_date: Option<NaiveDateTime>,
    pub auto_renewal: Option<bool>,
    pub append_note: Option<String>,
    pub charge: Option<ChargeInput>,
    pub retire_other_active: bool,
    pub event_type: String,
    pub metadata: serde_json::Value,
}

impl TransitionInput {
    pub fn new(
        subscription_id: Uuid,
        expected_status: SubscriptionStatus,
        new_status: SubscriptionStatus,
        event_type: &str,
    ) -> Self {
        Self {
            subscription_id,
            expected_status,
            expected_end_date: None,
            new_status,
            start_date: None,
            end_date: None,
            auto_renewal: None,
            append_note: None,
            charge: None,
            retire_other_active: false,
            event_type: event_type.to_string(),
            metadata: serde_json::json!({}),
        }
    }
}

#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    Applied {
        subscription: SubscriptionProfile,
        receipt: Option<Receipt>,
        retired: Vec<SubscriptionProfile>,
    },
    /// The guard did not match; `current` is the row as found under lock
    Stale { current: SubscriptionProfile },
}

/// Append a note line to existing notes
pub fn append_note(existing: Option<&str>, note: &str) -> String {
    match existing.map(str::trim).filter(|n| !n.is_empty()) {
        Some(existing) => format!("{}\n{}", existing, note),
        None => note.to_string(),
    }
}

// ============================================================================
// Repository Trait
// ============================================================================

#[async_trait]
pub trait SubscriptionRepo: Send + Sync {
    async fn get_by_id(&self, id: Uuid) -> AppResult<Option<SubscriptionProfile>>;
    async fn get_active_by_user(&self, user_id: Uuid) -> AppResult<Option<SubscriptionProfile>>;
    async fn list_by_user(&self, user_id: Uuid) -> AppResult<Vec<SubscriptionProfile>>;
    /// Insert a `pending` row (and its `created` event)
    async fn create_pending(&self, input: &CreateSubscriptionInput)
    -> AppResult<SubscriptionProfile>;
    async fn apply_transition(&self, input: &TransitionInput) -> AppResult<TransitionOutcome>;
    /// Insert a pending row and apply `activation` to it in one transaction.
    /// Nothing is persisted when any step fails.
    async fn create_and_transition(
        &self,
        input: &CreateSubscriptionInput,
        activation: &TransitionInput,
    ) -> AppResult<TransitionOutcome>;
    /// Active subscriptions with `end_date <= now` and the given auto-renewal flag
    async fn list_due(&self, now: NaiveDateTime, auto_renewal: bool)
    -> AppResult<Vec<SubscriptionProfile>>;
    /// Active subscriptions with `now < end_date <= until`
    async fn list_expiring(
        &self,
        now: NaiveDateTime,
        until: NaiveDateTime,
    ) -> AppResult<Vec<SubscriptionProfile>>;
    async fn list_active_auto_renewing(&self) -> AppResult<Vec<SubscriptionProfile>>;
    async fn list_events(&self, subscription_id: Uuid) -> AppResult<Vec<SubscriptionEventProfile>>;
    /// Recompute the owner's tier label from their active subscriptions
    async fn sync_tier(&self, user_id: Uuid) -> AppResult<UserTier>;
}

// ============================================================================
// Use Cases
// ============================================================================

#[derive(Clone)]
pub struct SubscriptionLifecycleUseCases {
    subscription_repo: Arc<dyn SubscriptionRepo>,
    plans: PlanRegistryUseCases,
    pricing: PricingUseCases,
    ledger: LedgerGateway,
    notifier: Arc<dyn NotificationSink>,
}

impl SubscriptionLifecycleUseCases {
    pub fn new(
        subscription_repo: Arc<dyn SubscriptionRepo>,
        plans: PlanRegistryUseCases,
        pricing: PricingUseCases,
        ledger: LedgerGateway,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            subscription_repo,
            plans,
            pricing,
            ledger,
            notifier,
        }
    }

    fn now() -> NaiveDateTime {
        chrono::Utc::now().naive_utc()
    }

    /// Record a notification request. Failures never undo a committed change.
    async fn notify(&self, request: NotificationRequest) {
        let notification_type = request.notification_type;
        let user_id = request.user_id;
        match self.notifier.record(&request).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(
                    user_id = %user_id,
                    notification_type = %notification_type,
                    "Notification already recorded, skipping"
                );
            }
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    notification_type = %notification_type,
                    error = %e,
                    "Failed to record notification"
                );
            }
        }
    }

    async fn notify_activated(&self, sub: &SubscriptionProfile) {
        let request = NotificationRequest::new(
            sub.user_id,
            NotificationType::SubscriptionActivated,
            format!("Your {} subscription is now active", sub.subscription_type),
            serde_json::json!({
                "subscription_id": sub.id,
                "subscription_type": sub.subscription_type,
                "end_date": sub.end_date,
            }),
        )
        .with_key(IdempotencyKey::once(
            sub.id,
            NotificationType::SubscriptionActivated,
        ));
        self.notify(request).await;
    }

    async fn get_owned(&self, user_id: Uuid, subscription_id: Uuid) -> AppResult<SubscriptionProfile> {
        let sub = self
            .subscription_repo
            .get_by_id(subscription_id)
            .await?
            .ok_or(AppError::NotFound)?;
        if sub.user_id != user_id {
            return Err(AppError::NotFound);
        }
        Ok(sub)
    }

    /// Insert, charge from balance and activate a new subscription atomically.
    /// A declined charge leaves no row behind.
    async fn purchase_with_balance(
        &self,
        input: &CreateSubscriptionInput,
        payment_type: PaymentType,
        metadata: serde_json::Value,
    ) -> AppResult<SubscriptionProfile> {
        let duration = parse_duration(input.duration_months)?;
        let now = Self::now();
        let end_date = duration
            .add_to(now)
            .ok_or_else(|| AppError::Internal("Subscription end date out of range".into()))?;

        let charge = self.ledger.build_charge(
            input.user_id,
            input.payment_amount_cents,
            &input.currency,
            PaymentMethod::Balance,
            input.id,
            payment_type,
        )?;

        let transition = TransitionInput {
            start_date: Some(now),
            end_date: Some(end_date),
            charge: Some(charge),
            retire_other_active: true,
            metadata,
            ..TransitionInput::new(
                input.id,
                SubscriptionStatus::Pending,
                SubscriptionStatus::Active,
                "activated",
            )
        };

        let result = self
            .subscription_repo
            .create_and_transition(input, &transition)
            .await;
        match result {
            Ok(TransitionOutcome::Applied {
                subscription,
                retired,
                ..
            }) => {
                for old in &retired {
                    tracing::info!(
                        subscription_id = %old.id,
                        replaced_by = %subscription.id,
                        "Previous subscription retired"
                    );
                }
                Ok(subscription)
            }
            Ok(TransitionOutcome::Stale { current }) => Err(AppError::Internal(format!(
                "New subscription {} changed before activation",
                current.id
            ))),
            Err(e) => {
                if let AppError::InsufficientBalance {
                    required_cents,
                    available_cents,
                } = &e
                {
                    tracing::info!(
                        user_id = %input.user_id,
                        required_cents,
                        available_cents,
                        "Subscription purchase declined: insufficient balance"
                    );
                }
                Err(e)
            }
        }
    }

    // ========================================================================
    // Purchase
    // ========================================================================

    /// Create a subscription.
    ///
    /// Balance payments are charged and activated immediately. Any other payment
    /// method leaves the subscription `pending` until the external capture is
    /// confirmed.
    pub async fn create_subscription(
        &self,
        user_id: Uuid,
        request: CreateSubscriptionRequest,
    ) -> AppResult<SubscriptionProfile> {
        let (quote, promo) = self
            .pricing
            .quote(
                request.subscription_type,
                request.duration_months,
                request.promo_code.as_deref(),
            )
            .await?;
        let plan = self.plans.get_plan(request.subscription_type).await?;
        self.ledger.get_account(user_id).await?;

        let input = CreateSubscriptionInput {
            id: Uuid::new_v4(),
            user_id,
            subscription_type: request.subscription_type,
            start_date: Self::now(),
            duration_months: request.duration_months,
            payment_amount_cents: quote.final_price_cents,
            currency: plan.currency.clone(),
            payment_method: request.payment_method,
            promo_code: promo.as_ref().map(|p| p.code.clone()),
            discount_amount_cents: promo.as_ref().map(|_| quote.discount_amount_cents),
            auto_renewal: request.auto_renewal,
        };

        if !request.payment_method.is_balance() {
            let pending = self.subscription_repo.create_pending(&input).await?;
            tracing::info!(
                user_id = %user_id,
                subscription_id = %pending.id,
                payment_method = %request.payment_method,
                "Subscription awaiting external payment"
            );
            return Ok(pending);
        }

        let sub = self
            .purchase_with_balance(
                &input,
                PaymentType::Initial,
                serde_json::json!({
                    "base_price_cents": quote.base_price_cents,
                    "discount_amount_cents": quote.discount_amount_cents,
                }),
            )
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %sub.id,
            subscription_type = %sub.subscription_type,
            amount_cents = sub.payment_amount_cents,
            "Subscription created"
        );
        self.notify_activated(&sub).await;
        Ok(sub)
    }

    /// Activate a pending subscription. Already-active subscriptions are returned as-is.
    ///
    /// Balance rows are debited in the same transaction and stay pending when
    /// the balance does not cover the price.
    pub async fn activate_subscription(&self, subscription_id: Uuid) -> AppResult<SubscriptionProfile> {
        self.activate_pending(subscription_id, None).await
    }

    /// Record an externally captured payment and activate its subscription.
    pub async fn confirm_external_payment(
        &self,
        subscription_id: Uuid,
        external_reference: &str,
    ) -> AppResult<SubscriptionProfile> {
        let external_reference = external_reference.trim();
        if external_reference.is_empty() || external_reference.len() > 255 {
            return Err(AppError::InvalidInput(
                "External reference must be 1-255 characters".into(),
            ));
        }
        self.activate_pending(subscription_id, Some(external_reference))
            .await
    }

    async fn activate_pending(
        &self,
        subscription_id: Uuid,
        external_reference: Option<&str>,
    ) -> AppResult<SubscriptionProfile> {
        let sub = self
            .subscription_repo
            .get_by_id(subscription_id)
            .await?
            .ok_or(AppError::NotFound)?;

        match sub.status {
            SubscriptionStatus::Active => return Ok(sub),
            SubscriptionStatus::Pending => {}
            status => {
                return Err(AppError::InvalidInput(format!(
                    "Cannot activate a {} subscription",
                    status
                )));
            }
        }

        let charge = match (external_reference, sub.payment_method.is_balance()) {
            (Some(_), true) => {
                return Err(AppError::InvalidInput(
                    "Balance subscriptions are settled internally".into(),
                ));
            }
            (Some(reference), false) => {
                let mut charge = self.ledger.build_charge(
                    sub.user_id,
                    sub.payment_amount_cents,
                    &sub.currency,
                    sub.payment_method,
                    sub.id,
                    PaymentType::Initial,
                )?;
                charge.external_reference = Some(reference.to_string());
                Some(charge)
            }
            // A balance row only becomes active together with its debit.
            (None, true) => Some(self.ledger.build_charge(
                sub.user_id,
                sub.payment_amount_cents,
                &sub.currency,
                PaymentMethod::Balance,
                sub.id,
                PaymentType::Initial,
            )?),
            (None, false) => None,
        };

        let now = Self::now();
        let end_date = parse_duration(sub.duration_months)?
            .add_to(now)
            .ok_or_else(|| AppError::Internal("Subscription end date out of range".into()))?;

        let transition = TransitionInput {
            start_date: Some(now),
            end_date: Some(end_date),
            charge,
            retire_other_active: true,
            metadata: serde_json::json!({ "external_reference": external_reference }),
            ..TransitionInput::new(
                sub.id,
                SubscriptionStatus::Pending,
                SubscriptionStatus::Active,
                "activated",
            )
        };

        match self.subscription_repo.apply_transition(&transition).await? {
            TransitionOutcome::Applied { subscription, .. } => {
                tracing::info!(
                    subscription_id = %subscription.id,
                    user_id = %subscription.user_id,
                    "Subscription activated"
                );
                self.notify_activated(&subscription).await;
                Ok(subscription)
            }
            TransitionOutcome::Stale { current } if current.status.is_active() => Ok(current),
            TransitionOutcome::Stale { current } => Err(AppError::InvalidInput(format!(
                "Cannot activate a {} subscription",
                current.status
            ))),
        }
    }

    // ========================================================================
    // User-driven Changes
    // ========================================================================

    /// Cancel the caller's active subscription (or the given one). No refund.
    pub async fn cancel_subscription(
        &self,
        user_id: Uuid,
        subscription_id: Option<Uuid>,
        reason: Option<&str>,
    ) -> AppResult<SubscriptionProfile> {
        let sub = match subscription_id {
            Some(id) => self.get_owned(user_id, id).await?,
            None => self
                .subscription_repo
                .get_active_by_user(user_id)
                .await?
                .ok_or(AppError::NotFound)?,
        };
        match sub.status {
            SubscriptionStatus::Active => {}
            SubscriptionStatus::Cancelled => return Ok(sub),
            _ => return Err(AppError::NotFound),
        }

        let note = match reason.map(str::trim).filter(|r| !r.is_empty()) {
            Some(reason) => format!("Cancelled by user: {}", reason),
            None => "Cancelled by user".to_string(),
        };

        let transition = TransitionInput {
            auto_renewal: Some(false),
            append_note: Some(note),
            metadata: serde_json::json!({ "reason": reason }),
            ..TransitionInput::new(
                sub.id,
                SubscriptionStatus::Active,
                SubscriptionStatus::Cancelled,
                "cancelled",
            )
        };

        match self.subscription_repo.apply_transition(&transition).await? {
            TransitionOutcome::Applied { subscription, .. } => {
                tracing::info!(
                    user_id = %user_id,
                    subscription_id = %subscription.id,
                    "Subscription cancelled"
                );
                self.notify(
                    NotificationRequest::new(
                        user_id,
                        NotificationType::SubscriptionCancelled,
                        format!(
                            "Your {} subscription has been cancelled",
                            subscription.subscription_type
                        ),
                        serde_json::json!({
                            "subscription_id": subscription.id,
                            "end_date": subscription.end_date,
                        }),
                    )
                    .with_key(IdempotencyKey::once(
                        subscription.id,
                        NotificationType::SubscriptionCancelled,
                    )),
                )
                .await;
                Ok(subscription)
            }
            TransitionOutcome::Stale { current }
                if current.status == SubscriptionStatus::Cancelled =>
            {
                Ok(current)
            }
            TransitionOutcome::Stale { .. } => Err(AppError::NotFound),
        }
    }

    /// Switch to another plan, paid from balance. The current subscription is
    /// cancelled without refund in the same transaction.
    pub async fn change_plan(
        &self,
        user_id: Uuid,
        new_type: SubscriptionType,
        duration_months: i32,
    ) -> AppResult<SubscriptionProfile> {
        let (quote, _) = self.pricing.quote(new_type, duration_months, None).await?;
        let plan = self.plans.get_plan(new_type).await?;
        self.ledger.get_account(user_id).await?;

        let current = self.subscription_repo.get_active_by_user(user_id).await?;
        let auto_renewal = current.as_ref().is_some_and(|c| c.auto_renewal);

        let input = CreateSubscriptionInput {
            id: Uuid::new_v4(),
            user_id,
            subscription_type: new_type,
            start_date: Self::now(),
            duration_months,
            payment_amount_cents: quote.final_price_cents,
            currency: plan.currency.clone(),
            payment_method: PaymentMethod::Balance,
            promo_code: None,
            discount_amount_cents: None,
            auto_renewal,
        };

        let sub = self
            .purchase_with_balance(
                &input,
                PaymentType::Upgrade,
                serde_json::json!({
                    "previous_subscription_id": current.as_ref().map(|c| c.id),
                    "previous_type": current.as_ref().map(|c| c.subscription_type),
                }),
            )
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %sub.id,
            from = ?current.as_ref().map(|c| c.subscription_type),
            to = %new_type,
            "Subscription plan changed"
        );
        self.notify_activated(&sub).await;
        Ok(sub)
    }

    pub async fn set_auto_renewal(
        &self,
        user_id: Uuid,
        enabled: bool,
    ) -> AppResult<SubscriptionProfile> {
        let sub = self
            .subscription_repo
            .get_active_by_user(user_id)
            .await?
            .ok_or(AppError::NotFound)?;
        if sub.auto_renewal == enabled {
            return Ok(sub);
        }

        let transition = TransitionInput {
            auto_renewal: Some(enabled),
            metadata: serde_json::json!({ "auto_renewal": enabled }),
            ..TransitionInput::new(
                sub.id,
                SubscriptionStatus::Active,
                SubscriptionStatus::Active,
                "auto_renewal_changed",
            )
        };

        match self.subscription_repo.apply_transition(&transition).await? {
            TransitionOutcome::Applied { subscription, .. } => {
                tracing::info!(
                    user_id = %user_id,
                    subscription_id = %subscription.id,
                    enabled,
                    "Auto-renewal updated"
                );
                Ok(subscription)
            }
            TransitionOutcome::Stale { .. } => Err(AppError::NotFound),
        }
    }

    pub async fn get_current_status(&self, user_id: Uuid) -> AppResult<CurrentSubscriptionStatus> {
        self.get_current_status_at(user_id, Self::now()).await
    }

    pub async fn get_current_status_at(
        &self,
        user_id: Uuid,
        now: NaiveDateTime,
    ) -> AppResult<CurrentSubscriptionStatus> {
        let active = self.subscription_repo.get_active_by_user(user_id).await?;
        Ok(match active {
            Some(sub) => CurrentSubscriptionStatus {
                has_subscription: true,
                plan: Some(sub.subscription_type),
                tier: UserTier::from(sub.subscription_type),
                expires_at: sub.end_date,
                days_remaining: sub
                    .end_date
                    .map(|end| days_remaining(end, now))
                    .unwrap_or(0),
                auto_renewal: sub.auto_renewal,
            },
            None => CurrentSubscriptionStatus {
                has_subscription: false,
                plan: None,
                tier: UserTier::Free,
                expires_at: None,
                days_remaining: 0,
                auto_renewal: false,
            },
        })
    }

    pub async fn get_history(&self, user_id: Uuid) -> AppResult<SubscriptionHistory> {
        let mut subscriptions = self.subscription_repo.list_by_user(user_id).await?;
        subscriptions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let payments = self.ledger.list_payments(user_id).await?;
        Ok(SubscriptionHistory {
            subscriptions,
            payments,
        })
    }

    pub async fn list_events(&self, subscription_id: Uuid) -> AppResult<Vec<SubscriptionEventProfile>> {
        self.subscription_repo.list_events(subscription_id).await
    }

    pub async fn resync_tier(&self, user_id: Uuid) -> AppResult<UserTier> {
        let tier = self.subscription_repo.sync_tier(user_id).await?;
        tracing::debug!(user_id = %user_id, tier = %tier, "Subscription tier resynced");
        Ok(tier)
    }

    // ========================================================================
    // Scheduled Transitions
    // ========================================================================

    /// Extend an active subscription by one month, charged from balance at the
    /// plan's current monthly price.
    ///
    /// `observed_end_date` is the end date the caller saw when selecting the
    /// subscription; if it no longer matches, the renewal is skipped.
    pub async fn renew_subscription(
        &self,
        subscription_id: Uuid,
        observed_end_date: NaiveDateTime,
        now: NaiveDateTime,
    ) -> AppResult<RenewalOutcome> {
        let Some(sub) = self.subscription_repo.get_by_id(subscription_id).await? else {
            return Err(AppError::NotFound);
        };
        if !sub.status.is_active() || sub.end_date != Some(observed_end_date) {
            return Ok(RenewalOutcome::Skipped);
        }

        let plan = self.plans.get_plan_for_renewal(sub.subscription_type).await?;
        let new_end_date = BillingDuration::Monthly
            .add_to(observed_end_date)
            .ok_or_else(|| AppError::Internal("Subscription end date out of range".into()))?;
        let charge = self.ledger.build_charge(
            sub.user_id,
            plan.monthly_price_cents,
            &plan.currency,
            PaymentMethod::Balance,
            sub.id,
            PaymentType::AutoRenewal,
        )?;

        let transition = TransitionInput {
            expected_end_date: Some(observed_end_date),
            end_date: Some(new_end_date),
            charge: Some(charge),
            metadata: serde_json::json!({
                "previous_end_date": observed_end_date,
                "amount_cents": plan.monthly_price_cents,
            }),
            ..TransitionInput::new(
                sub.id,
                SubscriptionStatus::Active,
                SubscriptionStatus::Active,
                "renewed",
            )
        };

        match self.subscription_repo.apply_transition(&transition).await {
            Ok(TransitionOutcome::Applied { subscription, .. }) => {
                tracing::info!(
                    subscription_id = %subscription.id,
                    user_id = %subscription.user_id,
                    amount_cents = plan.monthly_price_cents,
                    end_date = %new_end_date,
                    "Subscription renewed"
                );
                self.notify(
                    NotificationRequest::new(
                        subscription.user_id,
                        NotificationType::SubscriptionRenewed,
                        format!(
                            "Your {} subscription has been renewed",
                            subscription.subscription_type
                        ),
                        serde_json::json!({
                            "subscription_id": subscription.id,
                            "amount_cents": plan.monthly_price_cents,
                            "end_date": new_end_date,
                        }),
                    )
                    .with_key(IdempotencyKey::for_period(
                        subscription.id,
                        NotificationType::SubscriptionRenewed,
                        new_end_date,
                    )),
                )
                .await;
                Ok(RenewalOutcome::Renewed(subscription))
            }
            Ok(TransitionOutcome::Stale { .. }) => Ok(RenewalOutcome::Skipped),
            Err(AppError::InsufficientBalance {
                required_cents,
                available_cents,
            }) => {
                tracing::info!(
                    subscription_id = %sub.id,
                    user_id = %sub.user_id,
                    required_cents,
                    available_cents,
                    "Auto-renewal failed: insufficient balance"
                );
                let Some(expired) = self
                    .expire_guarded(&sub, observed_end_date, now, "Auto-renewal failed: insufficient balance")
                    .await?
                else {
                    return Ok(RenewalOutcome::Skipped);
                };
                self.notify(
                    NotificationRequest::new(
                        sub.user_id,
                        NotificationType::AutoRenewalFailed,
                        format!(
                            "We could not renew your {} subscription. Top up your balance to subscribe again.",
                            sub.subscription_type
                        ),
                        serde_json::json!({
                            "subscription_id": sub.id,
                            "required_cents": required_cents,
                            "available_cents": available_cents,
                        }),
                    )
                    .with_key(IdempotencyKey::for_period(
                        sub.id,
                        NotificationType::AutoRenewalFailed,
                        observed_end_date,
                    )),
                )
                .await;
                Ok(RenewalOutcome::Failed(expired))
            }
            Err(e) => Err(e),
        }
    }

    /// Expire an active subscription whose end date has passed. Idempotent.
    pub async fn expire_subscription(
        &self,
        subscription_id: Uuid,
        now: NaiveDateTime,
    ) -> AppResult<SubscriptionProfile> {
        let sub = self
            .subscription_repo
            .get_by_id(subscription_id)
            .await?
            .ok_or(AppError::NotFound)?;

        if sub.status.is_terminal() {
            return Ok(sub);
        }
        if !sub.status.is_active() {
            return Err(AppError::InvalidInput(format!(
                "Cannot expire a {} subscription",
                sub.status
            )));
        }
        let Some(end_date) = sub.end_date else {
            return Err(AppError::Internal("Active subscription without end date".into()));
        };
        if end_date > now {
            return Err(AppError::InvalidInput(
                "Subscription has not reached its end date".into(),
            ));
        }

        match self
            .expire_guarded(&sub, end_date, now, "Expired at end of period")
            .await?
        {
            Some(expired) => {
                self.notify(
                    NotificationRequest::new(
                        expired.user_id,
                        NotificationType::SubscriptionExpired,
                        format!("Your {} subscription has expired", expired.subscription_type),
                        serde_json::json!({
                            "subscription_id": expired.id,
                            "end_date": expired.end_date,
                        }),
                    )
                    .with_key(IdempotencyKey::once(
                        expired.id,
                        NotificationType::SubscriptionExpired,
                    )),
                )
                .await;
                Ok(expired)
            }
            None => self
                .subscription_repo
                .get_by_id(subscription_id)
                .await?
                .ok_or(AppError::NotFound),
        }
    }

    /// `active -> expired` guarded on the observed end date. `None` when the row
    /// changed underneath.
    async fn expire_guarded(
        &self,
        sub: &SubscriptionProfile,
        observed_end_date: NaiveDateTime,
        now: NaiveDateTime,
        note: &str,
    ) -> AppResult<Option<SubscriptionProfile>> {
        let transition = TransitionInput {
            expected_end_date: Some(observed_end_date),
            auto_renewal: Some(false),
            append_note: Some(note.to_string()),
            metadata: serde_json::json!({ "expired_at": now }),
            ..TransitionInput::new(
                sub.id,
                SubscriptionStatus::Active,
                SubscriptionStatus::Expired,
                "expired",
            )
        };

        match self.subscription_repo.apply_transition(&transition).await? {
            TransitionOutcome::Applied { subscription, .. } => {
                tracing::info!(
                    subscription_id = %subscription.id,
                    user_id = %subscription.user_id,
                    "Subscription expired"
                );
                Ok(Some(subscription))
            }
            TransitionOutcome::Stale { .. } => Ok(None),
        }
    }
}

/// Whole days left until `end_date`, floored, never negative.
pub fn days_remaining(end_date: NaiveDateTime, now: NaiveDateTime) -> i64 {
    if end_date <= now {
        return 0;
    }
    (end_date - now).num_days()
}
