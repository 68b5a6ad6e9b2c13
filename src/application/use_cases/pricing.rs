use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{
    app_error::{AppError, AppResult},
    application::use_cases::plan_registry::{PlanRegistryUseCases, SubscriptionPlanProfile},
    domain::entities::{billing_duration::BillingDuration, subscription_type::SubscriptionType},
};

const PROMO_CODE_MIN_LEN: usize = 3;
const PROMO_CODE_MAX_LEN: usize = 32;

// ============================================================================
// Profile Types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct PromoCodeProfile {
    /// Normalized (upper-case) code
    pub code: String,
    pub discount_percent: i32,
    /// Plan types the code applies to. Empty means every type.
    pub allowed_types: Vec<SubscriptionType>,
    pub is_active: bool,
    pub valid_until: Option<NaiveDateTime>,
    pub created_at: Option<NaiveDateTime>,
}

impl PromoCodeProfile {
    pub fn applies_to(&self, subscription_type: SubscriptionType) -> bool {
        self.allowed_types.is_empty() || self.allowed_types.contains(&subscription_type)
    }

    pub fn is_usable_at(&self, now: NaiveDateTime) -> bool {
        self.is_active && self.valid_until.is_none_or(|until| now <= until)
    }
}

/// Result of pricing a purchase. `final + discount == base` always holds.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct PriceQuote {
    pub base_price_cents: i64,
    pub discount_amount_cents: i64,
    pub final_price_cents: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PromoValidation {
    pub code: String,
    pub subscription_type: SubscriptionType,
    pub duration_months: i32,
    pub discount_percent: i32,
    #[serde(flatten)]
    pub quote: PriceQuote,
}

// ============================================================================
// Input Types
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct CreatePromoInput {
    pub code: String,
    pub discount_percent: i32,
    #[serde(default)]
    pub allowed_types: Vec<SubscriptionType>,
    pub valid_until: Option<NaiveDateTime>,
}

// ============================================================================
// Pure Pricing
// ============================================================================

pub fn parse_duration(duration_months: i32) -> AppResult<BillingDuration> {
    BillingDuration::from_months(duration_months).ok_or(AppError::InvalidDuration(duration_months))
}

/// `round_half_up(base * percent / 100)` in integer arithmetic.
///
/// Widened to `i128` so any non-negative `i64` price is safe; the result never
/// exceeds `base_price_cents`.
fn discount_for(base_price_cents: i64, discount_percent: i32) -> i64 {
    let percent = i128::from(discount_percent.clamp(0, 100));
    let discount = (i128::from(base_price_cents) * percent + 50) / 100;
    i64::try_from(discount).unwrap_or(base_price_cents)
}

/// Price a purchase of `plan` for `duration_months`, optionally discounted.
///
/// Side-effect free: the promo must already be resolved and usable.
pub fn price(
    plan: &SubscriptionPlanProfile,
    duration_months: i32,
    promo: Option<&PromoCodeProfile>,
) -> AppResult<PriceQuote> {
    let duration = parse_duration(duration_months)?;
    let base_price_cents = plan.price_for(duration);

    let discount_amount_cents = match promo {
        Some(promo) if !promo.applies_to(plan.subscription_type) => {
            return Err(AppError::PromoRestricted {
                code: promo.code.clone(),
                plan: plan.subscription_type.to_string(),
            });
        }
        Some(promo) => discount_for(base_price_cents, promo.discount_percent),
        None => 0,
    };

    Ok(PriceQuote {
        base_price_cents,
        discount_amount_cents,
        final_price_cents: base_price_cents - discount_amount_cents,
    })
}

/// Trim and upper-case a promo code, rejecting malformed input.
pub fn normalize_promo_code(raw: &str) -> AppResult<String> {
    let code = raw.trim().to_ascii_uppercase();
    let len_ok = (PROMO_CODE_MIN_LEN..=PROMO_CODE_MAX_LEN).contains(&code.len());
    let chars_ok = code
        .chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if !len_ok || !chars_ok {
        return Err(AppError::InvalidInput(format!(
            "Promo code must be {}-{} characters of A-Z, 0-9, '_' or '-'",
            PROMO_CODE_MIN_LEN, PROMO_CODE_MAX_LEN
        )));
    }
    Ok(code)
}

// ============================================================================
// Repository Trait
// ============================================================================

#[async_trait]
pub trait PromoCodeRepo: Send + Sync {
    async fn get_by_code(&self, code: &str) -> AppResult<Option<PromoCodeProfile>>;
    /// Fails with `InvalidInput` when the code already exists
    async fn create(&self, input: &CreatePromoInput) -> AppResult<PromoCodeProfile>;
    async fn deactivate(&self, code: &str) -> AppResult<()>;
}

// ============================================================================
// Use Cases
// ============================================================================

#[derive(Clone)]
pub struct PricingUseCases {
    plans: PlanRegistryUseCases,
    promo_repo: Arc<dyn PromoCodeRepo>,
}

impl PricingUseCases {
    pub fn new(plans: PlanRegistryUseCases, promo_repo: Arc<dyn PromoCodeRepo>) -> Self {
        Self { plans, promo_repo }
    }

    /// Resolve a user-supplied promo code into a usable promo for `subscription_type`.
    pub async fn resolve_promo(
        &self,
        raw_code: &str,
        subscription_type: SubscriptionType,
        now: NaiveDateTime,
    ) -> AppResult<PromoCodeProfile> {
        let code = normalize_promo_code(raw_code)?;
        let promo = self
            .promo_repo
            .get_by_code(&code)
            .await?
            .filter(|p| p.is_usable_at(now))
            .ok_or_else(|| AppError::InvalidInput(format!("Promo code {} is not valid", code)))?;

        if !promo.applies_to(subscription_type) {
            return Err(AppError::PromoRestricted {
                code: promo.code,
                plan: subscription_type.to_string(),
            });
        }
        Ok(promo)
    }

    /// Price a purchase against the active catalog.
    pub async fn quote(
        &self,
        subscription_type: SubscriptionType,
        duration_months: i32,
        promo_code: Option<&str>,
    ) -> AppResult<(PriceQuote, Option<PromoCodeProfile>)> {
        let duration_months = parse_duration(duration_months)?.months();
        let plan = self.plans.get_plan(subscription_type).await?;
        let now = chrono::Utc::now().naive_utc();

        let promo = match promo_code.map(str::trim).filter(|c| !c.is_empty()) {
            Some(code) => Some(self.resolve_promo(code, subscription_type, now).await?),
            None => None,
        };

        let quote = price(&plan, duration_months, promo.as_ref())?;
        Ok((quote, promo))
    }

    pub async fn validate_promo(
        &self,
        code: &str,
        subscription_type: SubscriptionType,
        duration_months: i32,
    ) -> AppResult<PromoValidation> {
        let (quote, promo) = self
            .quote(subscription_type, duration_months, Some(code))
            .await?;
        let promo = promo.ok_or_else(|| AppError::InvalidInput("Promo code is required".into()))?;

        Ok(PromoValidation {
            code: promo.code,
            subscription_type,
            duration_months,
            discount_percent: promo.discount_percent,
            quote,
        })
    }

    pub async fn create_promo(&self, mut input: CreatePromoInput) -> AppResult<PromoCodeProfile> {
        input.code = normalize_promo_code(&input.code)?;
        if !(0..=100).contains(&input.discount_percent) {
            return Err(AppError::InvalidInput(
                "Discount percent must be between 0 and 100".into(),
            ));
        }
        input.allowed_types.sort();
        input.allowed_types.dedup();

        let promo = self.promo_repo.create(&input).await?;
        tracing::info!(
            code = %promo.code,
            discount_percent = promo.discount_percent,
            "Promo code created"
        );
        Ok(promo)
    }

    pub async fn deactivate_promo(&self, code: &str) -> AppResult<()> {
        let code = normalize_promo_code(code)?;
        self.promo_repo.deactivate(&code).await?;
        tracing::info!(code = %code, "Promo code deactivated");
        Ok(())
    }
}
