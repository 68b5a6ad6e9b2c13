use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::{
    app_error::{AppError, AppResult},
    domain::entities::{billing_duration::BillingDuration, subscription_type::SubscriptionType},
};

// ============================================================================
// Profile Types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionPlanProfile {
    pub subscription_type: SubscriptionType,
    pub name: String,
    pub monthly_price_cents: i64,
    pub quarterly_price_cents: i64,
    pub yearly_price_cents: i64,
    pub currency: String,
    /// Capability identifiers granted by this plan
    pub features: Vec<String>,
    /// Inactive plans cannot be purchased but existing subscriptions keep renewing
    pub is_active: bool,
    pub created_at: Option<NaiveDateTime>,
    pub updated_at: Option<NaiveDateTime>,
}

impl SubscriptionPlanProfile {
    pub fn price_for(&self, duration: BillingDuration) -> i64 {
        match duration {
            BillingDuration::Monthly => self.monthly_price_cents,
            BillingDuration::Quarterly => self.quarterly_price_cents,
            BillingDuration::Yearly => self.yearly_price_cents,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PlanPricing {
    pub monthly_cents: i64,
    pub quarterly_cents: i64,
    pub yearly_cents: i64,
    pub currency: String,
}

// ============================================================================
// Input Types
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct UpsertPlanInput {
    pub name: String,
    pub monthly_price_cents: i64,
    pub quarterly_price_cents: i64,
    pub yearly_price_cents: i64,
    pub currency: String,
    #[serde(default)]
    pub features: Vec<String>,
}

// ============================================================================
// Repository Trait
// ============================================================================

#[async_trait]
pub trait SubscriptionPlanRepo: Send + Sync {
    /// Plan row regardless of its active flag
    async fn get_by_type(
        &self,
        subscription_type: SubscriptionType,
    ) -> AppResult<Option<SubscriptionPlanProfile>>;
    async fn list(&self, include_inactive: bool) -> AppResult<Vec<SubscriptionPlanProfile>>;
    /// Insert or replace the plan's catalog fields. New plans start active.
    async fn upsert(
        &self,
        subscription_type: SubscriptionType,
        input: &UpsertPlanInput,
    ) -> AppResult<SubscriptionPlanProfile>;
    async fn set_active(
        &self,
        subscription_type: SubscriptionType,
        is_active: bool,
    ) -> AppResult<SubscriptionPlanProfile>;
}

// ============================================================================
// Use Cases
// ============================================================================

#[derive(Clone)]
pub struct PlanRegistryUseCases {
    plan_repo: Arc<dyn SubscriptionPlanRepo>,
}

impl PlanRegistryUseCases {
    pub fn new(plan_repo: Arc<dyn SubscriptionPlanRepo>) -> Self {
        Self { plan_repo }
    }

    /// Plan lookup for a new purchase. Unknown or inactive plans are not sellable.
    pub async fn get_plan(
        &self,
        subscription_type: SubscriptionType,
    ) -> AppResult<SubscriptionPlanProfile> {
        match self.plan_repo.get_by_type(subscription_type).await? {
            Some(plan) if plan.is_active => Ok(plan),
            _ => Err(AppError::PlanNotFound(subscription_type.to_string())),
        }
    }

    /// Plan lookup for renewing an existing subscription, inactive plans included.
    pub async fn get_plan_for_renewal(
        &self,
        subscription_type: SubscriptionType,
    ) -> AppResult<SubscriptionPlanProfile> {
        self.plan_repo
            .get_by_type(subscription_type)
            .await?
            .ok_or_else(|| AppError::PlanNotFound(subscription_type.to_string()))
    }

    pub async fn get_pricing(&self) -> AppResult<BTreeMap<SubscriptionType, PlanPricing>> {
        let plans = self.plan_repo.list(false).await?;
        Ok(plans
            .into_iter()
            .filter(|p| p.is_active)
            .map(|p| {
                (
                    p.subscription_type,
                    PlanPricing {
                        monthly_cents: p.monthly_price_cents,
                        quarterly_cents: p.quarterly_price_cents,
                        yearly_cents: p.yearly_price_cents,
                        currency: p.currency,
                    },
                )
            })
            .collect())
    }

    pub async fn get_features(&self) -> AppResult<BTreeMap<SubscriptionType, Vec<String>>> {
        let plans = self.plan_repo.list(false).await?;
        Ok(plans
            .into_iter()
            .filter(|p| p.is_active)
            .map(|p| (p.subscription_type, p.features))
            .collect())
    }

    pub async fn list_plans(&self, include_inactive: bool) -> AppResult<Vec<SubscriptionPlanProfile>> {
        self.plan_repo.list(include_inactive).await
    }

    pub async fn upsert_plan(
        &self,
        subscription_type: SubscriptionType,
        mut input: UpsertPlanInput,
    ) -> AppResult<SubscriptionPlanProfile> {
        input.name = input.name.trim().to_string();
        if input.name.is_empty() || input.name.len() > 100 {
            return Err(AppError::InvalidInput(
                "Plan name must be 1-100 characters".into(),
            ));
        }
        if input.monthly_price_cents < 0
            || input.quarterly_price_cents < 0
            || input.yearly_price_cents < 0
        {
            return Err(AppError::InvalidInput("Price cannot be negative".into()));
        }
        input.currency = input.currency.trim().to_ascii_uppercase();
        if input.currency.len() != 3 || !input.currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(AppError::InvalidInput(
                "Currency must be a 3-letter code".into(),
            ));
        }
        input.features.retain(|f| !f.trim().is_empty());

        let plan = self.plan_repo.upsert(subscription_type, &input).await?;
        tracing::info!(
            subscription_type = %subscription_type,
            monthly_price_cents = plan.monthly_price_cents,
            "Subscription plan saved"
        );
        Ok(plan)
    }

    /// Deactivate or reactivate a plan. Plans are never deleted.
    pub async fn set_plan_active(
        &self,
        subscription_type: SubscriptionType,
        is_active: bool,
    ) -> AppResult<SubscriptionPlanProfile> {
        let plan = self.plan_repo.set_active(subscription_type, is_active).await?;
        tracing::info!(
            subscription_type = %subscription_type,
            is_active,
            "Subscription plan availability changed"
        );
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{InMemoryBillingStore, create_test_plan};

    fn registry(store: InMemoryBillingStore) -> PlanRegistryUseCases {
        PlanRegistryUseCases::new(Arc::new(store))
    }

    fn upsert_input() -> UpsertPlanInput {
        UpsertPlanInput {
            name: "Premium".into(),
            monthly_price_cents: 1000,
            quarterly_price_cents: 2700,
            yearly_price_cents: 10000,
            currency: "usd".into(),
            features: vec!["unlimited_likes".into(), " ".into()],
        }
    }

    #[tokio::test]
    async fn get_plan_rejects_inactive_plan() {
        let store = InMemoryBillingStore::new().with_plans(vec![create_test_plan(
            SubscriptionType::Vip,
            |p| p.is_active = false,
        )]);
        let registry = registry(store);

        let err = registry.get_plan(SubscriptionType::Vip).await.unwrap_err();
        assert!(matches!(err, AppError::PlanNotFound(ref t) if t == "vip"));

        // Renewal lookup still sees the row
        let plan = registry
            .get_plan_for_renewal(SubscriptionType::Vip)
            .await
            .unwrap();
        assert!(!plan.is_active);
    }

    #[tokio::test]
    async fn get_plan_unknown_type_is_plan_not_found() {
        let registry = registry(InMemoryBillingStore::new());
        assert!(matches!(
            registry.get_plan(SubscriptionType::Premium).await,
            Err(AppError::PlanNotFound(_))
        ));
        assert!(matches!(
            registry.get_plan_for_renewal(SubscriptionType::Premium).await,
            Err(AppError::PlanNotFound(_))
        ));
    }

    #[tokio::test]
    async fn pricing_and_features_only_cover_active_plans() {
        let store = InMemoryBillingStore::new().with_plans(vec![
            create_test_plan(SubscriptionType::Premium, |_| {}),
            create_test_plan(SubscriptionType::Vip, |p| p.is_active = false),
        ]);
        let registry = registry(store);

        let pricing = registry.get_pricing().await.unwrap();
        assert_eq!(pricing.len(), 1);
        let premium = &pricing[&SubscriptionType::Premium];
        assert_eq!(premium.monthly_cents, 1000);
        assert_eq!(premium.quarterly_cents, 2700);
        assert_eq!(premium.yearly_cents, 10000);

        let features = registry.get_features().await.unwrap();
        assert!(features.contains_key(&SubscriptionType::Premium));
        assert!(!features.contains_key(&SubscriptionType::Vip));
    }

    #[tokio::test]
    async fn upsert_plan_normalizes_and_validates() {
        let registry = registry(InMemoryBillingStore::new());

        let plan = registry
            .upsert_plan(SubscriptionType::Premium, upsert_input())
            .await
            .unwrap();
        assert_eq!(plan.currency, "USD");
        assert_eq!(plan.features, vec!["unlimited_likes".to_string()]);
        assert!(plan.is_active);

        let mut negative = upsert_input();
        negative.yearly_price_cents = -1;
        assert!(matches!(
            registry.upsert_plan(SubscriptionType::Premium, negative).await,
            Err(AppError::InvalidInput(_))
        ));

        let mut bad_currency = upsert_input();
        bad_currency.currency = "dollars".into();
        assert!(matches!(
            registry
                .upsert_plan(SubscriptionType::Premium, bad_currency)
                .await,
            Err(AppError::InvalidInput(_))
        ));

        let mut empty_name = upsert_input();
        empty_name.name = "   ".into();
        assert!(matches!(
            registry.upsert_plan(SubscriptionType::Premium, empty_name).await,
            Err(AppError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn deactivated_plan_is_listed_only_with_inactive() {
        let store = InMemoryBillingStore::new()
            .with_plans(vec![create_test_plan(SubscriptionType::Premium, |_| {})]);
        let registry = registry(store);

        registry
            .set_plan_active(SubscriptionType::Premium, false)
            .await
            .unwrap();
        assert!(registry.list_plans(false).await.unwrap().is_empty());
        assert_eq!(registry.list_plans(true).await.unwrap().len(), 1);

        registry
            .set_plan_active(SubscriptionType::Premium, true)
            .await
            .unwrap();
        assert!(registry.get_plan(SubscriptionType::Premium).await.is_ok());
    }

    #[tokio::test]
    async fn set_plan_active_on_missing_plan_is_not_found() {
        let registry = registry(InMemoryBillingStore::new());
        assert!(matches!(
            registry.set_plan_active(SubscriptionType::Vip, false).await,
            Err(AppError::NotFound)
        ));
    }
}
