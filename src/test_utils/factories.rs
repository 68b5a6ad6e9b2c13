//! Test data factories for creating valid test fixtures.
//!
//! Each factory function creates a complete, valid object with sensible defaults.
//! Use the closure parameter to override specific fields as needed.

use chrono::{Duration, NaiveDate, NaiveDateTime};
use uuid::Uuid;

use crate::{
    application::use_cases::{
        plan_registry::SubscriptionPlanProfile, pricing::PromoCodeProfile,
        subscription_lifecycle::SubscriptionProfile,
    },
    domain::entities::{
        payment_method::PaymentMethod, subscription_status::SubscriptionStatus,
        subscription_type::SubscriptionType,
    },
};

/// Create a test plan. Prices default to 1000 / 2700 / 10000 cents.
pub fn create_test_plan(
    subscription_type: SubscriptionType,
    overrides: impl FnOnce(&mut SubscriptionPlanProfile),
) -> SubscriptionPlanProfile {
    let mut plan = SubscriptionPlanProfile {
        subscription_type,
        name: match subscription_type {
            SubscriptionType::Premium => "Premium".to_string(),
            SubscriptionType::Vip => "VIP".to_string(),
        },
        monthly_price_cents: 1000,
        quarterly_price_cents: 2700,
        yearly_price_cents: 10000,
        currency: "USD".to_string(),
        features: vec!["unlimited_likes".to_string(), "see_who_liked".to_string()],
        is_active: true,
        created_at: Some(test_datetime()),
        updated_at: Some(test_datetime()),
    };
    overrides(&mut plan);
    plan
}

/// Create an active, unrestricted promo code with a 10% discount.
pub fn create_test_promo(
    code: &str,
    overrides: impl FnOnce(&mut PromoCodeProfile),
) -> PromoCodeProfile {
    let mut promo = PromoCodeProfile {
        code: code.to_string(),
        discount_percent: 10,
        allowed_types: vec![],
        is_active: true,
        valid_until: None,
        created_at: Some(test_datetime()),
    };
    overrides(&mut promo);
    promo
}

/// Create an active balance-paid subscription that started a day before `now`
/// and ends 20 days after it.
pub fn create_test_subscription(
    user_id: Uuid,
    subscription_type: SubscriptionType,
    now: NaiveDateTime,
    overrides: impl FnOnce(&mut SubscriptionProfile),
) -> SubscriptionProfile {
    let mut sub = SubscriptionProfile {
        id: Uuid::new_v4(),
        user_id,
        subscription_type,
        status: SubscriptionStatus::Active,
        start_date: now - Duration::days(1),
        end_date: Some(now + Duration::days(20)),
        duration_months: 1,
        payment_amount_cents: 1000,
        currency: "USD".to_string(),
        payment_method: PaymentMethod::Balance,
        promo_code: None,
        discount_amount_cents: None,
        auto_renewal: false,
        notes: None,
        created_at: Some(now - Duration::days(1)),
        updated_at: Some(now - Duration::days(1)),
    };
    overrides(&mut sub);
    sub
}

/// Fixed mid-morning timestamp so `now + a few hours` stays on the same day.
pub fn test_datetime() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 1, 15)
        .and_then(|d| d.and_hms_opt(10, 0, 0))
        .expect("valid test datetime")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_plan_with_defaults() {
        let plan = create_test_plan(SubscriptionType::Vip, |_| {});
        assert_eq!(plan.subscription_type, SubscriptionType::Vip);
        assert_eq!(plan.monthly_price_cents, 1000);
        assert!(plan.is_active);
    }

    #[test]
    fn test_create_plan_with_overrides() {
        let plan = create_test_plan(SubscriptionType::Premium, |p| {
            p.monthly_price_cents = 300;
            p.is_active = false;
        });
        assert_eq!(plan.monthly_price_cents, 300);
        assert!(!plan.is_active);
    }

    #[test]
    fn test_create_subscription_with_defaults() {
        let user_id = Uuid::new_v4();
        let now = test_datetime();
        let sub = create_test_subscription(user_id, SubscriptionType::Premium, now, |_| {});
        assert_eq!(sub.user_id, user_id);
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert!(sub.end_date.unwrap() > now);
    }
}
