use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Purchasable subscription tier.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    sqlx::Type,
    AsRefStr,
    Display,
    EnumString,
)]
#[sqlx(type_name = "subscription_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum SubscriptionType {
    Premium,
    Vip,
}

impl SubscriptionType {
    pub const ALL: [SubscriptionType; 2] = [SubscriptionType::Premium, SubscriptionType::Vip];
}

/// Externally visible tier label of a user.
///
/// Derived from the user's active subscription; `Free` when there is none.
/// Never a source of truth on its own.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    AsRefStr,
    Display,
    EnumString,
    Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum UserTier {
    #[default]
    Free,
    Premium,
    Vip,
}

impl From<SubscriptionType> for UserTier {
    fn from(value: SubscriptionType) -> Self {
        match value {
            SubscriptionType::Premium => UserTier::Premium,
            SubscriptionType::Vip => UserTier::Vip,
        }
    }
}

impl UserTier {
    /// Project the tier from the active subscription type, if any.
    pub fn from_active(active: Option<SubscriptionType>) -> Self {
        active.map(UserTier::from).unwrap_or_default()
    }

    /// Parse a stored tier label. Unknown labels fall back to `Free`.
    pub fn from_label(label: &str) -> Self {
        label.parse().unwrap_or_else(|_| {
            tracing::warn!(label = %label, "Unknown subscription tier label, treating as free");
            UserTier::Free
        })
    }
}
