use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Subscription lifecycle state.
///
/// `pending -> active -> {cancelled, expired}`; renewals keep a subscription
/// `active`. Cancelled and expired rows are kept as history.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    sqlx::Type,
    AsRefStr,
    Display,
    EnumString,
)]
#[sqlx(type_name = "subscription_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum SubscriptionStatus {
    Pending,
    Active,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    /// Returns true if the owner should have access to the tier's features
    pub fn is_active(&self) -> bool {
        matches!(self, SubscriptionStatus::Active)
    }

    /// Terminal states never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Cancelled | SubscriptionStatus::Expired
        )
    }

    /// Valid transitions from this state. `Active -> Active` is a renewal.
    pub fn valid_transitions(&self) -> &'static [SubscriptionStatus] {
        match self {
            SubscriptionStatus::Pending => &[SubscriptionStatus::Active],
            SubscriptionStatus::Active => &[
                SubscriptionStatus::Active,
                SubscriptionStatus::Cancelled,
                SubscriptionStatus::Expired,
            ],
            SubscriptionStatus::Cancelled | SubscriptionStatus::Expired => &[],
        }
    }

    pub fn can_transition_to(&self, new_status: SubscriptionStatus) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}
