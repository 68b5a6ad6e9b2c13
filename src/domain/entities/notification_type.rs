use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Kinds of notification requests the billing core emits
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
#[sqlx(type_name = "notification_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NotificationType {
    SubscriptionActivated,
    SubscriptionRenewed,
    SubscriptionExpiringSoon,
    SubscriptionExpired,
    AutoRenewalFailed,
    LowBalance,
    SubscriptionCancelled,
}

impl NotificationType {
    pub fn default_title(&self) -> &'static str {
        match self {
            NotificationType::SubscriptionActivated => "Subscription activated",
            NotificationType::SubscriptionRenewed => "Subscription renewed",
            NotificationType::SubscriptionExpiringSoon => "Subscription expiring soon",
            NotificationType::SubscriptionExpired => "Subscription expired",
            NotificationType::AutoRenewalFailed => "Auto-renewal failed",
            NotificationType::LowBalance => "Low balance",
            NotificationType::SubscriptionCancelled => "Subscription cancelled",
        }
    }
}
