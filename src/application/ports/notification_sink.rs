use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{app_error::AppResult, domain::entities::notification_type::NotificationType};

// ============================================================================
// Port Types
// ============================================================================

/// De-duplication key for a notification request.
///
/// One key per (subscription, notification type, period). A sink must record
/// at most one notification per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(pub String);

impl IdempotencyKey {
    /// Key for a one-off event of a subscription (activated, cancelled, expired)
    pub fn once(subscription_id: Uuid, kind: NotificationType) -> Self {
        Self(format!("{}:{}", kind.as_ref(), subscription_id))
    }

    /// Key scoped to a billing period, identified by the period's end date
    pub fn for_period(subscription_id: Uuid, kind: NotificationType, period_end: NaiveDateTime) -> Self {
        Self(format!(
            "{}:{}:{}",
            kind.as_ref(),
            subscription_id,
            period_end.format("%Y-%m-%dT%H:%M:%S")
        ))
    }

    /// Key scoped to a calendar day (warning notices)
    pub fn for_day(subscription_id: Uuid, kind: NotificationType, day: NaiveDate) -> Self {
        Self(format!(
            "{}:{}:{}",
            kind.as_ref(),
            subscription_id,
            day.format("%Y-%m-%d")
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Structured notification request handed to the delivery side
#[derive(Debug, Clone, Serialize)]
pub struct NotificationRequest {
    pub user_id: Uuid,
    pub notification_type: NotificationType,
    pub title: String,
    pub message: String,
    pub data: serde_json::Value,
    pub idempotency_key: Option<IdempotencyKey>,
}

impl NotificationRequest {
    pub fn new(
        user_id: Uuid,
        notification_type: NotificationType,
        message: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            user_id,
            notification_type,
            title: notification_type.default_title().to_string(),
            message: message.into(),
            data,
            idempotency_key: None,
        }
    }

    pub fn with_key(mut self, key: IdempotencyKey) -> Self {
        self.idempotency_key = Some(key);
        self
    }
}

// ============================================================================
// Port Trait
// ============================================================================

/// Receives notification requests. Delivery and formatting happen elsewhere.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Record a notification request.
    ///
    /// Returns `false` when a request with the same idempotency key was already
    /// recorded (nothing new is stored).
    async fn record(&self, request: &NotificationRequest) -> AppResult<bool>;
}
