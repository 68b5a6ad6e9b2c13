use chrono::{Duration, NaiveDateTime};
use serde::Serialize;
use std::sync::Arc;

use crate::{
    app_error::AppResult,
    application::{
        ports::notification_sink::{IdempotencyKey, NotificationRequest, NotificationSink},
        use_cases::{
            ledger::LedgerGateway,
            plan_registry::PlanRegistryUseCases,
            subscription_lifecycle::{
                RenewalOutcome, SubscriptionLifecycleUseCases, SubscriptionProfile,
                SubscriptionRepo, days_remaining,
            },
        },
    },
    domain::entities::notification_type::NotificationType,
};

pub const DEFAULT_EXPIRING_SOON_DAYS: i64 = 3;

/// Counters for one reconciliation run
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ReconciliationReport {
    pub renewed: u32,
    pub renewal_failed: u32,
    pub renewal_skipped: u32,
    pub expired: u32,
    pub expiring_soon_notices: u32,
    pub low_balance_notices: u32,
    /// Subscriptions whose step failed and was left for the next run
    pub failures: u32,
}

#[derive(Clone)]
pub struct ReconciliationUseCases {
    subscription_repo: Arc<dyn SubscriptionRepo>,
    lifecycle: SubscriptionLifecycleUseCases,
    plans: PlanRegistryUseCases,
    ledger: LedgerGateway,
    notifier: Arc<dyn NotificationSink>,
    expiring_soon_days: i64,
}

impl ReconciliationUseCases {
    pub fn new(
        subscription_repo: Arc<dyn SubscriptionRepo>,
        lifecycle: SubscriptionLifecycleUseCases,
        plans: PlanRegistryUseCases,
        ledger: LedgerGateway,
        notifier: Arc<dyn NotificationSink>,
        expiring_soon_days: i64,
    ) -> Self {
        Self {
            subscription_repo,
            lifecycle,
            plans,
            ledger,
            notifier,
            expiring_soon_days: expiring_soon_days.max(1),
        }
    }

    pub async fn run_daily(&self) -> AppResult<ReconciliationReport> {
        self.run_daily_at(chrono::Utc::now().naive_utc()).await
    }

    pub async fn run_critical_checks(&self) -> AppResult<ReconciliationReport> {
        self.run_critical_checks_at(chrono::Utc::now().naive_utc())
            .await
    }

    /// Full daily pass: renewals, expirations, then the warning checks.
    ///
    /// Only a failure to read a candidate set aborts the run.
    pub async fn run_daily_at(&self, now: NaiveDateTime) -> AppResult<ReconciliationReport> {
        let mut report = ReconciliationReport::default();

        self.process_renewals(now, &mut report).await?;
        self.process_expirations(now, &mut report).await?;
        self.notify_expiring_soon(now, &mut report).await?;
        self.notify_low_balance(now, &mut report).await?;

        tracing::info!(
            renewed = report.renewed,
            renewal_failed = report.renewal_failed,
            expired = report.expired,
            expiring_soon_notices = report.expiring_soon_notices,
            low_balance_notices = report.low_balance_notices,
            failures = report.failures,
            "Daily reconciliation finished"
        );
        Ok(report)
    }

    /// Warning checks only. Safe to run many times a day.
    pub async fn run_critical_checks_at(
        &self,
        now: NaiveDateTime,
    ) -> AppResult<ReconciliationReport> {
        let mut report = ReconciliationReport::default();

        self.notify_expiring_soon(now, &mut report).await?;
        self.notify_low_balance(now, &mut report).await?;

        tracing::debug!(
            expiring_soon_notices = report.expiring_soon_notices,
            low_balance_notices = report.low_balance_notices,
            failures = report.failures,
            "Critical checks finished"
        );
        Ok(report)
    }

    async fn process_renewals(
        &self,
        now: NaiveDateTime,
        report: &mut ReconciliationReport,
    ) -> AppResult<()> {
        let due = self.subscription_repo.list_due(now, true).await?;
        for sub in due {
            let Some(end_date) = sub.end_date else {
                continue;
            };
            match self
                .lifecycle
                .renew_subscription(sub.id, end_date, now)
                .await
            {
                Ok(RenewalOutcome::Renewed(_)) => report.renewed += 1,
                Ok(RenewalOutcome::Failed(_)) => report.renewal_failed += 1,
                Ok(RenewalOutcome::Skipped) => report.renewal_skipped += 1,
                Err(e) => {
                    tracing::error!(
                        subscription_id = %sub.id,
                        error = %e,
                        "Failed to renew subscription"
                    );
                    report.failures += 1;
                }
            }
        }
        Ok(())
    }

    async fn process_expirations(
        &self,
        now: NaiveDateTime,
        report: &mut ReconciliationReport,
    ) -> AppResult<()> {
        let due = self.subscription_repo.list_due(now, false).await?;
        for sub in due {
            match self.lifecycle.expire_subscription(sub.id, now).await {
                Ok(_) => report.expired += 1,
                Err(e) => {
                    tracing::error!(
                        subscription_id = %sub.id,
                        error = %e,
                        "Failed to expire subscription"
                    );
                    report.failures += 1;
                }
            }
        }
        Ok(())
    }

    async fn notify_expiring_soon(
        &self,
        now: NaiveDateTime,
        report: &mut ReconciliationReport,
    ) -> AppResult<()> {
        let until = now + Duration::days(self.expiring_soon_days);
        let expiring = self.subscription_repo.list_expiring(now, until).await?;
        for sub in expiring {
            let request = expiring_soon_request(&sub, now);
            match self.notifier.record(&request).await {
                Ok(true) => report.expiring_soon_notices += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        subscription_id = %sub.id,
                        error = %e,
                        "Failed to record expiring-soon notification"
                    );
                    report.failures += 1;
                }
            }
        }
        Ok(())
    }

    async fn notify_low_balance(
        &self,
        now: NaiveDateTime,
        report: &mut ReconciliationReport,
    ) -> AppResult<()> {
        let renewing = self.subscription_repo.list_active_auto_renewing().await?;
        for sub in renewing {
            match self.check_low_balance(&sub, now).await {
                Ok(true) => report.low_balance_notices += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        subscription_id = %sub.id,
                        error = %e,
                        "Failed to check balance for upcoming renewal"
                    );
                    report.failures += 1;
                }
            }
        }
        Ok(())
    }

    /// Returns true when a new low-balance notice was recorded.
    async fn check_low_balance(
        &self,
        sub: &SubscriptionProfile,
        now: NaiveDateTime,
    ) -> AppResult<bool> {
        let plan = self.plans.get_plan_for_renewal(sub.subscription_type).await?;
        let balance_cents = self.ledger.get_balance(sub.user_id).await?;
        if balance_cents >= plan.monthly_price_cents {
            return Ok(false);
        }

        let request = NotificationRequest::new(
            sub.user_id,
            NotificationType::LowBalance,
            format!(
                "Your balance does not cover the next {} renewal",
                sub.subscription_type
            ),
            serde_json::json!({
                "subscription_id": sub.id,
                "balance_cents": balance_cents,
                "required_cents": plan.monthly_price_cents,
                "renewal_date": sub.end_date,
            }),
        )
        .with_key(IdempotencyKey::for_day(
            sub.id,
            NotificationType::LowBalance,
            now.date(),
        ));
        self.notifier.record(&request).await
    }
}

fn expiring_soon_request(sub: &SubscriptionProfile, now: NaiveDateTime) -> NotificationRequest {
    let days_left = sub
        .end_date
        .map(|end| days_remaining(end, now))
        .unwrap_or(0);
    NotificationRequest::new(
        sub.user_id,
        NotificationType::SubscriptionExpiringSoon,
        format!(
            "Your {} subscription ends in {} day(s)",
            sub.subscription_type, days_left
        ),
        serde_json::json!({
            "subscription_id": sub.id,
            "end_date": sub.end_date,
            "auto_renewal": sub.auto_renewal,
            "days_remaining": days_left,
        }),
    )
    .with_key(IdempotencyKey::for_day(
        sub.id,
        NotificationType::SubscriptionExpiringSoon,
        now.date(),
    ))
}
