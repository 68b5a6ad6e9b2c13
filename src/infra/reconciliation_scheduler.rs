use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDateTime, NaiveTime, Utc};
use tokio::time::{Instant, MissedTickBehavior, interval, interval_at};
use tracing::{error, info};

use crate::application::use_cases::reconciliation::ReconciliationUseCases;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Next occurrence of `hour_utc:00` strictly after `now`.
pub fn next_daily_run(now: NaiveDateTime, hour_utc: u32) -> NaiveDateTime {
    let at = NaiveTime::from_hms_opt(hour_utc.min(23), 0, 0).unwrap_or(NaiveTime::MIN);
    let today = now.date().and_time(at);
    if today > now {
        today
    } else {
        today + chrono::Duration::days(1)
    }
}

/// Drive the daily reconciliation run and the high-frequency critical checks.
///
/// Runs are never retried within a tick; missed ticks are skipped.
pub async fn run_reconciliation_scheduler(
    reconciliation: Arc<ReconciliationUseCases>,
    daily_hour_utc: u32,
    critical_check_interval: Duration,
) {
    let now = Utc::now().naive_utc();
    let first_daily = next_daily_run(now, daily_hour_utc);
    let wait = (first_daily - now).to_std().unwrap_or(Duration::ZERO);

    let mut daily_ticker = interval_at(Instant::now() + wait, DAY);
    daily_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut critical_ticker = interval(critical_check_interval);
    critical_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        next_daily_run = %first_daily,
        critical_check_interval_secs = critical_check_interval.as_secs(),
        "Reconciliation scheduler started"
    );

    loop {
        tokio::select! {
            _ = daily_ticker.tick() => {
                if let Err(e) = reconciliation.run_daily().await {
                    error!(error = %e, "Daily reconciliation aborted");
                }
            }
            _ = critical_ticker.tick() => {
                if let Err(e) = reconciliation.run_critical_checks().await {
                    error!(error = %e, "Critical checks aborted");
                }
            }
        }
    }
}
