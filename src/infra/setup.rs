use std::fs::File;
use std::sync::Arc;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{
    adapters::http::app_state::AppState,
    application::use_cases::{
        ledger::LedgerGateway, plan_registry::PlanRegistryUseCases, pricing::PricingUseCases,
        reconciliation::ReconciliationUseCases,
        subscription_lifecycle::SubscriptionLifecycleUseCases,
    },
    infra::{config::AppConfig, error::InfraError, postgres_persistence},
};

pub async fn init_app_state(config: AppConfig) -> Result<AppState, InfraError> {
    let postgres_arc = Arc::new(postgres_persistence(&config).await?);

    let plan_use_cases = PlanRegistryUseCases::new(postgres_arc.clone());
    let pricing_use_cases = PricingUseCases::new(plan_use_cases.clone(), postgres_arc.clone());
    let ledger_gateway = LedgerGateway::new(postgres_arc.clone(), postgres_arc.clone());
    let subscription_use_cases = SubscriptionLifecycleUseCases::new(
        postgres_arc.clone(),
        plan_use_cases.clone(),
        pricing_use_cases.clone(),
        ledger_gateway.clone(),
        postgres_arc.clone(),
    );
    let reconciliation_use_cases = ReconciliationUseCases::new(
        postgres_arc.clone(),
        subscription_use_cases.clone(),
        plan_use_cases.clone(),
        ledger_gateway.clone(),
        postgres_arc,
        config.reconciliation.expiring_soon_days,
    );

    Ok(AppState {
        config: Arc::new(config),
        plan_use_cases: Arc::new(plan_use_cases),
        pricing_use_cases: Arc::new(pricing_use_cases),
        ledger_gateway: Arc::new(ledger_gateway),
        subscription_use_cases: Arc::new(subscription_use_cases),
        reconciliation_use_cases: Arc::new(reconciliation_use_cases),
    })
}

/// Console logs always; structured JSON logs too when `log_file` is set.
///
/// The `billing_audit` target carries one event per recorded charge.
pub fn init_tracing(log_file: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "subscription_billing=debug,billing_audit=info,tower_http=info".into());

    let console_layer = fmt::layer()
        .with_target(false)
        .with_level(true)
        .pretty();

    let json_layer = log_file.and_then(|path| match File::create(path) {
        Ok(file) => Some(
            fmt::layer()
                .json()
                .with_writer(Arc::new(file))
                .with_current_span(true)
                .with_span_list(true),
        ),
        Err(e) => {
            eprintln!("cannot create log file {}: {}", path, e);
            None
        }
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(json_layer)
        .try_init()
        .ok();
}
