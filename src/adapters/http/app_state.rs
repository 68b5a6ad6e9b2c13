use std::sync::Arc;

use crate::{
    application::use_cases::{
        ledger::LedgerGateway, plan_registry::PlanRegistryUseCases, pricing::PricingUseCases,
        reconciliation::ReconciliationUseCases,
        subscription_lifecycle::SubscriptionLifecycleUseCases,
    },
    infra::config::AppConfig,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub plan_use_cases: Arc<PlanRegistryUseCases>,
    pub pricing_use_cases: Arc<PricingUseCases>,
    pub ledger_gateway: Arc<LedgerGateway>,
    pub subscription_use_cases: Arc<SubscriptionLifecycleUseCases>,
    pub reconciliation_use_cases: Arc<ReconciliationUseCases>,
}
