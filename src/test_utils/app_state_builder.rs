//! Use case and `AppState` builders backed by `InMemoryBillingStore`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderValue;
use secrecy::SecretString;

use crate::{
    adapters::http::app_state::AppState,
    application::use_cases::{
        ledger::LedgerGateway,
        plan_registry::PlanRegistryUseCases,
        pricing::PricingUseCases,
        reconciliation::{DEFAULT_EXPIRING_SOON_DAYS, ReconciliationUseCases},
        subscription_lifecycle::SubscriptionLifecycleUseCases,
    },
    infra::config::{AppConfig, ReconciliationConfig},
    test_utils::InMemoryBillingStore,
};

pub const TEST_ADMIN_TOKEN: &str = "test-admin-token-0123456789";

/// Every billing use case wired to one shared in-memory store.
pub struct BillingTestHarness {
    pub store: Arc<InMemoryBillingStore>,
    pub plans: PlanRegistryUseCases,
    pub pricing: PricingUseCases,
    pub ledger: LedgerGateway,
    pub lifecycle: SubscriptionLifecycleUseCases,
    pub reconciliation: ReconciliationUseCases,
}

impl BillingTestHarness {
    pub fn new(store: InMemoryBillingStore) -> Self {
        let store = Arc::new(store);

        let plans = PlanRegistryUseCases::new(store.clone());
        let pricing = PricingUseCases::new(plans.clone(), store.clone());
        let ledger = LedgerGateway::new(store.clone(), store.clone());
        let lifecycle = SubscriptionLifecycleUseCases::new(
            store.clone(),
            plans.clone(),
            pricing.clone(),
            ledger.clone(),
            store.clone(),
        );
        let reconciliation = ReconciliationUseCases::new(
            store.clone(),
            lifecycle.clone(),
            plans.clone(),
            ledger.clone(),
            store.clone(),
            DEFAULT_EXPIRING_SOON_DAYS,
        );

        Self {
            store,
            plans,
            pricing,
            ledger,
            lifecycle,
            reconciliation,
        }
    }
}

/// Builder for a test `AppState` with in-memory persistence.
pub struct TestAppStateBuilder {
    store: InMemoryBillingStore,
    admin_token: String,
}

impl TestAppStateBuilder {
    pub fn new() -> Self {
        Self {
            store: InMemoryBillingStore::new(),
            admin_token: TEST_ADMIN_TOKEN.to_string(),
        }
    }

    pub fn with_store(mut self, store: InMemoryBillingStore) -> Self {
        self.store = store;
        self
    }

    pub fn with_admin_token(mut self, token: &str) -> Self {
        self.admin_token = token.to_string();
        self
    }

    pub fn build(self) -> AppState {
        self.build_with_store().0
    }

    /// Build the state and keep a handle on the store for assertions.
    pub fn build_with_store(self) -> (AppState, Arc<InMemoryBillingStore>) {
        let harness = BillingTestHarness::new(self.store);

        let config = Arc::new(AppConfig {
            database_url: String::new(),
            db_max_connections: 1,
            run_migrations: false,
            bind_addr: "127.0.0.1:3001".parse::<SocketAddr>().unwrap(),
            cors_origin: HeaderValue::from_static("http://localhost:3000"),
            admin_api_token: SecretString::new(self.admin_token.into()),
            reconciliation: ReconciliationConfig {
                enabled: false,
                daily_hour_utc: 0,
                critical_check_interval: Duration::from_secs(3600),
                expiring_soon_days: DEFAULT_EXPIRING_SOON_DAYS,
            },
            log_file: None,
        });

        let state = AppState {
            config,
            plan_use_cases: Arc::new(harness.plans),
            pricing_use_cases: Arc::new(harness.pricing),
            ledger_gateway: Arc::new(harness.ledger),
            subscription_use_cases: Arc::new(harness.lifecycle),
            reconciliation_use_cases: Arc::new(harness.reconciliation),
        };
        (state, harness.store)
    }
}

impl Default for TestAppStateBuilder {
    fn default() -> Self {
        Self::new()
    }
}
