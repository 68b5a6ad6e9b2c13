pub mod ledger;
pub mod plan_registry;
pub mod pricing;
pub mod reconciliation;
pub mod subscription_lifecycle;
