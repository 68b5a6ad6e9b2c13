//! Test utilities for use case and HTTP-level testing.
//!
//! This module provides:
//! - Test data factories for plans, promo codes and subscriptions
//! - An in-memory store implementing every billing repository and the
//!   notification sink
//! - Builders wiring use cases and `AppState` on top of that store

mod app_state_builder;
mod billing_mocks;
mod factories;

pub use app_state_builder::*;
pub use billing_mocks::*;
pub use factories::*;
