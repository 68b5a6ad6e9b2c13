use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// How a subscription is paid for.
///
/// Only `Balance` is settled internally. Every other method is captured by an
/// external step before the ledger records it.
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
#[sqlx(type_name = "payment_method", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum PaymentMethod {
    Balance,
    Card,
    Crypto,
    EWallet,
}

impl PaymentMethod {
    pub fn is_balance(&self) -> bool {
        matches!(self, PaymentMethod::Balance)
    }
}
