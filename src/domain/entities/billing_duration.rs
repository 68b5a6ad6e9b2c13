use chrono::{Months, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Purchasable subscription length. Only 1, 3 and 12 months are sold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingDuration {
    Monthly,
    Quarterly,
    Yearly,
}

impl BillingDuration {
    pub fn from_months(months: i32) -> Option<Self> {
        match months {
            1 => Some(BillingDuration::Monthly),
            3 => Some(BillingDuration::Quarterly),
            12 => Some(BillingDuration::Yearly),
            _ => None,
        }
    }

    pub fn months(&self) -> i32 {
        match self {
            BillingDuration::Monthly => 1,
            BillingDuration::Quarterly => 3,
            BillingDuration::Yearly => 12,
        }
    }

    /// Calendar-month addition, clamped to the last day of the target month.
    pub fn add_to(&self, from: NaiveDateTime) -> Option<NaiveDateTime> {
        from.checked_add_months(Months::new(self.months() as u32))
    }
}
