//! Plan catalog entries.

use chrono::{DateTime, Months, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest trial a plan may offer or an extension may add, in days.
pub const MAX_TRIAL_DAYS: u32 = 3650;

/// Catalog identifier of a plan, e.g. `pro-monthly`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(String);

impl PlanId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlanId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Billing period of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingPeriod {
    Monthly,
    Yearly,
}

impl BillingPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingPeriod::Monthly => "monthly",
            BillingPeriod::Yearly => "yearly",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "monthly" => Some(BillingPeriod::Monthly),
            "yearly" => Some(BillingPeriod::Yearly),
            _ => None,
        }
    }

    /// Calendar months covered by one period.
    pub fn months(&self) -> u32 {
        match self {
            BillingPeriod::Monthly => 1,
            BillingPeriod::Yearly => 12,
        }
    }

    /// Nominal length in days used to normalize prices across periods.
    pub fn nominal_days(&self) -> u32 {
        match self {
            BillingPeriod::Monthly => 30,
            BillingPeriod::Yearly => 365,
        }
    }

    /// End of a period starting at `start`.
    ///
    /// Calendar arithmetic: Jan 31 + 1 month clamps to the last day of February.
    pub fn advance(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        start
            .checked_add_months(Months::new(self.months()))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Immutable catalog entry. Prices are integer minor units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub name: String,
    pub price: i64,
    pub billing_period: BillingPeriod,
    #[serde(default)]
    pub trial_days: u32,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub upgrades_to: Vec<PlanId>,
    #[serde(default)]
    pub downgrades_to: Vec<PlanId>,
    /// Retired plans stay resolvable for existing subscribers.
    #[serde(default)]
    pub retired: bool,
}

impl Plan {
    pub fn is_subscribable(&self) -> bool {
        !self.retired
    }

    pub fn has_trial(&self) -> bool {
        self.trial_days > 0
    }

    pub fn can_upgrade_to(&self, target: &PlanId) -> bool {
        self.upgrades_to.contains(target)
    }

    pub fn can_downgrade_to(&self, target: &PlanId) -> bool {
        self.downgrades_to.contains(target)
    }

    /// Charge for one full period at the given quantity.
    pub fn period_amount(&self, quantity: u32) -> i64 {
        self.price.saturating_mul(i64::from(quantity))
    }

    /// Price per nominal day, used to rank plans with different periods.
    pub fn normalized_daily_price(&self) -> Decimal {
        Decimal::from(self.price) / Decimal::from(self.billing_period.nominal_days())
    }

    /// Monthly recurring value of one subscription to this plan.
    pub fn monthly_value(&self, quantity: u32) -> Decimal {
        Decimal::from(self.period_amount(quantity)) / Decimal::from(self.billing_period.months())
    }
}
