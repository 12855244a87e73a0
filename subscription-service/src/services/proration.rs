//! Plan change calculator.
//!
//! All amounts are integer minor units. Fractions of a period are kept as
//! exact second counts and rounded up once, after multiplying by the price.

use crate::models::Plan;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanChangeKind {
    Upgrade,
    Downgrade,
}

/// Quote for moving a subscription from one plan to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProrationQuote {
    pub kind: PlanChangeKind,
    /// Amount to collect now. Never negative.
    pub amount: i64,
    /// Value of the remaining time on the target plan.
    pub charge: i64,
    /// Unused value of the current plan.
    pub credit: i64,
    pub effective_at: DateTime<Utc>,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

/// Rank two plans by price per nominal day. Equal rank counts as a downgrade.
pub fn classify(current: &Plan, target: &Plan) -> PlanChangeKind {
    match target
        .normalized_daily_price()
        .cmp(&current.normalized_daily_price())
    {
        Ordering::Greater => PlanChangeKind::Upgrade,
        _ => PlanChangeKind::Downgrade,
    }
}

/// Remaining and total seconds of the period, clamped so remaining ∈ [0, total].
pub fn remaining_fraction(
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    now: DateTime<Utc>,
) -> (i64, i64) {
    let total = (period_end - period_start).num_seconds().max(0);
    let remaining = (period_end - now).num_seconds().clamp(0, total);
    (remaining, total)
}

/// `ceil(amount × numerator / denominator)` without floating point.
fn ceil_share(amount: i64, numerator: i64, denominator: i64) -> i64 {
    if denominator <= 0 || numerator <= 0 || amount <= 0 {
        return 0;
    }
    let product = i128::from(amount) * i128::from(numerator);
    let denominator = i128::from(denominator);
    let quotient = (product + denominator - 1) / denominator;
    i64::try_from(quotient).unwrap_or(i64::MAX)
}

/// Immediate upgrade quote.
///
/// Within the same billing period the subscriber pays the difference for the
/// remaining fraction and keeps the current period end. Across periods the
/// target period starts fresh now and the unused credit is deducted from its
/// full price.
pub fn upgrade_quote(
    current: &Plan,
    target: &Plan,
    quantity: u32,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    now: DateTime<Utc>,
) -> ProrationQuote {
    let (remaining, total) = remaining_fraction(period_start, period_end, now);
    let credit = ceil_share(current.period_amount(quantity), remaining, total);

    if current.billing_period == target.billing_period {
        let charge = ceil_share(target.period_amount(quantity), remaining, total);
        ProrationQuote {
            kind: PlanChangeKind::Upgrade,
            amount: (charge - credit).max(0),
            charge,
            credit,
            effective_at: now,
            period_start,
            period_end,
        }
    } else {
        let charge = target.period_amount(quantity);
        ProrationQuote {
            kind: PlanChangeKind::Upgrade,
            amount: (charge - credit).max(0),
            charge,
            credit,
            effective_at: now,
            period_start: now,
            period_end: target.billing_period.advance(now),
        }
    }
}
