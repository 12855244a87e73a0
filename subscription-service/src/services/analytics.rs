//! Revenue analytics recomputed from the event log.
//!
//! The state of a subscription at instant `t` is taken from its latest event
//! strictly before `t`, so `[from, to)` windows tile without overlap.

use super::catalog::PlanCatalog;
use crate::error::SubscriptionError;
use crate::models::{BillingEvent, BillingEventKind, SubscriptionStatus};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalyticsWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl AnalyticsWindow {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Self, SubscriptionError> {
        if from >= to {
            return Err(SubscriptionError::InvalidRequest(format!(
                "analytics window is empty: from {from} is not before to {to}"
            )));
        }
        Ok(Self { from, to })
    }

    fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from <= at && at < self.to
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyticsReport {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    /// Minor units per month, rounded to two decimal places.
    pub mrr: Decimal,
    pub churn_rate: Decimal,
    pub trial_conversion_rate: Decimal,
    /// Minor units, rounded to two decimal places.
    pub average_lifetime_value: Decimal,
    pub active_at_start: u64,
    pub active_at_end: u64,
    /// Every `canceled` event in the window, whatever the prior status.
    pub cancellations: u64,
    /// Subscriptions active at `from` that were canceled inside the window.
    pub churned: u64,
    pub trials_converted: u64,
    pub trials_lost: u64,
    pub terminated: u64,
}

fn ratio(numerator: u64, denominator: u64) -> Decimal {
    if denominator == 0 {
        return Decimal::ZERO;
    }
    (Decimal::from(numerator) / Decimal::from(denominator)).round_dp(4)
}

/// Events grouped per subscription, each group in log order.
fn histories(events: &[BillingEvent]) -> BTreeMap<Uuid, Vec<&BillingEvent>> {
    let mut grouped: BTreeMap<Uuid, Vec<&BillingEvent>> = BTreeMap::new();
    for event in events {
        grouped.entry(event.subscription_id).or_default().push(event);
    }
    for history in grouped.values_mut() {
        history.sort_by_key(|event| (event.occurred_at, event.sequence));
    }
    grouped
}

/// Latest event of a history strictly before `at`.
fn state_before<'e>(history: &[&'e BillingEvent], at: DateTime<Utc>) -> Option<&'e BillingEvent> {
    history
        .iter()
        .take_while(|event| event.occurred_at < at)
        .last()
        .copied()
}

fn ends_subscription(event: &BillingEvent) -> bool {
    matches!(
        event.kind,
        BillingEventKind::Canceled | BillingEventKind::Expired
    ) && matches!(
        event.to_status,
        SubscriptionStatus::Canceled
            | SubscriptionStatus::Unpaid
            | SubscriptionStatus::IncompleteExpired
    )
}

/// Compute the report for `window` from the full event history.
pub fn compute(
    events: &[BillingEvent],
    catalog: &PlanCatalog,
    window: AnalyticsWindow,
) -> Result<AnalyticsReport, SubscriptionError> {
    let grouped = histories(events);

    let mut mrr = Decimal::ZERO;
    let mut active_at_start = 0u64;
    let mut churned = 0u64;
    let mut active_at_end = 0u64;
    let mut lifetime_totals: HashMap<Uuid, i64> = HashMap::new();
    let mut terminated: HashSet<Uuid> = HashSet::new();

    for (subscription_id, history) in &grouped {
        if state_before(history, window.from)
            .is_some_and(|event| event.to_status == SubscriptionStatus::Active)
        {
            active_at_start += 1;
            if history.iter().any(|event| {
                window.contains(event.occurred_at) && event.kind == BillingEventKind::Canceled
            }) {
                churned += 1;
            }
        }

        if let Some(event) = state_before(history, window.to)
            .filter(|event| event.to_status == SubscriptionStatus::Active)
        {
            let plan = catalog.resolve_existing(&event.plan_id)?;
            mrr += plan.monthly_value(event.quantity);
            active_at_end += 1;
        }

        if history
            .iter()
            .any(|event| window.contains(event.occurred_at) && ends_subscription(event))
        {
            terminated.insert(*subscription_id);
            let total: i64 = history.iter().filter_map(|event| event.amount).sum();
            lifetime_totals.insert(*subscription_id, total);
        }
    }

    let in_window: Vec<&BillingEvent> = events
        .iter()
        .filter(|event| window.contains(event.occurred_at))
        .collect();
    let cancellations = in_window
        .iter()
        .filter(|event| event.kind == BillingEventKind::Canceled)
        .count() as u64;
    let trials_converted = in_window
        .iter()
        .filter(|event| event.kind == BillingEventKind::TrialConverted)
        .count() as u64;
    let trials_lost = in_window
        .iter()
        .filter(|event| event.ends_trial_unconverted())
        .count() as u64;

    let average_lifetime_value = if terminated.is_empty() {
        Decimal::ZERO
    } else {
        let sum: i64 = lifetime_totals.values().sum();
        (Decimal::from(sum) / Decimal::from(terminated.len() as u64)).round_dp(2)
    };

    Ok(AnalyticsReport {
        from: window.from,
        to: window.to,
        mrr: mrr.round_dp(2),
        churn_rate: ratio(churned, active_at_start),
        trial_conversion_rate: ratio(trials_converted, trials_converted + trials_lost),
        average_lifetime_value,
        active_at_start,
        active_at_end,
        cancellations,
        churned,
        trials_converted,
        trials_lost,
        terminated: terminated.len() as u64,
    })
}
