//! Read models served to account and admin screens.

use super::plan::{BillingPeriod, PlanId};
use super::subscription::SubscriptionStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Visual tone of a status badge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BadgeTone {
    Success,
    Info,
    Warning,
    Danger,
    Neutral,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusBadge {
    pub label: &'static str,
    pub tone: BadgeTone,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanSummary {
    pub id: PlanId,
    pub name: String,
    pub price: i64,
    pub billing_period: BillingPeriod,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingChangeView {
    pub plan: PlanSummary,
    pub effective_at: DateTime<Utc>,
}

/// Subscription as displayed to its owner.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionView {
    pub subscription_id: Uuid,
    pub user_id: Uuid,
    pub plan: PlanSummary,
    pub status: SubscriptionStatus,
    pub badge: StatusBadge,
    pub quantity: u32,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub next_billing_date: Option<DateTime<Utc>>,
    pub next_billing_amount: Option<i64>,
    pub trial_days_remaining: Option<i64>,
    pub cancel_at_period_end: bool,
    pub ends_at: Option<DateTime<Utc>>,
    pub can_resume: bool,
    pub amount_due: i64,
    /// Minor units of a charge the gateway has not settled yet.
    pub payment_pending: Option<i64>,
    pub pending_change: Option<PendingChangeView>,
    pub archived: bool,
}
