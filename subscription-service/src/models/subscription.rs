//! Subscription aggregate.

use super::plan::PlanId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Canonical subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Incomplete,
    IncompleteExpired,
    Active,
    PastDue,
    Unpaid,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::IncompleteExpired => "incomplete_expired",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "trialing" => Some(SubscriptionStatus::Trialing),
            "incomplete" => Some(SubscriptionStatus::Incomplete),
            "incomplete_expired" => Some(SubscriptionStatus::IncompleteExpired),
            "active" => Some(SubscriptionStatus::Active),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "unpaid" => Some(SubscriptionStatus::Unpaid),
            "canceled" => Some(SubscriptionStatus::Canceled),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happens to a `past_due` subscription once its grace deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PastDuePolicy {
    Unpaid,
    Canceled,
}

impl PastDuePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PastDuePolicy::Unpaid => "unpaid",
            PastDuePolicy::Canceled => "canceled",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "unpaid" => Some(PastDuePolicy::Unpaid),
            "canceled" | "cancelled" => Some(PastDuePolicy::Canceled),
            _ => None,
        }
    }

    pub fn terminal_status(&self) -> SubscriptionStatus {
        match self {
            PastDuePolicy::Unpaid => SubscriptionStatus::Unpaid,
            PastDuePolicy::Canceled => SubscriptionStatus::Canceled,
        }
    }
}

/// Plan change scheduled for the next rollover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPlanChange {
    pub target_plan_id: PlanId,
    pub effective_at: DateTime<Utc>,
}

/// Charge the pending charge settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingChargeKind {
    TrialConversion,
    Renewal,
    Retry,
    Upgrade,
}

impl PendingChargeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingChargeKind::TrialConversion => "trial_conversion",
            PendingChargeKind::Renewal => "renewal",
            PendingChargeKind::Retry => "retry",
            PendingChargeKind::Upgrade => "upgrade",
        }
    }
}

/// Charge the gateway accepted without settling.
///
/// While set, the subscription keeps the status it had when the charge was
/// submitted and waits for a payment result to settle it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCharge {
    pub kind: PendingChargeKind,
    /// Minor units.
    pub amount: i64,
    pub idempotency_key: String,
    pub submitted_at: DateTime<Utc>,
}

/// Subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: PlanId,
    pub status: SubscriptionStatus,
    pub quantity: u32,
    pub payment_method: String,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub cancel_at_period_end: bool,
    /// Instant the subscription stops (or stopped) providing service.
    pub ends_at: Option<DateTime<Utc>>,
    pub pending_change: Option<PendingPlanChange>,
    pub grace_deadline: Option<DateTime<Utc>>,
    pub next_payment_attempt_at: Option<DateTime<Utc>>,
    pub failed_payment_attempts: u32,
    /// Outstanding minor units while `incomplete` or `past_due`.
    pub amount_due: i64,
    #[serde(default)]
    pub pending_charge: Option<PendingCharge>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl Subscription {
    /// Terminal subscriptions no longer count against the one-per-user rule.
    ///
    /// `canceled` stays non-terminal until `ends_at` so it can still be resumed.
    pub fn is_terminal(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            SubscriptionStatus::IncompleteExpired | SubscriptionStatus::Unpaid => true,
            SubscriptionStatus::Canceled => self.ends_at.map_or(true, |ends_at| now >= ends_at),
            _ => false,
        }
    }

    /// Instant the subscription became terminal, if it has.
    pub fn terminated_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.is_terminal(now) {
            return None;
        }
        Some(self.ends_at.unwrap_or(self.updated_at))
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    /// A cancellation can still be undone.
    pub fn in_resume_window(&self, now: DateTime<Utc>) -> bool {
        let scheduled = self.status == SubscriptionStatus::Canceled || self.cancel_at_period_end;
        scheduled && self.ends_at.is_some_and(|ends_at| now < ends_at)
    }

    /// Plan the subscription bills at on its next rollover.
    pub fn plan_at_rollover(&self) -> &PlanId {
        self.pending_change
            .as_ref()
            .map(|change| &change.target_plan_id)
            .unwrap_or(&self.plan_id)
    }
}

/// Input for creating a subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSubscription {
    pub user_id: Uuid,
    pub plan_id: PlanId,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    pub payment_method: String,
}

fn default_quantity() -> u32 {
    1
}

/// Filter parameters for listing subscriptions.
#[derive(Debug, Clone, Default)]
pub struct ListSubscriptionsFilter {
    pub user_id: Option<Uuid>,
    pub status: Option<SubscriptionStatus>,
    pub plan_id: Option<PlanId>,
    pub page_size: usize,
    pub page_token: Option<Uuid>,
}

impl ListSubscriptionsFilter {
    pub fn matches(&self, subscription: &Subscription) -> bool {
        self.user_id.map_or(true, |id| subscription.user_id == id)
            && self.status.map_or(true, |status| subscription.status == status)
            && self
                .plan_id
                .as_ref()
                .map_or(true, |plan_id| &subscription.plan_id == plan_id)
    }
}
