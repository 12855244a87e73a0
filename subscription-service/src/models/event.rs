//! Billing event model.

use super::plan::PlanId;
use super::subscription::SubscriptionStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of billing event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingEventKind {
    Created,
    TrialStarted,
    TrialConverted,
    Activated,
    Renewed,
    Upgraded,
    Downgraded,
    Canceled,
    Resumed,
    PaymentFailed,
    PaymentRecovered,
    /// Charge accepted by the gateway, result not yet known.
    PaymentPending,
    /// Pending charge confirmed without a status change.
    PaymentSettled,
    Expired,
    TrialExtended,
    PlanChangeScheduled,
    PlanChangeCanceled,
    CancellationScheduled,
}

impl BillingEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingEventKind::Created => "created",
            BillingEventKind::TrialStarted => "trial_started",
            BillingEventKind::TrialConverted => "trial_converted",
            BillingEventKind::Activated => "activated",
            BillingEventKind::Renewed => "renewed",
            BillingEventKind::Upgraded => "upgraded",
            BillingEventKind::Downgraded => "downgraded",
            BillingEventKind::Canceled => "canceled",
            BillingEventKind::Resumed => "resumed",
            BillingEventKind::PaymentFailed => "payment_failed",
            BillingEventKind::PaymentRecovered => "payment_recovered",
            BillingEventKind::PaymentPending => "payment_pending",
            BillingEventKind::PaymentSettled => "payment_settled",
            BillingEventKind::Expired => "expired",
            BillingEventKind::TrialExtended => "trial_extended",
            BillingEventKind::PlanChangeScheduled => "plan_change_scheduled",
            BillingEventKind::PlanChangeCanceled => "plan_change_canceled",
            BillingEventKind::CancellationScheduled => "cancellation_scheduled",
        }
    }
}

/// Event produced by a transition, before the log assigns identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBillingEvent {
    pub subscription_id: Uuid,
    pub user_id: Uuid,
    pub kind: BillingEventKind,
    pub occurred_at: DateTime<Utc>,
    /// Minor units actually charged, if any.
    pub amount: Option<i64>,
    /// Plan in effect after the event.
    pub plan_id: PlanId,
    pub quantity: u32,
    pub from_status: Option<SubscriptionStatus>,
    pub to_status: SubscriptionStatus,
}

/// Immutable, appended billing event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingEvent {
    pub id: Uuid,
    pub sequence: u64,
    pub subscription_id: Uuid,
    pub user_id: Uuid,
    pub kind: BillingEventKind,
    pub occurred_at: DateTime<Utc>,
    pub amount: Option<i64>,
    pub plan_id: PlanId,
    pub quantity: u32,
    pub from_status: Option<SubscriptionStatus>,
    pub to_status: SubscriptionStatus,
    pub dedup_key: String,
}

impl BillingEvent {
    pub fn from_new(event: NewBillingEvent, sequence: u64, dedup_key: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence,
            subscription_id: event.subscription_id,
            user_id: event.user_id,
            kind: event.kind,
            occurred_at: event.occurred_at,
            amount: event.amount,
            plan_id: event.plan_id,
            quantity: event.quantity,
            from_status: event.from_status,
            to_status: event.to_status,
            dedup_key: dedup_key.to_string(),
        }
    }

    /// The event moved the subscription out of a trial without converting it.
    pub fn ends_trial_unconverted(&self) -> bool {
        self.kind != BillingEventKind::TrialConverted
            && self.from_status == Some(SubscriptionStatus::Trialing)
            && self.to_status != SubscriptionStatus::Trialing
    }
}

/// Selection applied when reading the log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventQuery {
    pub subscription_id: Option<Uuid>,
    /// Inclusive lower bound on `occurred_at`.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `occurred_at`.
    pub until: Option<DateTime<Utc>>,
}

impl EventQuery {
    pub fn for_subscription(subscription_id: Uuid) -> Self {
        Self {
            subscription_id: Some(subscription_id),
            ..Default::default()
        }
    }

    pub fn since(mut self, since: Option<DateTime<Utc>>) -> Self {
        self.since = since;
        self
    }

    pub fn until(mut self, until: Option<DateTime<Utc>>) -> Self {
        self.until = until;
        self
    }

    pub fn matches(&self, event: &BillingEvent) -> bool {
        self.subscription_id
            .map_or(true, |id| event.subscription_id == id)
            && self.since.map_or(true, |since| event.occurred_at >= since)
            && self.until.map_or(true, |until| event.occurred_at < until)
    }
}
