//! Domain models for subscription-service.

pub mod event;
pub mod plan;
pub mod subscription;
pub mod view;

pub use event::{BillingEvent, BillingEventKind, EventQuery, NewBillingEvent};
pub use plan::{BillingPeriod, Plan, PlanId, MAX_TRIAL_DAYS};
pub use subscription::{
    CreateSubscription, ListSubscriptionsFilter, PastDuePolicy, PendingCharge, PendingChargeKind,
    PendingPlanChange, Subscription, SubscriptionStatus,
};
pub use view::{BadgeTone, PendingChangeView, PlanSummary, StatusBadge, SubscriptionView};
