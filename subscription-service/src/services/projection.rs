//! Status badges and subscription view models.

use super::catalog::PlanCatalog;
use crate::error::SubscriptionError;
use crate::models::{
    BadgeTone, PendingChangeView, Plan, PlanSummary, StatusBadge, Subscription,
    SubscriptionStatus, SubscriptionView,
};
use chrono::{DateTime, Utc};

pub fn status_badge(status: SubscriptionStatus, cancel_at_period_end: bool) -> StatusBadge {
    let (label, tone) = match status {
        SubscriptionStatus::Active if cancel_at_period_end => ("Canceling", BadgeTone::Warning),
        SubscriptionStatus::Trialing if cancel_at_period_end => {
            ("Trial ending", BadgeTone::Warning)
        }
        SubscriptionStatus::Active => ("Active", BadgeTone::Success),
        SubscriptionStatus::Trialing => ("Trial", BadgeTone::Info),
        SubscriptionStatus::Incomplete => ("Incomplete", BadgeTone::Warning),
        SubscriptionStatus::IncompleteExpired => ("Expired", BadgeTone::Neutral),
        SubscriptionStatus::PastDue => ("Past due", BadgeTone::Warning),
        SubscriptionStatus::Unpaid => ("Unpaid", BadgeTone::Danger),
        SubscriptionStatus::Canceled => ("Canceled", BadgeTone::Neutral),
    };
    StatusBadge { label, tone }
}

pub fn plan_summary(plan: &Plan) -> PlanSummary {
    PlanSummary {
        id: plan.id.clone(),
        name: plan.name.clone(),
        price: plan.price,
        billing_period: plan.billing_period,
    }
}

/// Whole days left in a trial, rounded up.
fn trial_days_remaining(trial_ends_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let seconds = (trial_ends_at - now).num_seconds().max(0);
    (seconds + 86_399) / 86_400
}

pub fn project(
    sub: &Subscription,
    catalog: &PlanCatalog,
    now: DateTime<Utc>,
) -> Result<SubscriptionView, SubscriptionError> {
    let plan = catalog.resolve_existing(&sub.plan_id)?;
    let pending_change = match &sub.pending_change {
        Some(change) => Some(PendingChangeView {
            plan: plan_summary(catalog.resolve_existing(&change.target_plan_id)?),
            effective_at: change.effective_at,
        }),
        None => None,
    };

    let renews = !sub.cancel_at_period_end;
    let (next_billing_date, next_billing_amount) = match sub.status {
        SubscriptionStatus::Active | SubscriptionStatus::Trialing if renews => {
            let rollover_plan = catalog.resolve_existing(sub.plan_at_rollover())?;
            let date = match sub.status {
                SubscriptionStatus::Trialing => sub.trial_ends_at,
                _ => Some(sub.current_period_end),
            };
            (date, Some(rollover_plan.period_amount(sub.quantity)))
        }
        SubscriptionStatus::PastDue => (sub.next_payment_attempt_at, Some(sub.amount_due)),
        SubscriptionStatus::Incomplete => (None, Some(sub.amount_due)),
        _ => (None, None),
    };

    Ok(SubscriptionView {
        subscription_id: sub.id,
        user_id: sub.user_id,
        plan: plan_summary(plan),
        status: sub.status,
        badge: status_badge(sub.status, sub.cancel_at_period_end),
        quantity: sub.quantity,
        current_period_start: sub.current_period_start,
        current_period_end: sub.current_period_end,
        next_billing_date,
        next_billing_amount,
        trial_days_remaining: sub
            .trial_ends_at
            .filter(|_| sub.status == SubscriptionStatus::Trialing)
            .map(|end| trial_days_remaining(end, now)),
        cancel_at_period_end: sub.cancel_at_period_end,
        ends_at: sub.ends_at,
        can_resume: sub.in_resume_window(now),
        amount_due: sub.amount_due,
        payment_pending: sub.pending_charge.as_ref().map(|charge| charge.amount),
        pending_change,
        archived: sub.is_archived(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BillingPeriod, PendingPlanChange, PlanId};
    use chrono::{Duration, TimeZone};
    use uuid::Uuid;

    fn catalog() -> PlanCatalog {
        let plan = |id: &str, price| Plan {
            id: PlanId::new(id),
            name: id.to_uppercase(),
            price,
            billing_period: BillingPeriod::Monthly,
            trial_days: 14,
            features: vec![],
            upgrades_to: vec![],
            downgrades_to: vec![],
            retired: false,
        };
        PlanCatalog::from_plans(vec![plan("basic", 2000), plan("pro", 5000)]).unwrap()
    }

    fn trialing(now: DateTime<Utc>) -> Subscription {
        Subscription {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            plan_id: PlanId::new("pro"),
            status: SubscriptionStatus::Trialing,
            quantity: 2,
            payment_method: "pm_card".to_string(),
            trial_ends_at: Some(now + Duration::days(14)),
            current_period_start: now,
            current_period_end: now + Duration::days(14),
            cancel_at_period_end: false,
            ends_at: None,
            pending_change: None,
            grace_deadline: None,
            next_payment_attempt_at: None,
            failed_payment_attempts: 0,
            amount_due: 0,
            pending_charge: None,
            created_at: now,
            updated_at: now,
            archived_at: None,
            version: 1,
        }
    }

    #[test]
    fn badge_reflects_scheduled_cancellation() {
        assert_eq!(
            status_badge(SubscriptionStatus::Active, true),
            StatusBadge {
                label: "Canceling",
                tone: BadgeTone::Warning
            }
        );
        assert_eq!(
            status_badge(SubscriptionStatus::Unpaid, false).tone,
            BadgeTone::Danger
        );
    }

    #[test]
    fn trial_view_bills_pending_plan_at_trial_end() {
        let now = Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).unwrap();
        let mut sub = trialing(now);
        sub.pending_change = Some(PendingPlanChange {
            target_plan_id: PlanId::new("basic"),
            effective_at: now + Duration::days(14),
        });

        let view = project(&sub, &catalog(), now + Duration::hours(1)).unwrap();
        assert_eq!(view.trial_days_remaining, Some(14));
        assert_eq!(view.next_billing_date, sub.trial_ends_at);
        assert_eq!(view.next_billing_amount, Some(4000));
        assert_eq!(
            view.pending_change.map(|change| change.plan.name),
            Some("BASIC".to_string())
        );
    }

    #[test]
    fn canceling_subscription_has_no_next_bill() {
        let now = Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).unwrap();
        let mut sub = trialing(now);
        sub.cancel_at_period_end = true;
        sub.ends_at = sub.trial_ends_at;

        let view = project(&sub, &catalog(), now).unwrap();
        assert_eq!(view.next_billing_date, None);
        assert!(view.can_resume);
    }
}
