//! Subscription state machine.
//!
//! Everything here is pure: a command is evaluated against a loaded
//! subscription, the catalog and an instant. [`decide`] checks legality and
//! says which charge, if any, must be made; [`apply`] turns the charge outcome
//! into the next subscription state plus the events describing it. Rejections
//! return an error and never produce a transition.

use super::catalog::PlanCatalog;
use super::gateway::{ChargeOutcome, ChargePurpose, ChargeRequest};
use super::proration::{self, PlanChangeKind, ProrationQuote};
use crate::error::SubscriptionError;
use crate::models::{
    BillingEventKind, CreateSubscription, NewBillingEvent, PastDuePolicy, PendingCharge,
    PendingChargeKind, PendingPlanChange, Plan, PlanId, Subscription, SubscriptionStatus,
    MAX_TRIAL_DAYS,
};
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

/// Timing rules for dunning, expiry and archival.
#[derive(Debug, Clone)]
pub struct LifecyclePolicy {
    pub grace_period: Duration,
    pub retry_interval: Duration,
    pub past_due_policy: PastDuePolicy,
    pub incomplete_window: Duration,
    pub archive_retention: Duration,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            grace_period: Duration::days(7),
            retry_interval: Duration::hours(72),
            past_due_policy: PastDuePolicy::Unpaid,
            incomplete_window: Duration::hours(23),
            archive_retention: Duration::days(30),
        }
    }
}

/// Inputs every transition is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct TransitionContext<'a> {
    pub now: DateTime<Utc>,
    pub catalog: &'a PlanCatalog,
    pub policy: &'a LifecyclePolicy,
}

/// Commands on an existing subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ConfirmPayment { success: bool },
    ExpireIncomplete,
    ConvertTrial,
    RecordPaymentResult { success: bool },
    Renew,
    RetryPayment,
    Upgrade { target: PlanId },
    Downgrade { target: PlanId },
    CancelPendingChange,
    Cancel { immediate: bool },
    Resume,
    ExtendTrial { days: u32 },
    Archive,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::ConfirmPayment { .. } => "confirm_payment",
            Command::ExpireIncomplete => "expire_incomplete",
            Command::ConvertTrial => "convert_trial",
            Command::RecordPaymentResult { .. } => "record_payment_result",
            Command::Renew => "renew",
            Command::RetryPayment => "retry_payment",
            Command::Upgrade { .. } => "upgrade",
            Command::Downgrade { .. } => "downgrade",
            Command::CancelPendingChange => "cancel_pending_change",
            Command::Cancel { .. } => "cancel",
            Command::Resume => "resume",
            Command::ExtendTrial { .. } => "extend_trial",
            Command::Archive => "archive",
        }
    }
}

/// Side effect a command needs before it can be applied.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Decision {
    pub charge: Option<ChargeRequest>,
}

/// Result of a legal command.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub subscription: Subscription,
    pub events: Vec<NewBillingEvent>,
    /// Minor units collected by this transition.
    pub charged: Option<i64>,
}

enum CancelMode {
    Immediate,
    AtPeriodEnd,
}

struct UpgradePlan<'c> {
    target: &'c Plan,
    quote: Option<ProrationQuote>,
}

fn invalid(command: &Command, sub: &Subscription) -> SubscriptionError {
    SubscriptionError::InvalidTransition {
        command: command.name(),
        status: sub.status,
    }
}

fn require(
    condition: bool,
    command: &Command,
    sub: &Subscription,
) -> Result<(), SubscriptionError> {
    if condition {
        Ok(())
    } else {
        Err(invalid(command, sub))
    }
}

fn event(
    sub: &Subscription,
    kind: BillingEventKind,
    from_status: Option<SubscriptionStatus>,
    amount: Option<i64>,
    now: DateTime<Utc>,
) -> NewBillingEvent {
    NewBillingEvent {
        subscription_id: sub.id,
        user_id: sub.user_id,
        kind,
        occurred_at: now,
        amount,
        plan_id: sub.plan_id.clone(),
        quantity: sub.quantity,
        from_status,
        to_status: sub.status,
    }
}

fn charge_request(
    sub: &Subscription,
    amount: i64,
    purpose: ChargePurpose,
    idempotency_key: String,
) -> ChargeRequest {
    ChargeRequest {
        subscription_id: sub.id,
        amount,
        payment_method: sub.payment_method.clone(),
        purpose,
        idempotency_key,
    }
}

/// Plan the subscription bills at once the current period (or trial) ends.
fn plan_after_rollover<'c>(
    sub: &Subscription,
    ctx: &TransitionContext<'c>,
) -> Result<&'c Plan, SubscriptionError> {
    match &sub.pending_change {
        Some(change) if change.effective_at <= ctx.now => {
            ctx.catalog.resolve_existing(&change.target_plan_id)
        }
        _ => ctx.catalog.resolve_existing(&sub.plan_id),
    }
}

/// Swap in a due pending change, recording it as `downgraded`.
fn apply_due_change(
    next: &mut Subscription,
    events: &mut Vec<NewBillingEvent>,
    now: DateTime<Utc>,
) {
    let due = next
        .pending_change
        .as_ref()
        .is_some_and(|change| change.effective_at <= now);
    if !due {
        return;
    }
    if let Some(change) = next.pending_change.take() {
        next.plan_id = change.target_plan_id;
        events.push(event(
            next,
            BillingEventKind::Downgraded,
            Some(next.status),
            None,
            now,
        ));
    }
}

fn enter_past_due(next: &mut Subscription, amount_due: i64, ctx: &TransitionContext<'_>) {
    let deadline = ctx.now + ctx.policy.grace_period;
    next.status = SubscriptionStatus::PastDue;
    next.grace_deadline = Some(deadline);
    next.next_payment_attempt_at = Some((ctx.now + ctx.policy.retry_interval).min(deadline));
    next.failed_payment_attempts = 1;
    next.amount_due = amount_due;
}

fn clear_dunning(next: &mut Subscription) {
    next.grace_deadline = None;
    next.next_payment_attempt_at = None;
    next.failed_payment_attempts = 0;
    next.amount_due = 0;
}

fn settle_past_due(
    next: &mut Subscription,
    outcome: ChargeOutcome,
    events: &mut Vec<NewBillingEvent>,
    ctx: &TransitionContext<'_>,
) -> Option<i64> {
    let from = Some(next.status);
    if outcome.is_success() {
        let recovered = next.amount_due;
        next.status = SubscriptionStatus::Active;
        clear_dunning(next);
        events.push(event(
            next,
            BillingEventKind::PaymentRecovered,
            from,
            Some(recovered),
            ctx.now,
        ));
        return Some(recovered);
    }

    next.failed_payment_attempts = next.failed_payment_attempts.saturating_add(1);
    let exhausted = next
        .grace_deadline
        .map_or(true, |deadline| ctx.now >= deadline);
    if exhausted {
        next.status = ctx.policy.past_due_policy.terminal_status();
        next.ends_at = Some(ctx.now);
        next.next_payment_attempt_at = None;
        next.cancel_at_period_end = false;
        next.pending_change = None;
        events.push(event(next, BillingEventKind::Expired, from, None, ctx.now));
    } else if let Some(deadline) = next.grace_deadline {
        next.next_payment_attempt_at = Some((ctx.now + ctx.policy.retry_interval).min(deadline));
        events.push(event(
            next,
            BillingEventKind::PaymentFailed,
            from,
            None,
            ctx.now,
        ));
    }
    None
}

/// Start the next period of an active subscription and settle its charge.
fn rollover(
    next: &mut Subscription,
    outcome: ChargeOutcome,
    events: &mut Vec<NewBillingEvent>,
    ctx: &TransitionContext<'_>,
) -> Result<Option<i64>, SubscriptionError> {
    let from = Some(next.status);
    apply_due_change(next, events, ctx.now);
    let plan = ctx.catalog.resolve_existing(&next.plan_id)?;
    let amount = plan.period_amount(next.quantity);

    let start = next.current_period_end;
    next.current_period_start = start;
    next.current_period_end = plan.billing_period.advance(start);

    if outcome.is_success() {
        events.push(event(
            next,
            BillingEventKind::Renewed,
            from,
            Some(amount),
            ctx.now,
        ));
        Ok(Some(amount))
    } else {
        enter_past_due(next, amount, ctx);
        events.push(event(
            next,
            BillingEventKind::PaymentFailed,
            from,
            None,
            ctx.now,
        ));
        Ok(None)
    }
}

/// End a trial into its first paid period.
fn finish_trial(
    next: &mut Subscription,
    outcome: ChargeOutcome,
    events: &mut Vec<NewBillingEvent>,
    ctx: &TransitionContext<'_>,
) -> Result<Option<i64>, SubscriptionError> {
    let from = Some(next.status);
    apply_due_change(next, events, ctx.now);
    let plan = ctx.catalog.resolve_existing(&next.plan_id)?;
    let amount = plan.period_amount(next.quantity);
    let start = next.trial_ends_at.unwrap_or(ctx.now);
    next.trial_ends_at = None;
    next.current_period_start = start;
    next.current_period_end = plan.billing_period.advance(start);

    if outcome.is_success() {
        next.status = SubscriptionStatus::Active;
        events.push(event(
            next,
            BillingEventKind::TrialConverted,
            from,
            Some(amount),
            ctx.now,
        ));
        Ok(Some(amount))
    } else {
        enter_past_due(next, amount, ctx);
        events.push(event(
            next,
            BillingEventKind::PaymentFailed,
            from,
            None,
            ctx.now,
        ));
        Ok(None)
    }
}

/// Park a charge the gateway left pending. Status and period stay put.
fn hold_for_settlement(
    next: &mut Subscription,
    kind: PendingChargeKind,
    request: &ChargeRequest,
    events: &mut Vec<NewBillingEvent>,
    now: DateTime<Utc>,
) {
    next.pending_charge = Some(PendingCharge {
        kind,
        amount: request.amount,
        idempotency_key: request.idempotency_key.clone(),
        submitted_at: now,
    });
    events.push(event(
        next,
        BillingEventKind::PaymentPending,
        Some(next.status),
        None,
        now,
    ));
}

/// Finish what a pending charge started, now that its result is known.
fn settle_pending(
    next: &mut Subscription,
    pending: PendingCharge,
    outcome: ChargeOutcome,
    events: &mut Vec<NewBillingEvent>,
    ctx: &TransitionContext<'_>,
) -> Result<Option<i64>, SubscriptionError> {
    match pending.kind {
        PendingChargeKind::TrialConversion => finish_trial(next, outcome, events, ctx),
        PendingChargeKind::Renewal => rollover(next, outcome, events, ctx),
        PendingChargeKind::Retry => Ok(settle_past_due(next, outcome, events, ctx)),
        PendingChargeKind::Upgrade => {
            let from = Some(next.status);
            if outcome.is_success() {
                events.push(event(
                    next,
                    BillingEventKind::PaymentSettled,
                    from,
                    Some(pending.amount),
                    ctx.now,
                ));
                Ok(Some(pending.amount))
            } else {
                enter_past_due(next, pending.amount, ctx);
                events.push(event(
                    next,
                    BillingEventKind::PaymentFailed,
                    from,
                    None,
                    ctx.now,
                ));
                Ok(None)
            }
        }
    }
}

/// Commands that would charge again or move the billing dates under a
/// charge that has not settled yet.
fn blocked_by_pending_charge(command: &Command) -> bool {
    matches!(
        command,
        Command::ConvertTrial
            | Command::Renew
            | Command::RetryPayment
            | Command::Upgrade { .. }
            | Command::Downgrade { .. }
            | Command::CancelPendingChange
            | Command::ExtendTrial { .. }
            | Command::Cancel { immediate: false }
    )
}

/// Turn the current period's scheduled cancellation into `canceled`.
fn cancel_at_rollover(
    next: &mut Subscription,
    events: &mut Vec<NewBillingEvent>,
    now: DateTime<Utc>,
) {
    let from = Some(next.status);
    let ends_at = next.ends_at.unwrap_or(next.current_period_end);
    next.status = SubscriptionStatus::Canceled;
    next.ends_at = Some(ends_at);
    next.cancel_at_period_end = false;
    next.trial_ends_at = None;
    next.pending_change = None;
    events.push(event(next, BillingEventKind::Canceled, from, None, now));
}

fn cancel_mode(
    sub: &Subscription,
    immediate: bool,
    now: DateTime<Utc>,
) -> Result<CancelMode, SubscriptionError> {
    if sub.is_terminal(now) {
        return Err(SubscriptionError::AlreadyCanceled(sub.id));
    }
    match sub.status {
        SubscriptionStatus::Active | SubscriptionStatus::Trialing => {
            if immediate {
                Ok(CancelMode::Immediate)
            } else if sub.cancel_at_period_end {
                Err(SubscriptionError::AlreadyCanceled(sub.id))
            } else {
                Ok(CancelMode::AtPeriodEnd)
            }
        }
        SubscriptionStatus::Incomplete | SubscriptionStatus::PastDue => Ok(CancelMode::Immediate),
        SubscriptionStatus::Canceled
        | SubscriptionStatus::Unpaid
        | SubscriptionStatus::IncompleteExpired => Err(SubscriptionError::AlreadyCanceled(sub.id)),
    }
}

fn check_upgrade<'c>(
    sub: &Subscription,
    command: &Command,
    target_id: &PlanId,
    ctx: &TransitionContext<'c>,
) -> Result<UpgradePlan<'c>, SubscriptionError> {
    require(
        matches!(
            sub.status,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing
        ),
        command,
        sub,
    )?;
    let not_upgradable = || SubscriptionError::NotUpgradable {
        from: sub.plan_id.clone(),
        to: target_id.clone(),
    };

    let current = ctx.catalog.resolve_existing(&sub.plan_id)?;
    if !current.can_upgrade_to(target_id) {
        return Err(not_upgradable());
    }
    let target = ctx.catalog.resolve_existing(target_id)?;
    if !target.is_subscribable() {
        return Err(not_upgradable());
    }
    if current.billing_period != target.billing_period
        && proration::classify(current, target) != PlanChangeKind::Upgrade
    {
        return Err(not_upgradable());
    }

    let quote = (sub.status == SubscriptionStatus::Active).then(|| {
        proration::upgrade_quote(
            current,
            target,
            sub.quantity,
            sub.current_period_start,
            sub.current_period_end,
            ctx.now,
        )
    });
    Ok(UpgradePlan { target, quote })
}

fn check_downgrade<'c>(
    sub: &Subscription,
    command: &Command,
    target_id: &PlanId,
    ctx: &TransitionContext<'c>,
) -> Result<&'c Plan, SubscriptionError> {
    require(
        matches!(
            sub.status,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing
        ),
        command,
        sub,
    )?;
    if sub.cancel_at_period_end {
        return Err(SubscriptionError::InvalidRequest(
            "subscription is scheduled to cancel; resume it before changing plans".to_string(),
        ));
    }
    let not_downgradable = || SubscriptionError::NotDowngradable {
        from: sub.plan_id.clone(),
        to: target_id.clone(),
    };

    let current = ctx.catalog.resolve_existing(&sub.plan_id)?;
    if !current.can_downgrade_to(target_id) {
        return Err(not_downgradable());
    }
    let target = ctx.catalog.resolve_existing(target_id)?;
    if !target.is_subscribable() {
        return Err(not_downgradable());
    }
    if current.billing_period != target.billing_period
        && proration::classify(current, target) != PlanChangeKind::Downgrade
    {
        return Err(not_downgradable());
    }
    Ok(target)
}

/// `start` moved forward by `days` trial days.
fn trial_end_after(start: DateTime<Utc>, days: u32) -> Result<DateTime<Utc>, SubscriptionError> {
    if days > MAX_TRIAL_DAYS {
        return Err(SubscriptionError::InvalidRequest(format!(
            "trial of {days} days exceeds the {MAX_TRIAL_DAYS} day limit"
        )));
    }
    start
        .checked_add_signed(Duration::days(i64::from(days)))
        .ok_or_else(|| SubscriptionError::InvalidRequest("trial end is out of range".to_string()))
}

/// End of the current paid period, or of the trial while trialing.
fn current_term_end(sub: &Subscription) -> DateTime<Utc> {
    match (sub.status, sub.trial_ends_at) {
        (SubscriptionStatus::Trialing, Some(trial_end)) => trial_end,
        _ => sub.current_period_end,
    }
}

/// Validate a new subscription request and resolve its plan.
pub fn check_subscribe<'c>(
    existing: Option<&Subscription>,
    catalog: &'c PlanCatalog,
    request: &CreateSubscription,
    now: DateTime<Utc>,
) -> Result<&'c Plan, SubscriptionError> {
    if request.quantity == 0 {
        return Err(SubscriptionError::InvalidQuantity(request.quantity));
    }
    if request.payment_method.trim().is_empty() {
        return Err(SubscriptionError::InvalidRequest(
            "payment_method is required".to_string(),
        ));
    }
    let plan = catalog
        .get(&request.plan_id)
        .ok_or_else(|| SubscriptionError::PlanNotFound(request.plan_id.clone()))?;
    if !plan.is_subscribable() {
        return Err(SubscriptionError::PlanNotSubscribable(plan.id.clone()));
    }
    if plan.has_trial() {
        trial_end_after(now, plan.trial_days)?;
    }
    if let Some(current) = existing.filter(|sub| !sub.is_terminal(now)) {
        return Err(SubscriptionError::AlreadySubscribed {
            user_id: request.user_id,
            subscription_id: current.id,
        });
    }
    Ok(plan)
}

/// Create a subscription: `trialing` for trial plans, otherwise `incomplete`
/// until the first charge is confirmed.
pub fn subscribe(
    id: Uuid,
    request: &CreateSubscription,
    plan: &Plan,
    now: DateTime<Utc>,
) -> Result<Transition, SubscriptionError> {
    let (status, trial_ends_at, period_end, amount_due) = if plan.has_trial() {
        let trial_end = trial_end_after(now, plan.trial_days)?;
        (SubscriptionStatus::Trialing, Some(trial_end), trial_end, 0)
    } else {
        (
            SubscriptionStatus::Incomplete,
            None,
            plan.billing_period.advance(now),
            plan.period_amount(request.quantity),
        )
    };

    let subscription = Subscription {
        id,
        user_id: request.user_id,
        plan_id: plan.id.clone(),
        status,
        quantity: request.quantity,
        payment_method: request.payment_method.clone(),
        trial_ends_at,
        current_period_start: now,
        current_period_end: period_end,
        cancel_at_period_end: false,
        ends_at: None,
        pending_change: None,
        grace_deadline: None,
        next_payment_attempt_at: None,
        failed_payment_attempts: 0,
        amount_due,
        pending_charge: None,
        created_at: now,
        updated_at: now,
        archived_at: None,
        version: 1,
    };

    let mut events = vec![event(
        &subscription,
        BillingEventKind::Created,
        None,
        None,
        now,
    )];
    if status == SubscriptionStatus::Trialing {
        events.push(event(
            &subscription,
            BillingEventKind::TrialStarted,
            Some(status),
            None,
            now,
        ));
    }

    Ok(Transition {
        subscription,
        events,
        charged: None,
    })
}

/// Read-only quote with the same legality checks as an upgrade.
pub fn preview_upgrade(
    sub: &Subscription,
    target: &PlanId,
    ctx: &TransitionContext<'_>,
) -> Result<ProrationQuote, SubscriptionError> {
    let command = Command::Upgrade {
        target: target.clone(),
    };
    let plan = check_upgrade(sub, &command, target, ctx)?;
    Ok(plan.quote.unwrap_or(ProrationQuote {
        kind: PlanChangeKind::Upgrade,
        amount: 0,
        charge: 0,
        credit: 0,
        effective_at: ctx.now,
        period_start: sub.current_period_start,
        period_end: sub.current_period_end,
    }))
}

/// Check legality and work out the charge a command needs.
pub fn decide(
    sub: &Subscription,
    command: &Command,
    ctx: &TransitionContext<'_>,
) -> Result<Decision, SubscriptionError> {
    let now = ctx.now;
    if sub.pending_charge.is_some() && blocked_by_pending_charge(command) {
        return Err(SubscriptionError::PaymentPending(sub.id));
    }
    let charge = match command {
        Command::ConfirmPayment { .. } => {
            require(sub.status == SubscriptionStatus::Incomplete, command, sub)?;
            None
        }
        Command::ExpireIncomplete => {
            require(
                sub.status == SubscriptionStatus::Incomplete
                    && now >= sub.created_at + ctx.policy.incomplete_window,
                command,
                sub,
            )?;
            None
        }
        Command::ConvertTrial => {
            let trial_end = sub
                .trial_ends_at
                .filter(|_| sub.status == SubscriptionStatus::Trialing)
                .ok_or_else(|| invalid(command, sub))?;
            require(now >= trial_end, command, sub)?;
            if sub.cancel_at_period_end {
                None
            } else {
                let plan = plan_after_rollover(sub, ctx)?;
                Some(charge_request(
                    sub,
                    plan.period_amount(sub.quantity),
                    ChargePurpose::TrialConversion,
                    format!("trial-conversion:{}:{}", sub.id, trial_end.timestamp()),
                ))
            }
        }
        Command::Renew => {
            require(
                sub.status == SubscriptionStatus::Active && now >= sub.current_period_end,
                command,
                sub,
            )?;
            if sub.cancel_at_period_end {
                None
            } else {
                let plan = plan_after_rollover(sub, ctx)?;
                Some(charge_request(
                    sub,
                    plan.period_amount(sub.quantity),
                    ChargePurpose::Renewal,
                    format!(
                        "renewal:{}:{}",
                        sub.id,
                        sub.current_period_end.timestamp()
                    ),
                ))
            }
        }
        Command::RecordPaymentResult { .. } => {
            let renewal_due = sub.status == SubscriptionStatus::Active
                && !sub.cancel_at_period_end
                && now >= sub.current_period_end;
            let settles_pending = sub.pending_charge.is_some();
            require(
                settles_pending || renewal_due || sub.status == SubscriptionStatus::PastDue,
                command,
                sub,
            )?;
            if renewal_due && !settles_pending {
                plan_after_rollover(sub, ctx)?;
            }
            None
        }
        Command::RetryPayment => {
            let due = sub.next_payment_attempt_at.is_some_and(|at| now >= at)
                || sub.grace_deadline.is_some_and(|at| now >= at);
            require(sub.status == SubscriptionStatus::PastDue && due, command, sub)?;
            Some(charge_request(
                sub,
                sub.amount_due,
                ChargePurpose::Retry,
                format!("retry:{}:{}", sub.id, sub.failed_payment_attempts),
            ))
        }
        Command::Upgrade { target } => {
            let plan = check_upgrade(sub, command, target, ctx)?;
            plan.quote.map(|quote| {
                charge_request(
                    sub,
                    quote.amount,
                    ChargePurpose::Upgrade,
                    format!(
                        "upgrade:{}:{}:{}:{}",
                        sub.id,
                        sub.plan_id,
                        target,
                        sub.current_period_start.timestamp()
                    ),
                )
            })
        }
        Command::Downgrade { target } => {
            check_downgrade(sub, command, target, ctx)?;
            None
        }
        Command::CancelPendingChange => {
            require(sub.pending_change.is_some(), command, sub)?;
            None
        }
        Command::Cancel { immediate } => {
            cancel_mode(sub, *immediate, now)?;
            None
        }
        Command::Resume => {
            if sub.status != SubscriptionStatus::Canceled && !sub.cancel_at_period_end {
                return Err(invalid(command, sub));
            }
            if !sub.in_resume_window(now) {
                return Err(SubscriptionError::ResumeWindowExpired(sub.id));
            }
            None
        }
        Command::ExtendTrial { days } => {
            if *days == 0 {
                return Err(SubscriptionError::InvalidRequest(
                    "trial extension must be at least one day".to_string(),
                ));
            }
            let trial_end = sub
                .trial_ends_at
                .filter(|_| sub.status == SubscriptionStatus::Trialing)
                .ok_or_else(|| invalid(command, sub))?;
            trial_end_after(trial_end, *days)?;
            None
        }
        Command::Archive => {
            let archivable = !sub.is_archived()
                && sub
                    .terminated_at(now)
                    .is_some_and(|at| now >= at + ctx.policy.archive_retention);
            require(archivable, command, sub)?;
            None
        }
    };
    Ok(Decision { charge })
}

/// Apply a legal command.
///
/// `payment` is the outcome of the charge requested by [`decide`]; commands
/// that carry their own outcome (`ConfirmPayment`, `RecordPaymentResult`)
/// ignore it.
pub fn apply(
    sub: &Subscription,
    command: &Command,
    payment: Option<ChargeOutcome>,
    ctx: &TransitionContext<'_>,
) -> Result<Transition, SubscriptionError> {
    let decision = decide(sub, command, ctx)?;
    let now = ctx.now;
    let from = Some(sub.status);
    let mut next = sub.clone();
    next.updated_at = now;
    let mut events = Vec::new();
    let mut charged = None;

    let charge_outcome = || -> Result<ChargeOutcome, SubscriptionError> {
        match (&decision.charge, payment) {
            (Some(request), _) if request.amount == 0 => Ok(ChargeOutcome::Succeeded),
            (Some(_), Some(outcome)) => Ok(outcome),
            (Some(_), None) => Err(SubscriptionError::InvalidRequest(format!(
                "{} requires a charge outcome",
                command.name()
            ))),
            (None, _) => Ok(ChargeOutcome::Succeeded),
        }
    };

    match command {
        Command::ConfirmPayment { success: true } => {
            let plan = ctx.catalog.resolve_existing(&next.plan_id)?;
            let amount = next.amount_due;
            next.status = SubscriptionStatus::Active;
            next.current_period_start = now;
            next.current_period_end = plan.billing_period.advance(now);
            clear_dunning(&mut next);
            charged = Some(amount);
            events.push(event(
                &next,
                BillingEventKind::Activated,
                from,
                Some(amount),
                now,
            ));
        }
        Command::ConfirmPayment { success: false } | Command::ExpireIncomplete => {
            next.status = SubscriptionStatus::IncompleteExpired;
            next.ends_at = Some(now);
            clear_dunning(&mut next);
            events.push(event(&next, BillingEventKind::Expired, from, None, now));
        }
        Command::ConvertTrial => {
            if next.cancel_at_period_end {
                cancel_at_rollover(&mut next, &mut events, now);
            } else {
                match (charge_outcome()?, &decision.charge) {
                    (ChargeOutcome::Pending, Some(request)) => hold_for_settlement(
                        &mut next,
                        PendingChargeKind::TrialConversion,
                        request,
                        &mut events,
                        now,
                    ),
                    (outcome, _) => {
                        charged = finish_trial(&mut next, outcome, &mut events, ctx)?;
                    }
                }
            }
        }
        Command::Renew => {
            if next.cancel_at_period_end {
                cancel_at_rollover(&mut next, &mut events, now);
            } else {
                match (charge_outcome()?, &decision.charge) {
                    (ChargeOutcome::Pending, Some(request)) => hold_for_settlement(
                        &mut next,
                        PendingChargeKind::Renewal,
                        request,
                        &mut events,
                        now,
                    ),
                    (outcome, _) => {
                        charged = rollover(&mut next, outcome, &mut events, ctx)?;
                    }
                }
            }
        }
        Command::RecordPaymentResult { success } => {
            let outcome = ChargeOutcome::from_success(*success);
            charged = match next.pending_charge.take() {
                Some(pending) => settle_pending(&mut next, pending, outcome, &mut events, ctx)?,
                None if next.status == SubscriptionStatus::PastDue => {
                    settle_past_due(&mut next, outcome, &mut events, ctx)
                }
                None => rollover(&mut next, outcome, &mut events, ctx)?,
            };
        }
        Command::RetryPayment => match (charge_outcome()?, &decision.charge) {
            (ChargeOutcome::Pending, Some(request)) => hold_for_settlement(
                &mut next,
                PendingChargeKind::Retry,
                request,
                &mut events,
                now,
            ),
            (outcome, _) => {
                charged = settle_past_due(&mut next, outcome, &mut events, ctx);
            }
        },
        Command::Upgrade { target } => {
            let plan = check_upgrade(sub, command, target, ctx)?;
            next.plan_id = plan.target.id.clone();
            next.pending_change = None;
            match plan.quote {
                None => {
                    events.push(event(&next, BillingEventKind::Upgraded, from, None, now));
                }
                Some(quote) => {
                    next.current_period_start = quote.period_start;
                    next.current_period_end = quote.period_end;
                    let outcome = charge_outcome()?;
                    if let (ChargeOutcome::Pending, Some(request)) = (outcome, &decision.charge) {
                        events.push(event(&next, BillingEventKind::Upgraded, from, None, now));
                        hold_for_settlement(
                            &mut next,
                            PendingChargeKind::Upgrade,
                            request,
                            &mut events,
                            now,
                        );
                    } else if outcome.is_success() {
                        let amount = (quote.amount > 0).then_some(quote.amount);
                        charged = amount;
                        events.push(event(&next, BillingEventKind::Upgraded, from, amount, now));
                    } else {
                        events.push(event(&next, BillingEventKind::Upgraded, from, None, now));
                        enter_past_due(&mut next, quote.amount, ctx);
                        events.push(event(
                            &next,
                            BillingEventKind::PaymentFailed,
                            from,
                            None,
                            now,
                        ));
                    }
                }
            }
        }
        Command::Downgrade { target } => {
            let target = check_downgrade(sub, command, target, ctx)?;
            next.pending_change = Some(PendingPlanChange {
                target_plan_id: target.id.clone(),
                effective_at: current_term_end(sub),
            });
            events.push(event(
                &next,
                BillingEventKind::PlanChangeScheduled,
                from,
                None,
                now,
            ));
        }
        Command::CancelPendingChange => {
            next.pending_change = None;
            events.push(event(
                &next,
                BillingEventKind::PlanChangeCanceled,
                from,
                None,
                now,
            ));
        }
        Command::Cancel { immediate } => match cancel_mode(sub, *immediate, now)? {
            CancelMode::Immediate => {
                next.status = SubscriptionStatus::Canceled;
                next.ends_at = Some(now);
                next.cancel_at_period_end = false;
                next.trial_ends_at = None;
                next.pending_change = None;
                next.pending_charge = None;
                clear_dunning(&mut next);
                events.push(event(&next, BillingEventKind::Canceled, from, None, now));
            }
            CancelMode::AtPeriodEnd => {
                next.cancel_at_period_end = true;
                next.ends_at = Some(current_term_end(sub));
                events.push(event(
                    &next,
                    BillingEventKind::CancellationScheduled,
                    from,
                    None,
                    now,
                ));
            }
        },
        Command::Resume => {
            next.cancel_at_period_end = false;
            next.ends_at = None;
            if next.status == SubscriptionStatus::Canceled {
                next.status = SubscriptionStatus::Active;
            }
            events.push(event(&next, BillingEventKind::Resumed, from, None, now));
        }
        Command::ExtendTrial { days } => {
            if let Some(trial_end) = next.trial_ends_at {
                let extended = trial_end_after(trial_end, *days)?;
                next.trial_ends_at = Some(extended);
                next.current_period_end = extended;
                if next.cancel_at_period_end {
                    next.ends_at = Some(extended);
                }
                if let Some(change) = next.pending_change.as_mut() {
                    change.effective_at = extended;
                }
            }
            events.push(event(
                &next,
                BillingEventKind::TrialExtended,
                from,
                None,
                now,
            ));
        }
        Command::Archive => {
            next.archived_at = Some(now);
        }
    }

    Ok(Transition {
        subscription: next,
        events,
        charged,
    })
}
