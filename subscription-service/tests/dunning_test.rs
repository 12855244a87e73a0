//! Dunning and scheduler integration tests.

mod common;

use chrono::Duration;
use common::{t0, TestEngine};
use std::sync::Arc;
use subscription_service::error::SubscriptionError;
use subscription_service::models::{
    BillingEventKind, PastDuePolicy, PendingChargeKind, SubscriptionStatus,
};
use subscription_service::services::{
    AnalyticsWindow, ChargeOutcome, ChargePurpose, LifecyclePolicy, Scheduler, SchedulerConfig,
};

fn declines(n: usize) -> Vec<ChargeOutcome> {
    std::iter::once(ChargeOutcome::Succeeded)
        .chain(std::iter::repeat(ChargeOutcome::Declined).take(n))
        .collect()
}

#[tokio::test]
async fn exhausted_grace_period_marks_subscription_unpaid_once() {
    let env = TestEngine::new();
    env.gateway.script("pm_card_dunning", declines(6));
    let sub = env.subscribe("basic", "pm_card_dunning").await.subscription;
    let renewal_at = sub.current_period_end;
    let scheduler = env.scheduler();

    env.set_time(renewal_at);
    scheduler.run_once().await.unwrap();
    let past_due = env.engine.get(sub.id).await.unwrap();
    assert_eq!(past_due.status, SubscriptionStatus::PastDue);
    assert_eq!(past_due.grace_deadline, Some(renewal_at + Duration::days(7)));
    assert_eq!(
        past_due.next_payment_attempt_at,
        Some(renewal_at + Duration::days(3))
    );

    // Scan every twelve hours well past the grace deadline.
    for _ in 0..24 {
        env.advance(Duration::hours(12));
        scheduler.run_once().await.unwrap();
    }

    let unpaid = env.engine.get(sub.id).await.unwrap();
    assert_eq!(unpaid.status, SubscriptionStatus::Unpaid);
    assert_eq!(unpaid.ends_at, Some(renewal_at + Duration::days(7)));
    assert_eq!(env.count_events(sub.id, BillingEventKind::Expired).await, 1);
    assert_eq!(
        env.count_events(sub.id, BillingEventKind::PaymentFailed).await,
        3
    );

    let retries = env
        .gateway
        .charges()
        .into_iter()
        .filter(|charge| charge.request.purpose == ChargePurpose::Retry)
        .count();
    assert_eq!(retries, 3);
}

#[tokio::test]
async fn cancel_policy_ends_dunning_as_canceled() {
    let env = TestEngine::with_policy(LifecyclePolicy {
        past_due_policy: PastDuePolicy::Canceled,
        ..Default::default()
    });
    env.gateway.script("pm_card_dunning", declines(6));
    let sub = env.subscribe("basic", "pm_card_dunning").await.subscription;
    let scheduler = env.scheduler();

    env.set_time(sub.current_period_end);
    scheduler.run_once().await.unwrap();
    for _ in 0..10 {
        env.advance(Duration::days(1));
        scheduler.run_once().await.unwrap();
    }

    let ended = env.engine.get(sub.id).await.unwrap();
    assert_eq!(ended.status, SubscriptionStatus::Canceled);
    assert!(ended.is_terminal(env.now()));
    assert_eq!(env.count_events(sub.id, BillingEventKind::Expired).await, 1);
}

#[tokio::test]
async fn successful_retry_recovers_subscription() {
    let env = TestEngine::new();
    env.gateway.script(
        "pm_card_dunning",
        [
            ChargeOutcome::Succeeded,
            ChargeOutcome::Declined,
            ChargeOutcome::Succeeded,
        ],
    );
    let sub = env.subscribe("basic", "pm_card_dunning").await.subscription;
    let renewal_at = sub.current_period_end;

    env.set_time(renewal_at);
    env.engine.renew(sub.id).await.unwrap();

    env.set_time(renewal_at + Duration::days(3));
    let recovered = env.engine.retry_payment(sub.id).await.unwrap();

    assert_eq!(recovered.subscription.status, SubscriptionStatus::Active);
    assert_eq!(recovered.charged, Some(2000));
    assert_eq!(recovered.subscription.amount_due, 0);
    assert_eq!(recovered.subscription.grace_deadline, None);
    assert_eq!(recovered.subscription.current_period_start, renewal_at);
    assert_eq!(
        env.count_events(sub.id, BillingEventKind::PaymentRecovered)
            .await,
        1
    );
}

#[tokio::test]
async fn retry_before_schedule_is_rejected() {
    let env = TestEngine::new();
    env.gateway.script("pm_card_dunning", declines(1));
    let sub = env.subscribe("basic", "pm_card_dunning").await.subscription;

    env.set_time(sub.current_period_end);
    env.engine.renew(sub.id).await.unwrap();

    env.advance(Duration::days(1));
    assert!(env.engine.retry_payment(sub.id).await.is_err());
}

#[tokio::test]
async fn webhook_payment_result_is_applied_once() {
    let env = TestEngine::new();
    let sub = env.subscribe("basic", "pm_card").await.subscription;
    env.set_time(sub.current_period_end);

    let failed = env
        .engine
        .record_payment_result(sub.id, false, Some("evt_renewal_1".to_string()))
        .await
        .unwrap();
    assert_eq!(failed.subscription.status, SubscriptionStatus::PastDue);
    assert!(!failed.duplicate);

    let replay = env
        .engine
        .record_payment_result(sub.id, false, Some("evt_renewal_1".to_string()))
        .await
        .unwrap();
    assert!(replay.duplicate);
    assert!(replay.events.is_empty());
    assert_eq!(replay.subscription.version, failed.subscription.version);
    assert_eq!(
        env.count_events(sub.id, BillingEventKind::PaymentFailed)
            .await,
        1
    );

    let recovered = env
        .engine
        .record_payment_result(sub.id, true, Some("evt_renewal_2".to_string()))
        .await
        .unwrap();
    assert_eq!(recovered.subscription.status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn scheduler_converts_trials_and_expires_stale_incompletes() {
    let env = TestEngine::new();
    let trial = env.subscribe("team-trial", "pm_card").await.subscription;
    let pending = env
        .subscribe("basic", "pm_pending_card")
        .await
        .subscription;
    let active = env.subscribe("pro", "pm_card").await.subscription;

    env.set_time(t0() + Duration::days(14));
    let report = env.scheduler().run_once().await.unwrap();

    assert_eq!(report.scanned, 3);
    assert_eq!(report.processed, 2);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed, 0);
    assert_eq!(
        env.engine.get(trial.id).await.unwrap().status,
        SubscriptionStatus::Active
    );
    assert_eq!(
        env.engine.get(pending.id).await.unwrap().status,
        SubscriptionStatus::IncompleteExpired
    );
    assert_eq!(
        env.engine.get(active.id).await.unwrap().status,
        SubscriptionStatus::Active
    );
}

#[tokio::test]
async fn pending_trial_conversion_settles_by_payment_result() {
    let env = TestEngine::new();
    let sub = env
        .subscribe("team-trial", "pm_pending_card")
        .await
        .subscription;

    env.set_time(t0() + Duration::days(14));
    let held = env.engine.convert_trial(sub.id).await.unwrap();
    assert_eq!(held.subscription.status, SubscriptionStatus::Trialing);
    assert_eq!(held.charged, None);
    let pending = held.subscription.pending_charge.clone().unwrap();
    assert_eq!(pending.kind, PendingChargeKind::TrialConversion);
    assert_eq!(pending.amount, 3000);
    assert_eq!(
        env.count_events(sub.id, BillingEventKind::PaymentFailed).await,
        0
    );

    assert!(matches!(
        env.engine.convert_trial(sub.id).await,
        Err(SubscriptionError::PaymentPending(_))
    ));
    assert_eq!(env.gateway.charges().len(), 1);

    env.advance(Duration::hours(6));
    let settled = env
        .engine
        .record_payment_result(sub.id, true, Some("webhook:evt_conversion".to_string()))
        .await
        .unwrap();
    assert_eq!(settled.subscription.status, SubscriptionStatus::Active);
    assert_eq!(settled.subscription.pending_charge, None);
    assert_eq!(settled.charged, Some(3000));
    assert_eq!(
        settled.subscription.current_period_start,
        t0() + Duration::days(14)
    );
    assert_eq!(
        env.event_kinds(sub.id).await,
        vec![
            BillingEventKind::Created,
            BillingEventKind::TrialStarted,
            BillingEventKind::PaymentPending,
            BillingEventKind::TrialConverted,
        ]
    );

    let window =
        AnalyticsWindow::new(t0() + Duration::days(1), t0() + Duration::days(30)).unwrap();
    let report = env.engine.analytics(window).await.unwrap();
    assert_eq!(report.trials_converted, 1);
    assert_eq!(report.trials_lost, 0);
}

#[tokio::test]
async fn pending_renewal_is_not_retried_while_unsettled() {
    let env = TestEngine::new();
    env.gateway.script(
        "pm_card_slow",
        [ChargeOutcome::Succeeded, ChargeOutcome::Pending],
    );
    let sub = env.subscribe("basic", "pm_card_slow").await.subscription;
    let renewal_at = sub.current_period_end;
    let scheduler = env.scheduler();

    env.set_time(renewal_at);
    scheduler.run_once().await.unwrap();
    let waiting = env.engine.get(sub.id).await.unwrap();
    assert_eq!(waiting.status, SubscriptionStatus::Active);
    assert_eq!(waiting.current_period_end, renewal_at);
    assert_eq!(
        waiting.pending_charge.as_ref().map(|charge| charge.kind),
        Some(PendingChargeKind::Renewal)
    );

    for _ in 0..8 {
        env.advance(Duration::hours(12));
        scheduler.run_once().await.unwrap();
    }
    assert_eq!(env.gateway.charges().len(), 2);
    let still_waiting = env.engine.get(sub.id).await.unwrap();
    assert_eq!(still_waiting.status, SubscriptionStatus::Active);
    assert_eq!(still_waiting.version, waiting.version);

    let settled = env
        .engine
        .record_payment_result(sub.id, true, Some("webhook:evt_renewal".to_string()))
        .await
        .unwrap();
    assert_eq!(settled.subscription.pending_charge, None);
    assert_eq!(settled.subscription.current_period_start, renewal_at);
    assert_eq!(settled.charged, Some(2000));
    assert_eq!(
        env.count_events(sub.id, BillingEventKind::Renewed).await,
        1
    );
    assert_eq!(
        env.count_events(sub.id, BillingEventKind::PaymentFailed).await,
        0
    );
}

#[tokio::test]
async fn scheduler_respects_batch_size() {
    let env = TestEngine::new();
    for _ in 0..3 {
        env.subscribe("team-trial", "pm_card").await;
    }
    env.set_time(t0() + Duration::days(14));

    let scheduler = Scheduler::new(
        env.engine.clone(),
        SchedulerConfig {
            batch_size: 2,
            ..Default::default()
        },
    );
    assert_eq!(scheduler.run_once().await.unwrap().processed, 2);
    assert_eq!(scheduler.run_once().await.unwrap().processed, 1);
    assert_eq!(scheduler.run_once().await.unwrap().processed, 0);
}

#[tokio::test]
async fn scheduler_stops_on_cancellation() {
    let env = TestEngine::new();
    let scheduler = Scheduler::new(
        Arc::clone(&env.engine),
        SchedulerConfig {
            interval: std::time::Duration::from_millis(10),
            ..Default::default()
        },
    );
    let token = scheduler.shutdown_token();
    let handle = tokio::spawn(scheduler.start());

    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    token.cancel();

    tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .expect("scheduler stops promptly")
        .unwrap();
}
