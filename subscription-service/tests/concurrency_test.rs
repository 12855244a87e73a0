//! Concurrent commands against the same user or subscription.

mod common;

use common::{request, TestEngine};
use futures::future::join_all;
use std::sync::Arc;
use subscription_service::error::SubscriptionError;
use subscription_service::models::{BillingEventKind, PlanId, SubscriptionStatus};
use uuid::Uuid;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_subscribes_leave_one_live_subscription() {
    let env = Arc::new(TestEngine::new());
    let user_id = Uuid::new_v4();

    let attempts = (0..8).map(|_| {
        let env = env.clone();
        tokio::spawn(async move {
            env.engine
                .subscribe(request(user_id, "basic", "pm_card"))
                .await
        })
    });
    let results: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(succeeded, 1);
    assert!(results.iter().all(|r| matches!(
        r,
        Ok(_) | Err(SubscriptionError::AlreadySubscribed { .. })
    )));
    // Losers are turned away before any money moves.
    assert_eq!(env.gateway.charges().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_cancels_record_one_cancellation() {
    let env = Arc::new(TestEngine::new());
    let sub = env.subscribe("basic", "pm_card").await.subscription;

    let attempts = (0..6).map(|_| {
        let env = env.clone();
        tokio::spawn(async move { env.engine.cancel(sub.id, true).await })
    });
    let results: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, SubscriptionError::AlreadyCanceled(_))));
    assert_eq!(env.count_events(sub.id, BillingEventKind::Canceled).await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_upgrade_and_cancel_both_apply_in_some_order() {
    let env = Arc::new(TestEngine::new());
    let sub = env.subscribe("basic", "pm_card").await.subscription;

    let upgrade = {
        let env = env.clone();
        tokio::spawn(async move {
            env.engine
                .request_upgrade(sub.id, PlanId::new("pro"))
                .await
        })
    };
    let cancel = {
        let env = env.clone();
        tokio::spawn(async move { env.engine.cancel(sub.id, false).await })
    };
    upgrade.await.unwrap().unwrap();
    cancel.await.unwrap().unwrap();

    let stored = env.engine.get(sub.id).await.unwrap();
    assert_eq!(stored.plan_id, PlanId::new("pro"));
    assert!(stored.cancel_at_period_end);
    assert_eq!(stored.status, SubscriptionStatus::Active);
    // created, activated, upgraded, cancellation_scheduled
    assert_eq!(stored.version, 4);
    assert_eq!(env.event_kinds(sub.id).await.len(), 4);
}
