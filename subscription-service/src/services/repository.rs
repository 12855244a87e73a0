//! Subscription storage with optimistic concurrency.

use crate::error::SubscriptionError;
use crate::models::{ListSubscriptionsFilter, Subscription};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use uuid::Uuid;

#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<Subscription>, SubscriptionError>;

    /// The user's non-terminal subscription, or else their most recent one.
    async fn find_current_for_user(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, SubscriptionError>;

    /// Store a new subscription. Fails with `AlreadySubscribed` if the user
    /// already holds a non-terminal one; the check and the insert are atomic.
    async fn insert(
        &self,
        subscription: &Subscription,
        now: DateTime<Utc>,
    ) -> Result<(), SubscriptionError>;

    /// Replace the stored subscription if its version is still `expected_version`.
    async fn compare_and_swap(
        &self,
        expected_version: u64,
        subscription: &Subscription,
    ) -> Result<(), SubscriptionError>;

    /// One page in id order, starting after `filter.page_token`.
    async fn list(
        &self,
        filter: &ListSubscriptionsFilter,
    ) -> Result<Vec<Subscription>, SubscriptionError>;

    async fn health_check(&self) -> Result<(), SubscriptionError>;
}

#[derive(Debug, Default)]
struct Store {
    by_id: BTreeMap<Uuid, Subscription>,
    by_user: HashMap<Uuid, Vec<Uuid>>,
}

#[derive(Debug, Default)]
pub struct InMemorySubscriptionRepository {
    store: RwLock<Store>,
}

impl InMemorySubscriptionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionRepository for InMemorySubscriptionRepository {
    async fn get(&self, id: Uuid) -> Result<Option<Subscription>, SubscriptionError> {
        Ok(self.store.read().await.by_id.get(&id).cloned())
    }

    async fn find_current_for_user(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, SubscriptionError> {
        let store = self.store.read().await;
        let owned: Vec<&Subscription> = store
            .by_user
            .get(&user_id)
            .into_iter()
            .flatten()
            .filter_map(|id| store.by_id.get(id))
            .collect();

        let current = owned
            .iter()
            .find(|sub| !sub.is_terminal(now))
            .or_else(|| owned.iter().max_by_key(|sub| sub.created_at));
        Ok(current.map(|sub| (*sub).clone()))
    }

    async fn insert(
        &self,
        subscription: &Subscription,
        now: DateTime<Utc>,
    ) -> Result<(), SubscriptionError> {
        let mut store = self.store.write().await;

        if store.by_id.contains_key(&subscription.id) {
            return Err(SubscriptionError::Storage(anyhow::anyhow!(
                "subscription {} already stored",
                subscription.id
            )));
        }

        let live = store
            .by_user
            .get(&subscription.user_id)
            .into_iter()
            .flatten()
            .filter_map(|id| store.by_id.get(id))
            .find(|existing| !existing.is_terminal(now))
            .map(|existing| existing.id);
        if let Some(existing_id) = live {
            return Err(SubscriptionError::AlreadySubscribed {
                user_id: subscription.user_id,
                subscription_id: existing_id,
            });
        }

        store
            .by_user
            .entry(subscription.user_id)
            .or_default()
            .push(subscription.id);
        store.by_id.insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        subscription: &Subscription,
    ) -> Result<(), SubscriptionError> {
        let mut store = self.store.write().await;
        let stored = store
            .by_id
            .get_mut(&subscription.id)
            .ok_or(SubscriptionError::SubscriptionNotFound(subscription.id))?;

        if stored.version != expected_version {
            return Err(SubscriptionError::ConcurrentModification {
                id: subscription.id,
                expected: expected_version,
                actual: stored.version,
            });
        }
        *stored = subscription.clone();
        Ok(())
    }

    async fn list(
        &self,
        filter: &ListSubscriptionsFilter,
    ) -> Result<Vec<Subscription>, SubscriptionError> {
        use std::ops::Bound::{Excluded, Unbounded};

        let store = self.store.read().await;
        let lower = filter.page_token.map_or(Unbounded, Excluded);
        let page_size = if filter.page_size == 0 {
            usize::MAX
        } else {
            filter.page_size
        };

        Ok(store
            .by_id
            .range((lower, Unbounded))
            .map(|(_, sub)| sub)
            .filter(|sub| filter.matches(sub))
            .take(page_size)
            .cloned()
            .collect())
    }

    async fn health_check(&self) -> Result<(), SubscriptionError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PlanId, SubscriptionStatus};
    use chrono::Duration;

    fn subscription(user_id: Uuid, status: SubscriptionStatus) -> Subscription {
        let now = Utc::now();
        Subscription {
            id: Uuid::new_v4(),
            user_id,
            plan_id: PlanId::new("basic"),
            status,
            quantity: 1,
            payment_method: "pm_card".to_string(),
            trial_ends_at: None,
            current_period_start: now,
            current_period_end: now + Duration::days(30),
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

    #[tokio::test]
    async fn insert_enforces_one_live_subscription_per_user() {
        let repo = InMemorySubscriptionRepository::new();
        let user = Uuid::new_v4();
        let now = Utc::now();

        repo.insert(&subscription(user, SubscriptionStatus::Active), now)
            .await
            .unwrap();
        let err = repo
            .insert(&subscription(user, SubscriptionStatus::Trialing), now)
            .await
            .unwrap_err();
        assert!(matches!(err, SubscriptionError::AlreadySubscribed { .. }));
    }

    #[tokio::test]
    async fn terminal_subscription_allows_resubscribe() {
        let repo = InMemorySubscriptionRepository::new();
        let user = Uuid::new_v4();
        let now = Utc::now();

        repo.insert(&subscription(user, SubscriptionStatus::Unpaid), now)
            .await
            .unwrap();
        let fresh = subscription(user, SubscriptionStatus::Active);
        repo.insert(&fresh, now).await.unwrap();

        let current = repo.find_current_for_user(user, now).await.unwrap().unwrap();
        assert_eq!(current.id, fresh.id);
    }

    #[tokio::test]
    async fn stale_version_is_rejected() {
        let repo = InMemorySubscriptionRepository::new();
        let mut sub = subscription(Uuid::new_v4(), SubscriptionStatus::Active);
        repo.insert(&sub, Utc::now()).await.unwrap();

        sub.version = 2;
        repo.compare_and_swap(1, &sub).await.unwrap();

        sub.version = 3;
        let err = repo.compare_and_swap(1, &sub).await.unwrap_err();
        assert!(matches!(
            err,
            SubscriptionError::ConcurrentModification {
                expected: 1,
                actual: 2,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn list_pages_by_token() {
        let repo = InMemorySubscriptionRepository::new();
        let now = Utc::now();
        for _ in 0..5 {
            repo.insert(&subscription(Uuid::new_v4(), SubscriptionStatus::Active), now)
                .await
                .unwrap();
        }

        let mut filter = ListSubscriptionsFilter {
            page_size: 2,
            ..Default::default()
        };
        let mut seen = Vec::new();
        loop {
            let page = repo.list(&filter).await.unwrap();
            if page.is_empty() {
                break;
            }
            filter.page_token = page.last().map(|sub| sub.id);
            seen.extend(page.into_iter().map(|sub| sub.id));
        }
        assert_eq!(seen.len(), 5);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }
}
