//! Command execution: load, decide, charge, apply, commit.

use super::analytics::{self, AnalyticsReport, AnalyticsWindow};
use super::catalog::{CatalogHandle, PlanCatalog};
use super::clock::TimeSource;
use super::event_log::{AppendOutcome, BillingEventLog, EventCursor};
use super::gateway::{
    AuthorizationRequest, ChargeOutcome, ChargePurpose, ChargeRequest, PaymentGateway,
};
use super::lifecycle::{self, Command, LifecyclePolicy, Transition, TransitionContext};
use super::metrics::{record_charge, record_command, record_transition};
use super::projection;
use super::proration::ProrationQuote;
use super::repository::SubscriptionRepository;
use super::retry::{retry_on_conflict, ConflictRetryConfig};
use crate::error::SubscriptionError;
use crate::models::{
    BillingEvent, CreateSubscription, EventQuery, ListSubscriptionsFilter, NewBillingEvent, PlanId,
    Subscription, SubscriptionView,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::instrument;
use uuid::Uuid;

/// Result of a committed (or deduplicated) command.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub subscription: Subscription,
    pub events: Vec<BillingEvent>,
    pub charged: Option<i64>,
    /// The command's dedup key had already been processed; nothing changed.
    pub duplicate: bool,
}

impl CommandOutcome {
    fn duplicate(subscription: Subscription) -> Self {
        Self {
            subscription,
            events: Vec::new(),
            charged: None,
            duplicate: true,
        }
    }
}

/// Subscription engine.
///
/// Gateway calls happen between evaluating and committing a command; the
/// commit is a compare-and-swap on the version that was loaded, and a lost
/// race re-runs the whole command against fresh state. Commits to the same
/// subscription and their event appends are serialized so its log order
/// matches its commit order; different subscriptions commit independently.
pub struct SubscriptionEngine {
    repository: Arc<dyn SubscriptionRepository>,
    events: Arc<dyn BillingEventLog>,
    gateway: Arc<dyn PaymentGateway>,
    catalog: Arc<CatalogHandle>,
    clock: Arc<dyn TimeSource>,
    policy: LifecyclePolicy,
    conflict_retry: ConflictRetryConfig,
    commit_locks: Vec<Mutex<()>>,
}

/// Lock stripes shared by all subscriptions.
const COMMIT_LOCK_STRIPES: usize = 64;

impl SubscriptionEngine {
    pub fn new(
        repository: Arc<dyn SubscriptionRepository>,
        events: Arc<dyn BillingEventLog>,
        gateway: Arc<dyn PaymentGateway>,
        catalog: Arc<CatalogHandle>,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            repository,
            events,
            gateway,
            catalog,
            clock,
            policy: LifecyclePolicy::default(),
            conflict_retry: ConflictRetryConfig::default(),
            commit_locks: (0..COMMIT_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn with_policy(mut self, policy: LifecyclePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_conflict_retry(mut self, conflict_retry: ConflictRetryConfig) -> Self {
        self.conflict_retry = conflict_retry;
        self
    }

    /// Commit lock guarding `id`.
    fn commit_lock(&self, id: Uuid) -> &Mutex<()> {
        let stripe = (id.as_u128() % self.commit_locks.len() as u128) as usize;
        &self.commit_locks[stripe]
    }

    pub fn policy(&self) -> &LifecyclePolicy {
        &self.policy
    }

    pub fn catalog(&self) -> Arc<PlanCatalog> {
        self.catalog.snapshot()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn repository(&self) -> &Arc<dyn SubscriptionRepository> {
        &self.repository
    }

    /// Create a subscription and, for plans without a trial, take the first
    /// payment.
    #[instrument(skip(self, request), fields(user_id = %request.user_id, plan_id = %request.plan_id))]
    pub async fn subscribe(
        &self,
        request: CreateSubscription,
    ) -> Result<CommandOutcome, SubscriptionError> {
        let started = Instant::now();
        let result = self.subscribe_inner(&request).await;
        record_command("subscribe", outcome_label(&result), started.elapsed().as_secs_f64());
        result
    }

    async fn subscribe_inner(
        &self,
        request: &CreateSubscription,
    ) -> Result<CommandOutcome, SubscriptionError> {
        let catalog = self.catalog.snapshot();
        let now = self.clock.now();
        let existing = self
            .repository
            .find_current_for_user(request.user_id, now)
            .await?;
        let plan = lifecycle::check_subscribe(existing.as_ref(), &catalog, request, now)?;
        let id = Uuid::new_v4();

        if plan.has_trial() {
            let authorization = AuthorizationRequest {
                user_id: request.user_id,
                payment_method: request.payment_method.clone(),
                idempotency_key: format!("authorize:{id}"),
            };
            if self.gateway.authorize(&authorization).await? == ChargeOutcome::Declined {
                return Err(SubscriptionError::PaymentFailed(
                    "payment method authorization declined".to_string(),
                ));
            }
        }

        let transition = lifecycle::subscribe(id, request, plan, now)?;
        let events = {
            let _commit = self.commit_lock(id).lock().await;
            self.repository.insert(&transition.subscription, now).await?;
            self.append_events(&transition.subscription, transition.events, None)
                .await?
        };
        tracing::info!(
            subscription_id = %id,
            status = transition.subscription.status.as_str(),
            "Subscription created"
        );

        let created = CommandOutcome {
            subscription: transition.subscription,
            events,
            charged: None,
            duplicate: false,
        };
        if plan.has_trial() {
            return Ok(created);
        }

        let charge = ChargeRequest {
            subscription_id: id,
            amount: created.subscription.amount_due,
            payment_method: request.payment_method.clone(),
            purpose: ChargePurpose::FirstPayment,
            idempotency_key: format!("subscribe:{id}"),
        };
        let outcome = self.charge(&charge).await?;
        if !outcome.is_success() {
            tracing::info!(
                subscription_id = %id,
                outcome = outcome.as_str(),
                "First payment not settled, subscription incomplete"
            );
            return Ok(created);
        }

        let mut confirmed = self
            .execute(
                id,
                Command::ConfirmPayment { success: true },
                Some(format!("first-payment:{id}")),
            )
            .await?;
        let mut events = created.events;
        events.append(&mut confirmed.events);
        confirmed.events = events;
        Ok(confirmed)
    }

    /// Gateway confirmation of the first payment of an `incomplete` subscription.
    pub async fn confirm_payment(
        &self,
        id: Uuid,
        success: bool,
        dedup_key: Option<String>,
    ) -> Result<CommandOutcome, SubscriptionError> {
        self.execute(id, Command::ConfirmPayment { success }, dedup_key)
            .await
    }

    /// Gateway-reported renewal or dunning result.
    pub async fn record_payment_result(
        &self,
        id: Uuid,
        success: bool,
        dedup_key: Option<String>,
    ) -> Result<CommandOutcome, SubscriptionError> {
        self.execute(id, Command::RecordPaymentResult { success }, dedup_key)
            .await
    }

    pub async fn convert_trial(&self, id: Uuid) -> Result<CommandOutcome, SubscriptionError> {
        self.execute(id, Command::ConvertTrial, None).await
    }

    pub async fn renew(&self, id: Uuid) -> Result<CommandOutcome, SubscriptionError> {
        self.execute(id, Command::Renew, None).await
    }

    pub async fn retry_payment(&self, id: Uuid) -> Result<CommandOutcome, SubscriptionError> {
        self.execute(id, Command::RetryPayment, None).await
    }

    pub async fn expire_incomplete(&self, id: Uuid) -> Result<CommandOutcome, SubscriptionError> {
        self.execute(id, Command::ExpireIncomplete, None).await
    }

    pub async fn request_upgrade(
        &self,
        id: Uuid,
        target: PlanId,
    ) -> Result<CommandOutcome, SubscriptionError> {
        self.execute(id, Command::Upgrade { target }, None).await
    }

    pub async fn request_downgrade(
        &self,
        id: Uuid,
        target: PlanId,
    ) -> Result<CommandOutcome, SubscriptionError> {
        self.execute(id, Command::Downgrade { target }, None).await
    }

    pub async fn cancel_pending_change(
        &self,
        id: Uuid,
    ) -> Result<CommandOutcome, SubscriptionError> {
        self.execute(id, Command::CancelPendingChange, None).await
    }

    pub async fn cancel(
        &self,
        id: Uuid,
        immediate: bool,
    ) -> Result<CommandOutcome, SubscriptionError> {
        self.execute(id, Command::Cancel { immediate }, None).await
    }

    pub async fn resume(&self, id: Uuid) -> Result<CommandOutcome, SubscriptionError> {
        self.execute(id, Command::Resume, None).await
    }

    pub async fn extend_trial(
        &self,
        id: Uuid,
        days: u32,
    ) -> Result<CommandOutcome, SubscriptionError> {
        self.execute(id, Command::ExtendTrial { days }, None).await
    }

    pub async fn archive(&self, id: Uuid) -> Result<CommandOutcome, SubscriptionError> {
        self.execute(id, Command::Archive, None).await
    }

    /// Run any command against a stored subscription.
    ///
    /// With a `dedup_key`, a key already recorded for this subscription makes
    /// the call a no-op that reports `duplicate`.
    #[instrument(skip(self, command, dedup_key), fields(command = command.name()))]
    pub async fn execute(
        &self,
        id: Uuid,
        command: Command,
        dedup_key: Option<String>,
    ) -> Result<CommandOutcome, SubscriptionError> {
        let started = Instant::now();
        let name = command.name();
        let result = retry_on_conflict(name, self.conflict_retry, || {
            self.execute_once(id, &command, dedup_key.as_deref())
        })
        .await;
        record_command(name, outcome_label(&result), started.elapsed().as_secs_f64());

        match &result {
            Ok(outcome) if !outcome.duplicate => tracing::info!(
                subscription_id = %id,
                status = outcome.subscription.status.as_str(),
                events = outcome.events.len(),
                charged = ?outcome.charged,
                "Command committed"
            ),
            Ok(_) => tracing::info!(subscription_id = %id, "Duplicate command ignored"),
            Err(e) if e.is_fatal() => {
                tracing::error!(subscription_id = %id, error = %e, "Command failed")
            }
            Err(e) => tracing::info!(
                subscription_id = %id,
                code = e.code(),
                error = %e,
                "Command rejected"
            ),
        }
        result
    }

    async fn execute_once(
        &self,
        id: Uuid,
        command: &Command,
        dedup_key: Option<&str>,
    ) -> Result<CommandOutcome, SubscriptionError> {
        let current = self.load(id).await?;
        if let Some(key) = dedup_key {
            if self.events.contains(id, key).await? {
                return Ok(CommandOutcome::duplicate(current));
            }
        }

        let catalog = self.catalog.snapshot();
        let ctx = TransitionContext {
            now: self.clock.now(),
            catalog: &catalog,
            policy: &self.policy,
        };

        let decision = lifecycle::decide(&current, command, &ctx)?;
        let payment = match &decision.charge {
            Some(request) if request.amount > 0 => Some(self.charge(request).await?),
            Some(_) => Some(ChargeOutcome::Succeeded),
            None => None,
        };
        let transition = lifecycle::apply(&current, command, payment, &ctx)?;
        self.commit(&current, transition, dedup_key).await
    }

    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome, SubscriptionError> {
        let outcome = self.gateway.charge(request).await?;
        record_charge(request.purpose.as_str(), outcome.as_str(), request.amount);
        Ok(outcome)
    }

    async fn commit(
        &self,
        previous: &Subscription,
        transition: Transition,
        dedup_key: Option<&str>,
    ) -> Result<CommandOutcome, SubscriptionError> {
        let Transition {
            mut subscription,
            events,
            charged,
        } = transition;
        subscription.version = previous.version + 1;

        let _commit = self.commit_lock(previous.id).lock().await;
        if let Some(key) = dedup_key {
            if self.events.contains(previous.id, key).await? {
                return Ok(CommandOutcome::duplicate(self.load(previous.id).await?));
            }
        }
        self.repository
            .compare_and_swap(previous.version, &subscription)
            .await?;
        if previous.status != subscription.status {
            record_transition(previous.status.as_str(), subscription.status.as_str());
        }

        let events = self.append_events(&subscription, events, dedup_key).await?;
        Ok(CommandOutcome {
            subscription,
            events,
            charged,
            duplicate: false,
        })
    }

    /// Append a transition's events. The first event carries the caller's
    /// dedup key; the rest, and events of keyless commands, get keys derived
    /// from the committed version.
    async fn append_events(
        &self,
        subscription: &Subscription,
        events: Vec<NewBillingEvent>,
        dedup_key: Option<&str>,
    ) -> Result<Vec<BillingEvent>, SubscriptionError> {
        let mut appended = Vec::with_capacity(events.len());
        for (index, event) in events.into_iter().enumerate() {
            let key = match (dedup_key, index) {
                (Some(key), 0) => key.to_string(),
                (Some(key), n) => format!("{key}#{n}"),
                (None, n) => format!("v{}:{}", subscription.version, n),
            };
            if let AppendOutcome::Appended(stored) = self.events.append(event, &key).await? {
                appended.push(stored);
            }
        }
        Ok(appended)
    }

    async fn load(&self, id: Uuid) -> Result<Subscription, SubscriptionError> {
        self.repository
            .get(id)
            .await?
            .ok_or(SubscriptionError::SubscriptionNotFound(id))
    }

    pub async fn get(&self, id: Uuid) -> Result<Subscription, SubscriptionError> {
        self.load(id).await
    }

    pub async fn view(&self, id: Uuid) -> Result<SubscriptionView, SubscriptionError> {
        let subscription = self.load(id).await?;
        projection::project(&subscription, &self.catalog.snapshot(), self.clock.now())
    }

    pub async fn current_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Option<SubscriptionView>, SubscriptionError> {
        let now = self.clock.now();
        match self.repository.find_current_for_user(user_id, now).await? {
            Some(subscription) => Ok(Some(projection::project(
                &subscription,
                &self.catalog.snapshot(),
                now,
            )?)),
            None => Ok(None),
        }
    }

    pub async fn list(
        &self,
        filter: &ListSubscriptionsFilter,
    ) -> Result<Vec<SubscriptionView>, SubscriptionError> {
        let catalog = self.catalog.snapshot();
        let now = self.clock.now();
        self.repository
            .list(filter)
            .await?
            .iter()
            .map(|subscription| projection::project(subscription, &catalog, now))
            .collect()
    }

    pub async fn preview_upgrade(
        &self,
        id: Uuid,
        target: &PlanId,
    ) -> Result<ProrationQuote, SubscriptionError> {
        let subscription = self.load(id).await?;
        let catalog = self.catalog.snapshot();
        let ctx = TransitionContext {
            now: self.clock.now(),
            catalog: &catalog,
            policy: &self.policy,
        };
        lifecycle::preview_upgrade(&subscription, target, &ctx)
    }

    /// Lazy, restartable sequence of a subscription's events from `since`.
    pub fn events_for(&self, id: Uuid, since: Option<DateTime<Utc>>) -> EventCursor {
        EventCursor::new(
            self.events.clone(),
            EventQuery::for_subscription(id).since(since),
        )
    }

    /// Recompute revenue metrics from the whole log.
    #[instrument(skip(self))]
    pub async fn analytics(
        &self,
        window: AnalyticsWindow,
    ) -> Result<AnalyticsReport, SubscriptionError> {
        let events = EventCursor::new(self.events.clone(), EventQuery::default())
            .collect()
            .await?;
        analytics::compute(&events, &self.catalog.snapshot(), window)
    }

    pub async fn health_check(&self) -> Result<(), SubscriptionError> {
        self.repository.health_check().await
    }
}

fn outcome_label<T>(result: &Result<T, SubscriptionError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(e) => e.code(),
    }
}
