//! Append-only billing event log.

use crate::error::SubscriptionError;
use crate::models::{BillingEvent, EventQuery, NewBillingEvent};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Result of an append.
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    Appended(BillingEvent),
    /// The dedup key was already used for this subscription; nothing stored.
    Duplicate { sequence: u64 },
}

#[async_trait]
pub trait BillingEventLog: Send + Sync {
    /// Store an event unless `(subscription_id, dedup_key)` was seen before.
    async fn append(
        &self,
        event: NewBillingEvent,
        dedup_key: &str,
    ) -> Result<AppendOutcome, SubscriptionError>;

    async fn contains(&self, subscription_id: Uuid, dedup_key: &str)
        -> Result<bool, SubscriptionError>;

    /// Up to `limit` matching events with `sequence > after_sequence`, in order.
    async fn read_page(
        &self,
        query: &EventQuery,
        after_sequence: u64,
        limit: usize,
    ) -> Result<Vec<BillingEvent>, SubscriptionError>;
}

#[derive(Debug, Default)]
struct LogState {
    events: Vec<BillingEvent>,
    by_subscription: HashMap<Uuid, Vec<usize>>,
    dedup: HashMap<(Uuid, String), u64>,
}

/// In-memory log. Sequence `n` lives at index `n - 1`.
#[derive(Debug, Default)]
pub struct InMemoryEventLog {
    state: RwLock<LogState>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.events.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl BillingEventLog for InMemoryEventLog {
    async fn append(
        &self,
        event: NewBillingEvent,
        dedup_key: &str,
    ) -> Result<AppendOutcome, SubscriptionError> {
        let mut state = self.state.write().await;
        let key = (event.subscription_id, dedup_key.to_string());

        if let Some(sequence) = state.dedup.get(&key) {
            tracing::debug!(
                subscription_id = %event.subscription_id,
                dedup_key,
                sequence,
                "Duplicate billing event ignored"
            );
            return Ok(AppendOutcome::Duplicate {
                sequence: *sequence,
            });
        }

        let latest = state
            .by_subscription
            .get(&event.subscription_id)
            .and_then(|indices| indices.last())
            .map(|&index| state.events[index].occurred_at);
        if let Some(latest) = latest.filter(|latest| event.occurred_at < *latest) {
            return Err(SubscriptionError::InvalidRequest(format!(
                "event at {} precedes latest event at {} for subscription {}",
                event.occurred_at, latest, event.subscription_id
            )));
        }

        let index = state.events.len();
        let sequence = index as u64 + 1;
        let stored = BillingEvent::from_new(event, sequence, dedup_key);

        state
            .by_subscription
            .entry(stored.subscription_id)
            .or_default()
            .push(index);
        state.dedup.insert(key, sequence);
        state.events.push(stored.clone());

        Ok(AppendOutcome::Appended(stored))
    }

    async fn contains(
        &self,
        subscription_id: Uuid,
        dedup_key: &str,
    ) -> Result<bool, SubscriptionError> {
        let state = self.state.read().await;
        Ok(state
            .dedup
            .contains_key(&(subscription_id, dedup_key.to_string())))
    }

    async fn read_page(
        &self,
        query: &EventQuery,
        after_sequence: u64,
        limit: usize,
    ) -> Result<Vec<BillingEvent>, SubscriptionError> {
        let state = self.state.read().await;
        let start = usize::try_from(after_sequence).unwrap_or(usize::MAX);

        let page = match query.subscription_id {
            Some(subscription_id) => {
                let indices = state
                    .by_subscription
                    .get(&subscription_id)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                let first = indices.partition_point(|&index| index < start);
                indices[first..]
                    .iter()
                    .map(|&index| &state.events[index])
                    .filter(|event| query.matches(event))
                    .take(limit)
                    .cloned()
                    .collect()
            }
            None => state
                .events
                .iter()
                .skip(start)
                .filter(|event| query.matches(event))
                .take(limit)
                .cloned()
                .collect(),
        };
        Ok(page)
    }
}

/// Lazy, forward-ordered and restartable view over the log.
///
/// Each call to [`EventCursor::stream`] starts again from the cursor's
/// position and fetches pages only as they are consumed.
#[derive(Clone)]
pub struct EventCursor {
    log: Arc<dyn BillingEventLog>,
    query: EventQuery,
    after_sequence: u64,
    page_size: usize,
}

struct CursorState {
    log: Arc<dyn BillingEventLog>,
    query: EventQuery,
    after_sequence: u64,
    page_size: usize,
    buffer: VecDeque<BillingEvent>,
    exhausted: bool,
}

impl EventCursor {
    pub const DEFAULT_PAGE_SIZE: usize = 256;

    pub fn new(log: Arc<dyn BillingEventLog>, query: EventQuery) -> Self {
        Self {
            log,
            query,
            after_sequence: 0,
            page_size: Self::DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Resume after an event already seen.
    pub fn starting_after(mut self, sequence: u64) -> Self {
        self.after_sequence = sequence;
        self
    }

    pub fn stream(&self) -> BoxStream<'static, Result<BillingEvent, SubscriptionError>> {
        let state = CursorState {
            log: self.log.clone(),
            query: self.query.clone(),
            after_sequence: self.after_sequence,
            page_size: self.page_size,
            buffer: VecDeque::new(),
            exhausted: false,
        };

        stream::unfold(state, |mut state| async move {
            loop {
                if let Some(event) = state.buffer.pop_front() {
                    state.after_sequence = event.sequence;
                    return Some((Ok(event), state));
                }
                if state.exhausted {
                    return None;
                }
                match state
                    .log
                    .read_page(&state.query, state.after_sequence, state.page_size)
                    .await
                {
                    Ok(page) => {
                        state.exhausted = page.len() < state.page_size;
                        if page.is_empty() {
                            return None;
                        }
                        state.buffer.extend(page);
                    }
                    Err(e) => {
                        state.exhausted = true;
                        return Some((Err(e), state));
                    }
                }
            }
        })
        .boxed()
    }

    pub async fn collect(&self) -> Result<Vec<BillingEvent>, SubscriptionError> {
        self.stream().try_collect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BillingEventKind, PlanId, SubscriptionStatus};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn new_event(subscription_id: Uuid, kind: BillingEventKind, at: DateTime<Utc>) -> NewBillingEvent {
        NewBillingEvent {
            subscription_id,
            user_id: Uuid::nil(),
            kind,
            occurred_at: at,
            amount: None,
            plan_id: PlanId::new("basic"),
            quantity: 1,
            from_status: None,
            to_status: SubscriptionStatus::Active,
        }
    }

    #[tokio::test]
    async fn duplicate_dedup_key_stores_one_event() {
        let log = InMemoryEventLog::new();
        let id = Uuid::new_v4();

        let first = log
            .append(new_event(id, BillingEventKind::Renewed, t0()), "evt_1")
            .await
            .unwrap();
        let second = log
            .append(new_event(id, BillingEventKind::Renewed, t0()), "evt_1")
            .await
            .unwrap();

        assert!(matches!(first, AppendOutcome::Appended(ref e) if e.sequence == 1));
        assert_eq!(second, AppendOutcome::Duplicate { sequence: 1 });
        assert_eq!(log.len().await, 1);
        assert!(log.contains(id, "evt_1").await.unwrap());
    }

    #[tokio::test]
    async fn same_key_on_other_subscription_is_distinct() {
        let log = InMemoryEventLog::new();
        log.append(new_event(Uuid::new_v4(), BillingEventKind::Created, t0()), "k")
            .await
            .unwrap();
        log.append(new_event(Uuid::new_v4(), BillingEventKind::Created, t0()), "k")
            .await
            .unwrap();
        assert_eq!(log.len().await, 2);
    }

    #[tokio::test]
    async fn rejects_event_older_than_latest() {
        let log = InMemoryEventLog::new();
        let id = Uuid::new_v4();
        log.append(new_event(id, BillingEventKind::Created, t0()), "a")
            .await
            .unwrap();
        let err = log
            .append(
                new_event(id, BillingEventKind::Renewed, t0() - Duration::seconds(1)),
                "b",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SubscriptionError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn cursor_pages_lazily_and_restarts() {
        let log: Arc<dyn BillingEventLog> = Arc::new(InMemoryEventLog::new());
        let id = Uuid::new_v4();
        let other = Uuid::new_v4();
        for day in 0..5 {
            let at = t0() + Duration::days(day);
            log.append(new_event(id, BillingEventKind::Renewed, at), &format!("r{day}"))
                .await
                .unwrap();
            log.append(new_event(other, BillingEventKind::Renewed, at), &format!("r{day}"))
                .await
                .unwrap();
        }

        let cursor = EventCursor::new(
            log.clone(),
            EventQuery::for_subscription(id).since(Some(t0() + Duration::days(1))),
        )
        .with_page_size(2);

        let first: Vec<_> = cursor.collect().await.unwrap();
        assert_eq!(first.len(), 4);
        assert!(first.windows(2).all(|w| w[0].sequence < w[1].sequence));
        assert!(first.iter().all(|e| e.subscription_id == id));

        let again = cursor.collect().await.unwrap();
        assert_eq!(first, again);

        let resumed = cursor
            .clone()
            .starting_after(first[1].sequence)
            .collect()
            .await
            .unwrap();
        assert_eq!(resumed, first[2..].to_vec());
    }

    #[tokio::test]
    async fn cursor_can_stop_early() {
        let log: Arc<dyn BillingEventLog> = Arc::new(InMemoryEventLog::new());
        let id = Uuid::new_v4();
        for n in 0..10 {
            log.append(new_event(id, BillingEventKind::Renewed, t0()), &n.to_string())
                .await
                .unwrap();
        }
        let cursor = EventCursor::new(log, EventQuery::for_subscription(id)).with_page_size(3);
        let head: Vec<_> = cursor.stream().take(2).try_collect().await.unwrap();
        assert_eq!(head.len(), 2);
    }
}
