//! Background scheduler issuing time-driven commands.
//!
//! A scan pages through stored subscriptions, works out which command (if
//! any) is due for each, and runs it through the engine like any other
//! caller. Re-running a scan is harmless: a command that is no longer legal
//! is rejected by the state machine and counted as skipped.

use super::engine::SubscriptionEngine;
use super::lifecycle::{Command, LifecyclePolicy};
use super::metrics::record_scheduler_dispatch;
use crate::error::SubscriptionError;
use crate::models::{ListSubscriptionsFilter, Subscription, SubscriptionStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval: Duration,
    /// Maximum commands dispatched per scan.
    pub batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
            batch_size: 500,
        }
    }
}

/// Counts reported by one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub scanned: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Command the scheduler should issue for `sub` at `now`, if any.
pub fn due_command(
    sub: &Subscription,
    now: DateTime<Utc>,
    policy: &LifecyclePolicy,
) -> Option<Command> {
    if sub.pending_charge.is_some() {
        return None;
    }
    match sub.status {
        SubscriptionStatus::Trialing if sub.trial_ends_at.is_some_and(|end| now >= end) => {
            Some(Command::ConvertTrial)
        }
        SubscriptionStatus::Active if now >= sub.current_period_end => Some(Command::Renew),
        SubscriptionStatus::PastDue
            if sub.next_payment_attempt_at.is_some_and(|at| now >= at)
                || sub.grace_deadline.is_some_and(|at| now >= at) =>
        {
            Some(Command::RetryPayment)
        }
        SubscriptionStatus::Incomplete if now >= sub.created_at + policy.incomplete_window => {
            Some(Command::ExpireIncomplete)
        }
        _ if !sub.is_archived()
            && sub
                .terminated_at(now)
                .is_some_and(|at| now >= at + policy.archive_retention) =>
        {
            Some(Command::Archive)
        }
        _ => None,
    }
}

pub struct Scheduler {
    engine: Arc<SubscriptionEngine>,
    config: SchedulerConfig,
    shutdown_token: CancellationToken,
}

impl Scheduler {
    pub fn new(engine: Arc<SubscriptionEngine>, config: SchedulerConfig) -> Self {
        Self {
            engine,
            config,
            shutdown_token: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Scan once and dispatch every due command, up to the batch size.
    pub async fn run_once(&self) -> Result<ScanReport, SubscriptionError> {
        let now = self.engine.now();
        let policy = self.engine.policy().clone();
        let mut report = ScanReport::default();
        let mut filter = ListSubscriptionsFilter {
            page_size: self.config.batch_size.max(1),
            ..Default::default()
        };

        'scan: loop {
            let page = self.engine.repository().list(&filter).await?;
            let Some(last) = page.last() else {
                break;
            };
            filter.page_token = Some(last.id);
            report.scanned += page.len();

            for subscription in &page {
                if report.processed >= self.config.batch_size {
                    break 'scan;
                }
                let Some(command) = due_command(subscription, now, &policy) else {
                    continue;
                };
                report.processed += 1;
                self.dispatch(subscription, command, &mut report).await;
            }
        }

        if report.processed > 0 {
            tracing::info!(
                scanned = report.scanned,
                processed = report.processed,
                succeeded = report.succeeded,
                skipped = report.skipped,
                failed = report.failed,
                "Scheduler scan completed"
            );
        }
        Ok(report)
    }

    async fn dispatch(&self, subscription: &Subscription, command: Command, report: &mut ScanReport) {
        let action = command.name();
        match self.engine.execute(subscription.id, command, None).await {
            Ok(_) => {
                report.succeeded += 1;
                record_scheduler_dispatch(action, "succeeded");
            }
            Err(SubscriptionError::InvalidTransition { .. }) => {
                report.skipped += 1;
                record_scheduler_dispatch(action, "skipped");
            }
            Err(e) => {
                report.failed += 1;
                record_scheduler_dispatch(action, "failed");
                tracing::warn!(
                    subscription_id = %subscription.id,
                    action,
                    error = %e,
                    "Scheduled command failed"
                );
            }
        }
    }

    /// Scan on every tick until the shutdown token is cancelled.
    pub async fn start(self) {
        if !self.config.enabled {
            tracing::info!("Scheduler disabled by configuration");
            return;
        }

        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            batch_size = self.config.batch_size,
            "Starting subscription scheduler"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => {
                    tracing::info!("Scheduler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        tracing::error!(error = %e, "Scheduler scan failed");
                    }
                }
            }
        }
    }
}
