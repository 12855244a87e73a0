//! Configuration module for subscription-service.

use crate::models::PastDuePolicy;
use crate::services::{ConflictRetryConfig, LifecyclePolicy, SchedulerConfig};
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub plan_catalog_path: PathBuf,
    pub billing: BillingPolicyConfig,
    pub scheduler: SchedulerSettings,
    pub conflict_max_retries: u32,
    /// HMAC secret for payment webhooks. Unsigned webhooks are accepted when unset.
    pub webhook_secret: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BillingPolicyConfig {
    pub grace_period_days: i64,
    pub payment_retry_interval_hours: i64,
    pub past_due_policy: PastDuePolicy,
    pub incomplete_expiry_hours: i64,
    pub archive_retention_days: i64,
}

impl Default for BillingPolicyConfig {
    fn default() -> Self {
        Self {
            grace_period_days: 7,
            payment_retry_interval_hours: 72,
            past_due_policy: PastDuePolicy::Unpaid,
            incomplete_expiry_hours: 23,
            archive_retention_days: 30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub enabled: bool,
    pub interval_secs: u64,
    pub batch_size: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            batch_size: 500,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl SubscriptionConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let past_due_policy = match env::var("PAST_DUE_POLICY") {
            Ok(value) => PastDuePolicy::from_string(&value.to_lowercase()).ok_or_else(|| {
                AppError::ConfigError(anyhow::anyhow!(
                    "PAST_DUE_POLICY must be 'unpaid' or 'canceled', got '{}'",
                    value
                ))
            })?,
            Err(_) => PastDuePolicy::Unpaid,
        };

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "subscription-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            plan_catalog_path: env::var("PLAN_CATALOG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("catalog.json")),
            billing: BillingPolicyConfig {
                grace_period_days: env_or("GRACE_PERIOD_DAYS", 7),
                payment_retry_interval_hours: env_or("PAYMENT_RETRY_INTERVAL_HOURS", 72),
                past_due_policy,
                incomplete_expiry_hours: env_or("INCOMPLETE_EXPIRY_HOURS", 23),
                archive_retention_days: env_or("ARCHIVE_RETENTION_DAYS", 30),
            },
            scheduler: SchedulerSettings {
                enabled: env_or("SCHEDULER_ENABLED", true),
                interval_secs: env_or("SCHEDULER_INTERVAL_SECS", 60),
                batch_size: env_or("SCHEDULER_BATCH_SIZE", 500),
            },
            conflict_max_retries: env_or("CONFLICT_MAX_RETRIES", 5),
            webhook_secret: env::var("WEBHOOK_SECRET").ok().filter(|s| !s.is_empty()),
        })
    }

    /// Configuration for tests: ephemeral port, catalog at `plan_catalog_path`,
    /// scheduler off.
    pub fn for_tests(plan_catalog_path: PathBuf) -> Self {
        Self {
            common: core_config::Config {
                port: 0,
                environment: "test".to_string(),
            },
            service_name: "subscription-service".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            log_level: "info".to_string(),
            otlp_endpoint: None,
            plan_catalog_path,
            billing: BillingPolicyConfig::default(),
            scheduler: SchedulerSettings {
                enabled: false,
                ..Default::default()
            },
            conflict_max_retries: 5,
            webhook_secret: None,
        }
    }

    pub fn lifecycle_policy(&self) -> LifecyclePolicy {
        LifecyclePolicy {
            grace_period: chrono::Duration::days(self.billing.grace_period_days),
            retry_interval: chrono::Duration::hours(self.billing.payment_retry_interval_hours),
            past_due_policy: self.billing.past_due_policy,
            incomplete_window: chrono::Duration::hours(self.billing.incomplete_expiry_hours),
            archive_retention: chrono::Duration::days(self.billing.archive_retention_days),
        }
    }

    pub fn conflict_retry(&self) -> ConflictRetryConfig {
        ConflictRetryConfig {
            max_retries: self.conflict_max_retries,
            ..Default::default()
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            enabled: self.scheduler.enabled,
            interval: Duration::from_secs(self.scheduler.interval_secs.max(1)),
            batch_size: self.scheduler.batch_size.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_matches_lifecycle_defaults() {
        let config = SubscriptionConfig::for_tests(PathBuf::from("catalog.json"));
        let policy = config.lifecycle_policy();
        let defaults = LifecyclePolicy::default();

        assert_eq!(policy.grace_period, defaults.grace_period);
        assert_eq!(policy.retry_interval, defaults.retry_interval);
        assert_eq!(policy.past_due_policy, defaults.past_due_policy);
        assert_eq!(policy.incomplete_window, defaults.incomplete_window);
        assert_eq!(policy.archive_retention, defaults.archive_retention);
    }

    #[test]
    fn scheduler_interval_is_never_zero() {
        let mut config = SubscriptionConfig::for_tests(PathBuf::from("catalog.json"));
        config.scheduler.interval_secs = 0;
        assert_eq!(config.scheduler_config().interval, Duration::from_secs(1));
    }
}
