//! Test helper module for subscription-service integration tests.
//!
//! Engine tests run against in-memory storage, a manual clock and the sandbox
//! gateway. HTTP tests spawn the full application on an ephemeral port.

#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::io::Write;
use std::sync::Arc;
use subscription_service::config::SubscriptionConfig;
use subscription_service::models::{BillingEventKind, CreateSubscription, PlanId};
use subscription_service::services::{
    init_metrics, CatalogHandle, CommandOutcome, InMemoryEventLog,
    InMemorySubscriptionRepository, LifecyclePolicy, ManualClock, PlanCatalog, SandboxGateway,
    Scheduler, SchedulerConfig, SubscriptionEngine, SystemClock,
};
use subscription_service::startup::Application;
use tempfile::NamedTempFile;
use uuid::Uuid;

pub const CATALOG_JSON: &str = r#"{
    "plans": [
        {"id": "starter", "name": "Starter", "price": 900, "billing_period": "monthly",
         "upgrades_to": ["basic"]},
        {"id": "basic", "name": "Basic", "price": 2000, "billing_period": "monthly",
         "upgrades_to": ["pro", "pro-yearly"], "downgrades_to": ["starter"]},
        {"id": "pro", "name": "Pro", "price": 5000, "billing_period": "monthly",
         "downgrades_to": ["basic", "starter"], "features": ["priority_support"]},
        {"id": "pro-yearly", "name": "Pro (yearly)", "price": 50000, "billing_period": "yearly",
         "downgrades_to": ["basic"]},
        {"id": "team-trial", "name": "Team", "price": 3000, "billing_period": "monthly",
         "trial_days": 14, "upgrades_to": ["pro"], "downgrades_to": ["starter"]},
        {"id": "legacy", "name": "Legacy", "price": 1500, "billing_period": "monthly",
         "retired": true, "upgrades_to": ["pro"]}
    ]
}"#;

/// 2024-06-01: a monthly period started here lasts exactly 30 days.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
}

pub fn catalog() -> PlanCatalog {
    PlanCatalog::from_json(CATALOG_JSON).expect("test catalog is valid")
}

pub fn request(user_id: Uuid, plan_id: &str, payment_method: &str) -> CreateSubscription {
    CreateSubscription {
        user_id,
        plan_id: PlanId::new(plan_id),
        quantity: 1,
        payment_method: payment_method.to_string(),
    }
}

/// Engine wired to in-memory storage, a manual clock and the sandbox gateway.
pub struct TestEngine {
    pub engine: Arc<SubscriptionEngine>,
    pub clock: ManualClock,
    pub gateway: Arc<SandboxGateway>,
    pub events: Arc<InMemoryEventLog>,
    pub catalog: Arc<CatalogHandle>,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with_policy(LifecyclePolicy::default())
    }

    pub fn with_policy(policy: LifecyclePolicy) -> Self {
        init_metrics();

        let clock = ManualClock::new(t0());
        let gateway = Arc::new(SandboxGateway::new());
        let events = Arc::new(InMemoryEventLog::new());
        let catalog = Arc::new(CatalogHandle::new(catalog()));

        let engine = SubscriptionEngine::new(
            Arc::new(InMemorySubscriptionRepository::new()),
            events.clone(),
            gateway.clone(),
            catalog.clone(),
            Arc::new(clock.clone()),
        )
        .with_policy(policy);

        Self {
            engine: Arc::new(engine),
            clock,
            gateway,
            events,
            catalog,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.engine.now()
    }

    pub fn advance(&self, by: Duration) -> DateTime<Utc> {
        self.clock.advance(by)
    }

    pub fn set_time(&self, at: DateTime<Utc>) {
        self.clock.set(at);
    }

    /// Subscribe a fresh user.
    pub async fn subscribe(&self, plan_id: &str, payment_method: &str) -> CommandOutcome {
        self.engine
            .subscribe(request(Uuid::new_v4(), plan_id, payment_method))
            .await
            .expect("subscribe succeeds")
    }

    /// Kinds of every event recorded for a subscription, in order.
    pub async fn event_kinds(&self, id: Uuid) -> Vec<BillingEventKind> {
        self.engine
            .events_for(id, None)
            .collect()
            .await
            .expect("events readable")
            .into_iter()
            .map(|event| event.kind)
            .collect()
    }

    pub async fn count_events(&self, id: Uuid, kind: BillingEventKind) -> usize {
        self.event_kinds(id)
            .await
            .into_iter()
            .filter(|k| *k == kind)
            .count()
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(self.engine.clone(), SchedulerConfig::default())
    }
}

/// Test application wrapper for HTTP tests.
pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub engine: Arc<SubscriptionEngine>,
    pub gateway: Arc<SandboxGateway>,
    pub client: reqwest::Client,
    pub catalog_file: NamedTempFile,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(|_| {}).await
    }

    /// Spawn with a config adjusted by `configure`, on a random port.
    pub async fn spawn_with(configure: impl FnOnce(&mut SubscriptionConfig)) -> Self {
        let mut catalog_file = NamedTempFile::new().expect("Failed to create catalog file");
        catalog_file
            .write_all(CATALOG_JSON.as_bytes())
            .expect("Failed to write catalog file");

        let mut config = SubscriptionConfig::for_tests(catalog_file.path().to_path_buf());
        configure(&mut config);

        let gateway = Arc::new(SandboxGateway::new());
        let app = Application::build_with(config, Arc::new(SystemClock), gateway.clone())
            .await
            .expect("Failed to build application");

        let port = app.port();
        let engine = app.engine();
        tokio::spawn(app.run_until_stopped());

        Self {
            address: format!("http://127.0.0.1:{}", port),
            port,
            engine,
            gateway,
            client: reqwest::Client::new(),
            catalog_file,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }
}
