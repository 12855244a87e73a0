//! Services module for subscription-service.

pub mod analytics;
pub mod catalog;
pub mod clock;
pub mod engine;
pub mod event_log;
pub mod gateway;
pub mod lifecycle;
pub mod metrics;
pub mod projection;
pub mod proration;
pub mod repository;
pub mod retry;
pub mod scheduler;

pub use analytics::{AnalyticsReport, AnalyticsWindow};
pub use catalog::{CatalogError, CatalogHandle, PlanCatalog};
pub use clock::{ManualClock, SystemClock, TimeSource};
pub use engine::{CommandOutcome, SubscriptionEngine};
pub use event_log::{AppendOutcome, BillingEventLog, EventCursor, InMemoryEventLog};
pub use gateway::{ChargeOutcome, ChargePurpose, ChargeRequest, PaymentGateway, SandboxGateway};
pub use lifecycle::{Command, LifecyclePolicy};
pub use metrics::{get_metrics, init_metrics};
pub use proration::{PlanChangeKind, ProrationQuote};
pub use repository::{InMemorySubscriptionRepository, SubscriptionRepository};
pub use retry::ConflictRetryConfig;
pub use scheduler::{due_command, ScanReport, Scheduler, SchedulerConfig};
