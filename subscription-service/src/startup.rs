//! Application startup and lifecycle management.

use crate::config::SubscriptionConfig;
use crate::handlers::{analytics, plans, subscriptions, webhooks};
use crate::services::{
    get_metrics, init_metrics, CatalogHandle, InMemoryEventLog, InMemorySubscriptionRepository,
    PaymentGateway, SandboxGateway, Scheduler, SubscriptionEngine, SystemClock, TimeSource,
};
use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::json;
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::tracing::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: SubscriptionConfig,
    pub engine: Arc<SubscriptionEngine>,
    pub catalog: Arc<CatalogHandle>,
}

/// Health check endpoint for Docker/K8s liveness checks.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.engine.health_check().await {
        Ok(_) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": "subscription-service",
                    "version": env!("CARGO_PKG_VERSION")
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - repository unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "subscription-service",
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Readiness check endpoint for K8s readiness checks.
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if state.catalog.snapshot().is_empty() {
        tracing::warn!("Readiness check failed - plan catalog is empty");
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    match state.engine.health_check().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    let metrics = get_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        metrics,
    )
}

/// HTTP routes, without a listener.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .route("/plans", get(plans::list_plans))
        .route("/admin/catalog/reload", post(plans::reload_catalog))
        .route(
            "/subscriptions",
            post(subscriptions::create_subscription).get(subscriptions::list_subscriptions),
        )
        .route("/subscriptions/:id", get(subscriptions::get_subscription))
        .route(
            "/subscriptions/:id/upgrade",
            post(subscriptions::request_upgrade),
        )
        .route(
            "/subscriptions/:id/upgrade-preview",
            get(subscriptions::preview_upgrade),
        )
        .route(
            "/subscriptions/:id/downgrade",
            post(subscriptions::request_downgrade),
        )
        .route(
            "/subscriptions/:id/pending-change",
            delete(subscriptions::cancel_pending_change),
        )
        .route(
            "/subscriptions/:id/cancel",
            post(subscriptions::cancel_subscription),
        )
        .route(
            "/subscriptions/:id/resume",
            post(subscriptions::resume_subscription),
        )
        .route(
            "/subscriptions/:id/trial-extension",
            post(subscriptions::extend_trial),
        )
        .route("/subscriptions/:id/events", get(subscriptions::list_events))
        .route(
            "/users/:user_id/subscription",
            get(subscriptions::get_user_subscription),
        )
        .route("/webhooks/payments", post(webhooks::payment_webhook))
        .route("/analytics", get(analytics::get_analytics))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the wall clock and the sandbox gateway.
    pub async fn build(config: SubscriptionConfig) -> Result<Self, AppError> {
        Self::build_with(config, Arc::new(SystemClock), Arc::new(SandboxGateway::new())).await
    }

    /// Build the application with an injected clock and payment gateway.
    pub async fn build_with(
        config: SubscriptionConfig,
        clock: Arc<dyn TimeSource>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Result<Self, AppError> {
        init_metrics();

        let catalog = CatalogHandle::from_file(&config.plan_catalog_path).map_err(|e| {
            tracing::error!(
                error = %e,
                path = %config.plan_catalog_path.display(),
                "Failed to load plan catalog"
            );
            AppError::ConfigError(anyhow::Error::new(e))
        })?;
        let catalog = Arc::new(catalog);

        let engine = SubscriptionEngine::new(
            Arc::new(InMemorySubscriptionRepository::new()),
            Arc::new(InMemoryEventLog::new()),
            gateway,
            catalog.clone(),
            clock,
        )
        .with_policy(config.lifecycle_policy())
        .with_conflict_retry(config.conflict_retry());

        let state = AppState {
            config: config.clone(),
            engine: Arc::new(engine),
            catalog,
        };

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port = port, "Subscription service listener bound");

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn engine(&self) -> Arc<SubscriptionEngine> {
        self.state.engine.clone()
    }

    /// Serve HTTP and run the scheduler until the server stops or this
    /// future is dropped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let scheduler = Scheduler::new(
            self.state.engine.clone(),
            self.state.config.scheduler_config(),
        );
        let _scheduler_guard = scheduler.shutdown_token().drop_guard();
        tokio::spawn(scheduler.start());

        let app = router(self.state);

        tracing::info!(
            service = "subscription-service",
            version = env!("CARGO_PKG_VERSION"),
            port = self.port,
            "Service ready to accept connections"
        );

        axum::serve(self.listener, app).await.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
