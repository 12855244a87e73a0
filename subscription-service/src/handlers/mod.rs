//! HTTP handlers for subscription-service.

pub mod analytics;
pub mod plans;
pub mod subscriptions;
pub mod webhooks;

use crate::error::SubscriptionError;
use crate::models::{BillingEvent, SubscriptionView};
use crate::services::{projection, CommandOutcome, SubscriptionEngine};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use service_core::error::AppError;
use thiserror::Error;

/// Error returned by handlers: a domain rejection or an infrastructure failure.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error(transparent)]
    App(#[from] AppError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Subscription(e) => e.into_response(),
            ApiError::App(e) => e.into_response(),
        }
    }
}

/// Body returned by every command endpoint.
#[derive(Debug, Serialize)]
pub struct CommandResponse {
    pub subscription: SubscriptionView,
    pub events: Vec<BillingEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charged: Option<i64>,
    pub duplicate: bool,
}

impl CommandResponse {
    pub fn from_outcome(
        engine: &SubscriptionEngine,
        outcome: CommandOutcome,
    ) -> Result<Self, SubscriptionError> {
        let subscription =
            projection::project(&outcome.subscription, &engine.catalog(), engine.now())?;
        Ok(Self {
            subscription,
            events: outcome.events,
            charged: outcome.charged,
            duplicate: outcome.duplicate,
        })
    }
}
