//! Engine error taxonomy.

use crate::models::{PlanId, SubscriptionStatus};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Failure of a subscription command.
///
/// Every variant except the fatal ones is a rejection: the subscription is
/// left exactly as it was loaded.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("Cannot {command} a subscription in status {status}")]
    InvalidTransition {
        command: &'static str,
        status: SubscriptionStatus,
    },

    #[error("User {user_id} already holds subscription {subscription_id}")]
    AlreadySubscribed {
        user_id: Uuid,
        subscription_id: Uuid,
    },

    #[error("Subscription {0} is already canceled")]
    AlreadyCanceled(Uuid),

    #[error("Plan {from} cannot be upgraded to {to}")]
    NotUpgradable { from: PlanId, to: PlanId },

    #[error("Plan {from} cannot be downgraded to {to}")]
    NotDowngradable { from: PlanId, to: PlanId },

    #[error("Resume window for subscription {0} has closed")]
    ResumeWindowExpired(Uuid),

    #[error("Subscription {0} has a payment awaiting settlement")]
    PaymentPending(Uuid),

    #[error("Payment failed: {0}")]
    PaymentFailed(String),

    #[error("Subscription {id} was modified concurrently (expected version {expected}, found {actual})")]
    ConcurrentModification { id: Uuid, expected: u64, actual: u64 },

    #[error("Subscription {0} not found")]
    SubscriptionNotFound(Uuid),

    #[error("Plan {0} not found")]
    PlanNotFound(PlanId),

    #[error("Plan {0} is not open for new subscriptions")]
    PlanNotSubscribable(PlanId),

    #[error("Quantity must be at least 1, got {0}")]
    InvalidQuantity(u32),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Plan catalog corrupted: {0}")]
    CatalogCorruption(String),

    #[error("Payment gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("Storage failure: {0}")]
    Storage(#[from] anyhow::Error),
}

impl SubscriptionError {
    /// Stable machine-readable code for the error body.
    pub fn code(&self) -> &'static str {
        match self {
            SubscriptionError::InvalidTransition { .. } => "invalid_transition",
            SubscriptionError::AlreadySubscribed { .. } => "already_subscribed",
            SubscriptionError::AlreadyCanceled(_) => "already_canceled",
            SubscriptionError::NotUpgradable { .. } => "not_upgradable",
            SubscriptionError::NotDowngradable { .. } => "not_downgradable",
            SubscriptionError::ResumeWindowExpired(_) => "resume_window_expired",
            SubscriptionError::PaymentPending(_) => "payment_pending",
            SubscriptionError::PaymentFailed(_) => "payment_failed",
            SubscriptionError::ConcurrentModification { .. } => "concurrent_modification",
            SubscriptionError::SubscriptionNotFound(_) => "subscription_not_found",
            SubscriptionError::PlanNotFound(_) => "plan_not_found",
            SubscriptionError::PlanNotSubscribable(_) => "plan_not_subscribable",
            SubscriptionError::InvalidQuantity(_) => "invalid_quantity",
            SubscriptionError::InvalidRequest(_) => "invalid_request",
            SubscriptionError::CatalogCorruption(_) => "catalog_corruption",
            SubscriptionError::GatewayUnavailable(_) => "gateway_unavailable",
            SubscriptionError::Storage(_) => "storage_failure",
        }
    }

    /// Fatal errors indicate broken infrastructure and are surfaced to operators.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SubscriptionError::CatalogCorruption(_)
                | SubscriptionError::GatewayUnavailable(_)
                | SubscriptionError::Storage(_)
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            SubscriptionError::SubscriptionNotFound(_) | SubscriptionError::PlanNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            SubscriptionError::InvalidTransition { .. }
            | SubscriptionError::AlreadySubscribed { .. }
            | SubscriptionError::AlreadyCanceled(_)
            | SubscriptionError::PaymentPending(_)
            | SubscriptionError::ConcurrentModification { .. } => StatusCode::CONFLICT,
            SubscriptionError::NotUpgradable { .. }
            | SubscriptionError::NotDowngradable { .. }
            | SubscriptionError::ResumeWindowExpired(_)
            | SubscriptionError::PlanNotSubscribable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            SubscriptionError::InvalidQuantity(_) | SubscriptionError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            SubscriptionError::PaymentFailed(_) => StatusCode::PAYMENT_REQUIRED,
            SubscriptionError::CatalogCorruption(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SubscriptionError::GatewayUnavailable(_) | SubscriptionError::Storage(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }
}

impl IntoResponse for SubscriptionError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: String,
            code: &'static str,
        }

        let status = self.status_code();
        let error = if self.is_fatal() {
            tracing::error!(error = %self, code = self.code(), "Fatal subscription error");
            "Service unavailable".to_string()
        } else {
            self.to_string()
        };

        (
            status,
            Json(ErrorResponse {
                error,
                code: self.code(),
            }),
        )
            .into_response()
    }
}
