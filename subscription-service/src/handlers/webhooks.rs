//! Payment gateway webhooks.
//!
//! Deliveries are at-least-once. The gateway's `event_id` is used as the
//! dedup key, so a redelivered event is acknowledged without being applied
//! twice.

use axum::{extract::State, http::HeaderMap, Json};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ApiError, CommandResponse};
use crate::error::SubscriptionError;
use crate::startup::AppState;
use service_core::error::AppError;
use service_core::utils::signature::verify_signature;

pub const TIMESTAMP_HEADER: &str = "x-webhook-timestamp";
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// Accepted clock skew between the gateway and this service.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentWebhookKind {
    /// Settles the first payment of an incomplete subscription.
    FirstPayment,
    /// Settles a renewal or dunning charge, or any charge the gateway left pending.
    Renewal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentWebhook {
    pub event_id: String,
    pub subscription_id: Uuid,
    pub kind: PaymentWebhookKind,
    pub success: bool,
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, AppError> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Missing {} header", name)))
}

fn verify(secret: &str, headers: &HeaderMap, body: &str, now: i64) -> Result<(), AppError> {
    let timestamp: i64 = header(headers, TIMESTAMP_HEADER)?
        .parse()
        .map_err(|_| AppError::Unauthorized(anyhow::anyhow!("Malformed webhook timestamp")))?;
    let signature = header(headers, SIGNATURE_HEADER)?;

    let valid = verify_signature(
        secret,
        timestamp,
        body,
        signature,
        now,
        SIGNATURE_TOLERANCE_SECS,
    )
    .map_err(AppError::InternalError)?;

    if valid {
        Ok(())
    } else {
        Err(AppError::Unauthorized(anyhow::anyhow!(
            "Invalid webhook signature"
        )))
    }
}

#[tracing::instrument(skip(state, headers, body))]
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<CommandResponse>, ApiError> {
    if let Some(secret) = state.config.webhook_secret.as_deref() {
        verify(secret, &headers, &body, state.engine.now().timestamp()).map_err(|e| {
            tracing::warn!(error = %e, "Webhook rejected");
            e
        })?;
    }

    let webhook: PaymentWebhook = serde_json::from_str(&body)
        .map_err(|e| SubscriptionError::InvalidRequest(format!("malformed webhook: {}", e)))?;
    if webhook.event_id.trim().is_empty() {
        return Err(SubscriptionError::InvalidRequest("event_id is required".to_string()).into());
    }

    tracing::info!(
        event_id = %webhook.event_id,
        subscription_id = %webhook.subscription_id,
        kind = ?webhook.kind,
        success = webhook.success,
        "Payment webhook received"
    );

    let dedup_key = Some(format!("webhook:{}", webhook.event_id));
    let outcome = match webhook.kind {
        PaymentWebhookKind::FirstPayment => {
            state
                .engine
                .confirm_payment(webhook.subscription_id, webhook.success, dedup_key)
                .await?
        }
        PaymentWebhookKind::Renewal => {
            state
                .engine
                .record_payment_result(webhook.subscription_id, webhook.success, dedup_key)
                .await?
        }
    };

    Ok(Json(CommandResponse::from_outcome(&state.engine, outcome)?))
}
