//! Payment gateway boundary.
//!
//! The engine only ever talks to [`PaymentGateway`]. [`SandboxGateway`] is the
//! in-process implementation used by the binary and the test-suite.

use crate::error::SubscriptionError;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

/// Result reported by the gateway for one charge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeOutcome {
    Succeeded,
    Declined,
    /// Accepted but not settled; the result arrives later by webhook.
    Pending,
}

impl ChargeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChargeOutcome::Succeeded => "succeeded",
            ChargeOutcome::Declined => "declined",
            ChargeOutcome::Pending => "pending",
        }
    }

    pub fn from_success(success: bool) -> Self {
        if success {
            ChargeOutcome::Succeeded
        } else {
            ChargeOutcome::Declined
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ChargeOutcome::Succeeded)
    }
}

/// Why money is being collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargePurpose {
    FirstPayment,
    TrialConversion,
    Renewal,
    Retry,
    Upgrade,
}

impl ChargePurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChargePurpose::FirstPayment => "first_payment",
            ChargePurpose::TrialConversion => "trial_conversion",
            ChargePurpose::Renewal => "renewal",
            ChargePurpose::Retry => "retry",
            ChargePurpose::Upgrade => "upgrade",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeRequest {
    pub subscription_id: Uuid,
    /// Minor units.
    pub amount: i64,
    pub payment_method: String,
    pub purpose: ChargePurpose,
    /// Stable per logical charge so a retried command never double-bills.
    pub idempotency_key: String,
}

/// Zero-amount check of a payment method before a trial starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequest {
    pub user_id: Uuid,
    pub payment_method: String,
    pub idempotency_key: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn authorize(
        &self,
        request: &AuthorizationRequest,
    ) -> Result<ChargeOutcome, SubscriptionError>;

    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome, SubscriptionError>;
}

/// Charge seen by the sandbox, kept for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCharge {
    pub request: ChargeRequest,
    pub outcome: ChargeOutcome,
}

/// Deterministic gateway.
///
/// Payment methods starting with `pm_decline` are declined and ones starting
/// with `pm_pending` stay pending; everything else succeeds. Scripted
/// outcomes queued with [`SandboxGateway::script`] take precedence. Replaying
/// an idempotency key returns the first outcome without charging again.
#[derive(Debug, Default)]
pub struct SandboxGateway {
    scripted: Mutex<HashMap<String, VecDeque<ChargeOutcome>>>,
    settled: Mutex<HashMap<String, ChargeOutcome>>,
    charges: Mutex<Vec<RecordedCharge>>,
    unavailable: AtomicBool,
}

impl SandboxGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes for the next charges against `payment_method`.
    pub fn script(&self, payment_method: &str, outcomes: impl IntoIterator<Item = ChargeOutcome>) {
        self.scripted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(payment_method.to_string())
            .or_default()
            .extend(outcomes);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Charges actually made, in order. Idempotent replays are not included.
    pub fn charges(&self) -> Vec<RecordedCharge> {
        self.charges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Sum of successful charges.
    pub fn total_collected(&self) -> i64 {
        self.charges()
            .iter()
            .filter(|charge| charge.outcome.is_success())
            .map(|charge| charge.request.amount)
            .sum()
    }

    fn ensure_available(&self) -> Result<(), SubscriptionError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SubscriptionError::GatewayUnavailable(
                "sandbox gateway switched off".to_string(),
            ));
        }
        Ok(())
    }

    fn outcome_for(&self, payment_method: &str) -> ChargeOutcome {
        let scripted = self
            .scripted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(payment_method)
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| {
            if payment_method.starts_with("pm_decline") {
                ChargeOutcome::Declined
            } else if payment_method.starts_with("pm_pending") {
                ChargeOutcome::Pending
            } else {
                ChargeOutcome::Succeeded
            }
        })
    }
}

#[async_trait]
impl PaymentGateway for SandboxGateway {
    async fn authorize(
        &self,
        request: &AuthorizationRequest,
    ) -> Result<ChargeOutcome, SubscriptionError> {
        self.ensure_available()?;
        let outcome = if request.payment_method.starts_with("pm_decline") {
            ChargeOutcome::Declined
        } else {
            ChargeOutcome::Succeeded
        };
        tracing::debug!(
            user_id = %request.user_id,
            outcome = outcome.as_str(),
            "Sandbox authorization"
        );
        Ok(outcome)
    }

    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome, SubscriptionError> {
        self.ensure_available()?;

        let outcome = {
            let mut settled = self.settled.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(outcome) = settled.get(&request.idempotency_key) {
                tracing::debug!(
                    idempotency_key = %request.idempotency_key,
                    "Replayed charge returned cached outcome"
                );
                return Ok(*outcome);
            }
            let outcome = self.outcome_for(&request.payment_method);
            settled.insert(request.idempotency_key.clone(), outcome);
            outcome
        };

        self.charges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedCharge {
                request: request.clone(),
                outcome,
            });

        tracing::info!(
            subscription_id = %request.subscription_id,
            amount = request.amount,
            purpose = request.purpose.as_str(),
            outcome = outcome.as_str(),
            "Sandbox charge processed"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: &str, key: &str) -> ChargeRequest {
        ChargeRequest {
            subscription_id: Uuid::new_v4(),
            amount: 2000,
            payment_method: method.to_string(),
            purpose: ChargePurpose::Renewal,
            idempotency_key: key.to_string(),
        }
    }

    #[tokio::test]
    async fn payment_method_prefix_selects_outcome() {
        let gateway = SandboxGateway::new();
        let ok = gateway.charge(&request("pm_card", "a")).await.unwrap();
        let declined = gateway.charge(&request("pm_decline_1", "b")).await.unwrap();
        let pending = gateway.charge(&request("pm_pending", "c")).await.unwrap();

        assert_eq!(ok, ChargeOutcome::Succeeded);
        assert_eq!(declined, ChargeOutcome::Declined);
        assert_eq!(pending, ChargeOutcome::Pending);
    }

    #[tokio::test]
    async fn idempotency_key_prevents_double_charge() {
        let gateway = SandboxGateway::new();
        gateway.charge(&request("pm_card", "renewal:1")).await.unwrap();
        gateway.charge(&request("pm_card", "renewal:1")).await.unwrap();

        assert_eq!(gateway.charges().len(), 1);
        assert_eq!(gateway.total_collected(), 2000);
    }

    #[tokio::test]
    async fn scripted_outcomes_are_consumed_in_order() {
        let gateway = SandboxGateway::new();
        gateway.script(
            "pm_card",
            [ChargeOutcome::Declined, ChargeOutcome::Succeeded],
        );

        assert_eq!(
            gateway.charge(&request("pm_card", "1")).await.unwrap(),
            ChargeOutcome::Declined
        );
        assert_eq!(
            gateway.charge(&request("pm_card", "2")).await.unwrap(),
            ChargeOutcome::Succeeded
        );
        assert_eq!(
            gateway.charge(&request("pm_card", "3")).await.unwrap(),
            ChargeOutcome::Succeeded
        );
    }

    #[tokio::test]
    async fn unavailable_gateway_is_fatal() {
        let gateway = SandboxGateway::new();
        gateway.set_unavailable(true);
        let err = gateway.charge(&request("pm_card", "x")).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
