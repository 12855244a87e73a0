//! Metrics module for subscription-service.
//! Provides Prometheus metrics for lifecycle commands, charges and the scheduler.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_counter_vec, register_histogram_vec, register_int_counter_vec,
    CounterVec, Encoder, HistogramVec, IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Commands by name and outcome
pub static COMMANDS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Command duration histogram
pub static COMMAND_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Status transitions
pub static STATUS_TRANSITIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Gateway charges by purpose and outcome
pub static CHARGES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Collected minor units by purpose
pub static CHARGED_AMOUNT_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Scheduler dispatches by action and result
pub static SCHEDULER_DISPATCHES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Optimistic-lock conflicts retried
pub static CONFLICT_RETRIES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "subscription_conflict_retries_total",
            "Total optimistic concurrency conflicts retried"
        ),
        &["command"]
    )
    .expect("Failed to register CONFLICT_RETRIES_TOTAL")
});

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    COMMANDS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "subscription_commands_total",
                "Total subscription commands by command and outcome"
            ),
            &["command", "outcome"]
        )
        .expect("Failed to register COMMANDS_TOTAL")
    });

    COMMAND_DURATION.get_or_init(|| {
        register_histogram_vec!(
            histogram_opts!(
                "subscription_command_duration_seconds",
                "Subscription command duration",
                vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
            ),
            &["command"]
        )
        .expect("Failed to register COMMAND_DURATION")
    });

    STATUS_TRANSITIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "subscription_status_transitions_total",
                "Total subscription status transitions"
            ),
            &["from", "to"]
        )
        .expect("Failed to register STATUS_TRANSITIONS_TOTAL")
    });

    CHARGES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "subscription_charges_total",
                "Total gateway charges by purpose and outcome"
            ),
            &["purpose", "outcome"]
        )
        .expect("Failed to register CHARGES_TOTAL")
    });

    CHARGED_AMOUNT_TOTAL.get_or_init(|| {
        register_counter_vec!(
            opts!(
                "subscription_charged_amount_total",
                "Total collected minor units by purpose"
            ),
            &["purpose"]
        )
        .expect("Failed to register CHARGED_AMOUNT_TOTAL")
    });

    SCHEDULER_DISPATCHES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "subscription_scheduler_dispatches_total",
                "Total scheduler dispatches by action and result"
            ),
            &["action", "result"]
        )
        .expect("Failed to register SCHEDULER_DISPATCHES_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*CONFLICT_RETRIES_TOTAL;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record a finished command.
pub fn record_command(command: &str, outcome: &str, duration_secs: f64) {
    if let Some(counter) = COMMANDS_TOTAL.get() {
        counter.with_label_values(&[command, outcome]).inc();
    }
    if let Some(histogram) = COMMAND_DURATION.get() {
        histogram.with_label_values(&[command]).observe(duration_secs);
    }
}

/// Record a status transition.
pub fn record_transition(from: &str, to: &str) {
    if let Some(counter) = STATUS_TRANSITIONS_TOTAL.get() {
        counter.with_label_values(&[from, to]).inc();
    }
}

/// Record a gateway charge and, when successful, the amount collected.
pub fn record_charge(purpose: &str, outcome: &str, amount: i64) {
    if let Some(counter) = CHARGES_TOTAL.get() {
        counter.with_label_values(&[purpose, outcome]).inc();
    }
    if outcome == "succeeded" {
        if let Some(counter) = CHARGED_AMOUNT_TOTAL.get() {
            counter
                .with_label_values(&[purpose])
                .inc_by(amount.max(0) as f64);
        }
    }
}

/// Record a scheduler dispatch.
pub fn record_scheduler_dispatch(action: &str, result: &str) {
    if let Some(counter) = SCHEDULER_DISPATCHES_TOTAL.get() {
        counter.with_label_values(&[action, result]).inc();
    }
}

/// Record a retried optimistic-lock conflict.
pub fn record_conflict_retry(command: &str) {
    CONFLICT_RETRIES_TOTAL.with_label_values(&[command]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorded_commands_appear_in_text_output() {
        init_metrics();
        record_command("renew", "ok", 0.002);
        record_charge("renewal", "succeeded", 2000);

        let output = get_metrics();
        assert!(output.contains("subscription_commands_total"));
        assert!(output.contains("subscription_charged_amount_total"));
    }
}
