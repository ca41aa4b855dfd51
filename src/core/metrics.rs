//! Prometheus metrics for the subscription engine
//!
//! Counters are registered in the default registry and rendered by
//! [`render`] for the `/metrics` route of the webhook server.

// Metric definitions are static; a registration failure is a programming error.
#![allow(clippy::expect_used)]

use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec, Encoder, IntCounterVec, TextEncoder};

lazy_static! {
    /// Confirmed/failed payments applied to a record
    /// Labels: outcome (completed/failed/cancelled/duplicate), tariff
    pub static ref PAYMENTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "subgate_payments_total",
        "Payment events applied to subscription records",
        &["outcome", "tariff"]
    )
    .expect("register subgate_payments_total");

    /// Auto-renewal charge attempts
    /// Labels: outcome (renewed/failed/disabled/timeout)
    pub static ref RENEWALS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "subgate_renewals_total",
        "Auto-renewal charge attempts by outcome",
        &["outcome"]
    )
    .expect("register subgate_renewals_total");

    /// Group access revocations
    /// Labels: outcome (revoked/failed)
    pub static ref REVOCATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "subgate_revocations_total",
        "Group access revocations by outcome",
        &["outcome"]
    )
    .expect("register subgate_revocations_total");

    /// Notifications handed to the messenger
    /// Labels: kind, outcome (sent/failed)
    pub static ref NOTIFICATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "subgate_notifications_total",
        "User notifications by kind and outcome",
        &["kind", "outcome"]
    )
    .expect("register subgate_notifications_total");

    /// Inbound payment webhooks
    /// Labels: outcome (applied/duplicate/ignored/rejected/error)
    pub static ref WEBHOOKS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "subgate_webhooks_total",
        "Inbound payment webhooks by outcome",
        &["outcome"]
    )
    .expect("register subgate_webhooks_total");

    /// Collected revenue in minor currency units
    pub static ref REVENUE_MINOR_TOTAL: IntCounterVec = register_int_counter_vec!(
        "subgate_revenue_minor_total",
        "Revenue from completed payments in minor units",
        &["currency"]
    )
    .expect("register subgate_revenue_minor_total");
}

pub fn record_payment(outcome: &str, tariff: &str) {
    PAYMENTS_TOTAL.with_label_values(&[outcome, tariff]).inc();
}

pub fn record_revenue(currency: &str, amount_minor: i64) {
    if let Ok(amount) = u64::try_from(amount_minor) {
        REVENUE_MINOR_TOTAL.with_label_values(&[currency]).inc_by(amount);
    }
}

pub fn record_renewal(outcome: &str) {
    RENEWALS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_revocation(outcome: &str) {
    REVOCATIONS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_notification(kind: &str, sent: bool) {
    let outcome = if sent { "sent" } else { "failed" };
    NOTIFICATIONS_TOTAL.with_label_values(&[kind, outcome]).inc();
}

pub fn record_webhook(outcome: &str) {
    WEBHOOKS_TOTAL.with_label_values(&[outcome]).inc();
}

/// Renders all registered metrics in the Prometheus text format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        log::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_show_up_in_render() {
        record_renewal("renewed");
        record_webhook("rejected");
        record_revenue("RUB", 40_000);

        let text = render();
        assert!(text.contains("subgate_renewals_total"));
        assert!(text.contains("subgate_webhooks_total"));
        assert!(text.contains("subgate_revenue_minor_total"));
    }

    #[test]
    fn test_negative_revenue_is_ignored() {
        let before = REVENUE_MINOR_TOTAL.with_label_values(&["XXX"]).get();
        record_revenue("XXX", -5);
        assert_eq!(REVENUE_MINOR_TOTAL.with_label_values(&["XXX"]).get(), before);
    }
}
